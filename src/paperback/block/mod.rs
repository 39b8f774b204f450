pub mod superblock;

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use super::{crc16, ecc, NDATA, SUPERBLOCK};

/// Framed block size on paper; one NDOT x NDOT dot matrix.
pub const BLOCK_SIZE: usize = 128;
/// Virtual zero bytes that extend the frame to a full RS codeword.
pub const RS_PAD: usize = ecc::NN - BLOCK_SIZE;
/// Bytes covered by the RS code as message: addr, payload and CRC.
pub const MESSAGE_SIZE: usize = BLOCK_SIZE - ecc::NROOTS;

const PAYLOAD_OFFSET: usize = 4;
const CRC_OFFSET: usize = PAYLOAD_OFFSET + NDATA;
const ECC_OFFSET: usize = MESSAGE_SIZE;

/// What a decoded frame turned out to be, discriminated by the address
/// field: the superblock sentinel, or the top 4 bits distinguishing plain
/// data blocks from parity blocks tagged with their group size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Super,
    Data { offset: u32 },
    Parity { offset: u32, ngroup: u32 },
}

/// One 128-byte framed block: `addr | payload | crc | ecc`.
#[derive(Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub bytes: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBlock")
            .field("addr", &format_args!("{:#010x}", self.addr()))
            .finish()
    }
}

impl RawBlock {
    /// Frames a payload: address and payload in place, then CRC-16 over
    /// both and the 32 RS parity bytes over the whole message prefix.
    pub fn pack(addr: u32, payload: &[u8]) -> RawBlock {
        assert_eq!(payload.len(), NDATA);
        let mut bytes = [0u8; BLOCK_SIZE];
        LittleEndian::write_u32(&mut bytes[..PAYLOAD_OFFSET], addr);
        bytes[PAYLOAD_OFFSET..CRC_OFFSET].copy_from_slice(payload);
        let crc = crc16::frame_crc(addr, payload);
        LittleEndian::write_u16(&mut bytes[CRC_OFFSET..ECC_OFFSET], crc);
        let parity = ecc::encode8(&bytes[..MESSAGE_SIZE], RS_PAD);
        bytes[ECC_OFFSET..].copy_from_slice(&parity);
        RawBlock { bytes }
    }

    pub fn from_bytes(bytes: [u8; BLOCK_SIZE]) -> RawBlock {
        RawBlock { bytes }
    }

    pub fn addr(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[..PAYLOAD_OFFSET])
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[PAYLOAD_OFFSET..CRC_OFFSET]
    }

    pub fn stored_crc(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[CRC_OFFSET..ECC_OFFSET])
    }

    pub fn crc_ok(&self) -> bool {
        crc16::frame_crc(self.addr(), self.payload()) == self.stored_crc()
    }

    /// Runs RS correction over the frame in place. Returns the number of
    /// corrected bytes or -1 when uncorrectable.
    pub fn correct(&mut self) -> i32 {
        ecc::decode8(&mut self.bytes, &[], RS_PAD)
    }

    pub fn classify(&self) -> BlockKind {
        let addr = self.addr();
        if addr == SUPERBLOCK {
            return BlockKind::Super;
        }
        let ngroup = addr >> 28;
        let offset = addr & 0x0FFF_FFFF;
        if ngroup == 0 {
            BlockKind::Data { offset }
        } else {
            BlockKind::Parity { offset, ngroup }
        }
    }
}

/// Packs a data block. The payload slice may be shorter than NDATA at the
/// end of the stream; the tail is zero-filled.
pub fn pack_data_block(offset: u32, payload: &[u8]) -> Result<RawBlock> {
    if offset & 0xF000_0000 != 0 {
        return Err(anyhow!("data block offset {offset:#x} overflows 28 bits"));
    }
    if payload.len() > NDATA {
        return Err(anyhow!("payload of {} bytes exceeds NDATA", payload.len()));
    }
    let mut data = [0u8; NDATA];
    data[..payload.len()].copy_from_slice(payload);
    Ok(RawBlock::pack(offset, &data))
}

/// Packs the parity block guarding `ngroup` consecutive data payloads
/// starting at `offset`: payload bytes start at 0xFF and accumulate the
/// XOR of every member.
pub fn pack_parity_block(offset: u32, ngroup: u32, members: &[&[u8]]) -> Result<RawBlock> {
    if offset & 0xF000_0000 != 0 {
        return Err(anyhow!("group offset {offset:#x} overflows 28 bits"));
    }
    let mut data = [0xFFu8; NDATA];
    for member in members {
        for (d, m) in data.iter_mut().zip(member.iter()) {
            *d ^= m;
        }
    }
    Ok(RawBlock::pack(offset | (ngroup << 28), &data))
}

#[cfg(test)]
mod test {
    use super::*;

    fn payload(seed: u8) -> [u8; NDATA] {
        let mut p = [0u8; NDATA];
        for (i, b) in p.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7) ^ seed;
        }
        p
    }

    #[test]
    fn packed_block_is_clean() {
        let block = RawBlock::pack(90 * 3, &payload(1));
        assert!(block.crc_ok());
        let mut copy = block.clone();
        assert_eq!(copy.correct(), 0);
        assert_eq!(copy, block);
    }

    #[test]
    fn classification() {
        let data = RawBlock::pack(0x0012_3450, &payload(2));
        assert_eq!(
            data.classify(),
            BlockKind::Data { offset: 0x0012_3450 }
        );

        let parity = pack_parity_block(900, 5, &[&payload(3), &payload(4)]).unwrap();
        assert_eq!(
            parity.classify(),
            BlockKind::Parity {
                offset: 900,
                ngroup: 5
            }
        );

        let sb = RawBlock::pack(SUPERBLOCK, &payload(5));
        assert_eq!(sb.classify(), BlockKind::Super);
    }

    #[test]
    fn corrupted_block_recovers() {
        let block = RawBlock::pack(90 * 7, &payload(9));
        let mut hit = block.clone();
        for i in 0..16usize {
            hit.bytes[i * 8 + 1] ^= 0xC3;
        }
        assert_eq!(hit.correct(), 16);
        assert_eq!(hit, block);
        assert!(hit.crc_ok());
    }

    #[test]
    fn parity_xor_identity() {
        let a = payload(11);
        let b = payload(12);
        let parity = pack_parity_block(0, 2, &[&a, &b]).unwrap();
        // parity ^ 0xFF ^ a equals b.
        let restored: Vec<u8> = parity
            .payload()
            .iter()
            .zip(a.iter())
            .map(|(p, x)| p ^ 0xFF ^ x)
            .collect();
        assert_eq!(&restored[..], &b[..]);
    }

    #[test]
    fn offset_overflow_rejected() {
        assert!(pack_data_block(0x1000_0000, &payload(0)).is_err());
    }
}
