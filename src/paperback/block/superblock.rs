//! The identification block written (many times) on every page.
//!
//! Layout within the 128-byte frame, all little-endian:
//! addr 0xFFFFFFFF (4) | datasize (4) | pagesize (4) | origsize (4) |
//! mode (1) | attributes (1) | page (2) | modified FILETIME (8) |
//! filecrc (2) | name (64) | crc (2) | ecc (32).
//!
//! With the ENCRYPTED mode bit set the name field is split: 32 bytes of
//! zero-padded name, then the 16-byte PBKDF2 salt and the 16-byte AES IV,
//! so that any single decoded superblock unlocks the stream.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use super::{RawBlock, BLOCK_SIZE};
use crate::paperback::{ModeFlags, FILENAME_SIZE, NDATA, SUPERBLOCK};

const DATASIZE_OFFSET: usize = 0;
const PAGESIZE_OFFSET: usize = 4;
const ORIGSIZE_OFFSET: usize = 8;
const MODE_OFFSET: usize = 12;
const ATTRIBUTES_OFFSET: usize = 13;
const PAGE_OFFSET: usize = 14;
const MODIFIED_OFFSET: usize = 16;
const FILECRC_OFFSET: usize = 24;
const NAME_OFFSET: usize = 26;

/// Name bytes available when the salt and IV share the name field.
pub const ENCRYPTED_NAME_SIZE: usize = 32;
const SALT_OFFSET: usize = NAME_OFFSET + ENCRYPTED_NAME_SIZE;
const IV_OFFSET: usize = SALT_OFFSET + 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperData {
    /// Size of the (compressed, possibly encrypted) stream.
    pub datasize: u32,
    /// Bytes of stream represented on one page.
    pub pagesize: u32,
    /// Size of the original (uncompressed) data.
    pub origsize: u32,
    pub mode: ModeFlags,
    pub attributes: u8,
    /// 1-based page number.
    pub page: u16,
    /// Windows FILETIME of last file modification.
    pub modified: u64,
    /// CRC of the compressed, decrypted stream.
    pub filecrc: u16,
    pub name: String,
    pub salt: Option<[u8; 16]>,
    pub iv: Option<[u8; 16]>,
}

impl SuperData {
    /// Identity tuple matching incoming superblocks to an in-flight file.
    pub fn identity(&self) -> (&str, ModeFlags, u64, u32, u32) {
        (
            self.name.as_str(),
            self.mode,
            self.modified,
            self.datasize,
            self.origsize,
        )
    }

    pub fn pack(&self) -> RawBlock {
        let mut payload = [0u8; NDATA];
        LittleEndian::write_u32(&mut payload[DATASIZE_OFFSET..], self.datasize);
        LittleEndian::write_u32(&mut payload[PAGESIZE_OFFSET..], self.pagesize);
        LittleEndian::write_u32(&mut payload[ORIGSIZE_OFFSET..], self.origsize);
        payload[MODE_OFFSET] = self.mode.bits();
        payload[ATTRIBUTES_OFFSET] = self.attributes;
        LittleEndian::write_u16(&mut payload[PAGE_OFFSET..], self.page);
        LittleEndian::write_u64(&mut payload[MODIFIED_OFFSET..], self.modified);
        LittleEndian::write_u16(&mut payload[FILECRC_OFFSET..], self.filecrc);

        let name_room = if self.mode.contains(ModeFlags::ENCRYPTED) {
            ENCRYPTED_NAME_SIZE - 1
        } else {
            FILENAME_SIZE - 1
        };
        let name = truncate_to_boundary(&self.name, name_room);
        payload[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());

        if self.mode.contains(ModeFlags::ENCRYPTED) {
            let salt = self.salt.expect("encrypted superblock without salt");
            let iv = self.iv.expect("encrypted superblock without iv");
            payload[SALT_OFFSET..SALT_OFFSET + 16].copy_from_slice(&salt);
            payload[IV_OFFSET..IV_OFFSET + 16].copy_from_slice(&iv);
        }

        RawBlock::pack(SUPERBLOCK, &payload)
    }

    /// Parses a corrected, CRC-valid frame whose address is the
    /// superblock sentinel. Rejects fields no valid encoder produces.
    pub fn try_from_block(block: &RawBlock) -> Result<SuperData> {
        if block.addr() != SUPERBLOCK {
            return Err(anyhow!("not a superblock: addr {:#010x}", block.addr()));
        }
        let payload = block.payload();
        debug_assert_eq!(payload.len(), BLOCK_SIZE - 38);

        let datasize = LittleEndian::read_u32(&payload[DATASIZE_OFFSET..]);
        let pagesize = LittleEndian::read_u32(&payload[PAGESIZE_OFFSET..]);
        let origsize = LittleEndian::read_u32(&payload[ORIGSIZE_OFFSET..]);
        let mode = ModeFlags::from_bits(payload[MODE_OFFSET])
            .ok_or_else(|| anyhow!("unknown mode bits {:#04x}", payload[MODE_OFFSET]))?;
        let attributes = payload[ATTRIBUTES_OFFSET];
        let page = LittleEndian::read_u16(&payload[PAGE_OFFSET..]);
        let modified = LittleEndian::read_u64(&payload[MODIFIED_OFFSET..]);
        let filecrc = LittleEndian::read_u16(&payload[FILECRC_OFFSET..]);

        if pagesize == 0 || pagesize % NDATA as u32 != 0 {
            return Err(anyhow!("implausible pagesize {pagesize}"));
        }
        if page == 0 {
            return Err(anyhow!("page numbers are 1-based"));
        }

        let (name_bytes, salt, iv) = if mode.contains(ModeFlags::ENCRYPTED) {
            let mut salt = [0u8; 16];
            salt.copy_from_slice(&payload[SALT_OFFSET..SALT_OFFSET + 16]);
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&payload[IV_OFFSET..IV_OFFSET + 16]);
            (
                &payload[NAME_OFFSET..NAME_OFFSET + ENCRYPTED_NAME_SIZE],
                Some(salt),
                Some(iv),
            )
        } else {
            (
                &payload[NAME_OFFSET..NAME_OFFSET + FILENAME_SIZE],
                None,
                None,
            )
        };
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = std::str::from_utf8(&name_bytes[..end])
            .map_err(|_| anyhow!("superblock name is not UTF-8"))?
            .to_string();
        if name.is_empty() {
            return Err(anyhow!("superblock with empty name"));
        }

        Ok(SuperData {
            datasize,
            pagesize,
            origsize,
            mode,
            attributes,
            page,
            modified,
            filecrc,
            name,
            salt,
            iv,
        })
    }
}

fn truncate_to_boundary(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::paperback::to_filetime;

    fn sample() -> SuperData {
        SuperData {
            datasize: 52200,
            pagesize: 52200,
            origsize: 131072,
            mode: ModeFlags::COMPRESSED,
            attributes: 0,
            page: 1,
            modified: to_filetime(1_700_000_000_000),
            filecrc: 0xBEEF,
            name: "backup.tar".into(),
            salt: None,
            iv: None,
        }
    }

    #[test]
    fn pack_parse_idempotent() {
        let sd = sample();
        let parsed = SuperData::try_from_block(&sd.pack()).unwrap();
        assert_eq!(parsed, sd);
        // Re-parsing the re-packed block yields identical fields again.
        assert_eq!(SuperData::try_from_block(&parsed.pack()).unwrap(), parsed);
    }

    #[test]
    fn encrypted_superblock_carries_salt_and_iv() {
        let mut sd = sample();
        sd.mode |= ModeFlags::ENCRYPTED;
        sd.salt = Some([0x11; 16]);
        sd.iv = Some([0x22; 16]);
        let parsed = SuperData::try_from_block(&sd.pack()).unwrap();
        assert_eq!(parsed.salt, Some([0x11; 16]));
        assert_eq!(parsed.iv, Some([0x22; 16]));
        assert_eq!(parsed.name, "backup.tar");
    }

    #[test]
    fn long_names_truncate_harder_when_encrypted() {
        let long = "x".repeat(100);
        let mut sd = sample();
        sd.name = long.clone();
        let parsed = SuperData::try_from_block(&sd.pack()).unwrap();
        assert_eq!(parsed.name.len(), FILENAME_SIZE - 1);

        sd.mode |= ModeFlags::ENCRYPTED;
        sd.salt = Some([1; 16]);
        sd.iv = Some([2; 16]);
        let parsed = SuperData::try_from_block(&sd.pack()).unwrap();
        assert_eq!(parsed.name.len(), ENCRYPTED_NAME_SIZE - 1);
    }

    #[test]
    fn garbage_address_rejected() {
        let block = RawBlock::pack(0x0000_1234, &[0u8; NDATA]);
        assert!(SuperData::try_from_block(&block).is_err());
    }
}
