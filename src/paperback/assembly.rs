//! Multi-page file reassembly: a bounded table of in-flight files keyed
//! by the superblock identity tuple, block placement with field
//! validation, and per-page XOR erasure recovery.

use tracing::{debug, info, warn};

use super::{
    block::superblock::SuperData,
    from_filetime, stream, CodecError, NDATA, NFILE, NGROUPMAX,
};

/// A fully reassembled, decrypted and decompressed file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mtime_ms: i64,
}

/// Payload state per data block position.
const VALID_MISSING: u8 = 0;
const VALID_PAYLOAD: u8 = 1;
const VALID_PARITY: u8 = 2;

pub struct FileSlot {
    pub super_data: SuperData,
    pub nblock: usize,
    pub npages: usize,
    data: Vec<u8>,
    datavalid: Vec<u8>,
    /// Redundancy group size, learned from the first parity block.
    pub ngroup: u32,
    pub ndata: usize,
    pub goodblocks: usize,
    pub badblocks: usize,
    pub restoredbytes: usize,
    pub recoveredblocks: usize,
    pages_seen: Vec<bool>,
}

impl FileSlot {
    fn new(sd: SuperData) -> Result<FileSlot, CodecError> {
        if sd.datasize > 0x0FFF_FFFF {
            return Err(CodecError::InvalidParameter {
                name: "datasize",
                value: sd.datasize as i64,
            });
        }
        let nblock = (sd.datasize as usize).div_ceil(NDATA);
        let npages = (sd.datasize as usize).div_ceil(sd.pagesize as usize).max(1);
        Ok(FileSlot {
            nblock,
            npages,
            data: vec![0u8; nblock * NDATA],
            datavalid: vec![VALID_MISSING; nblock],
            ngroup: 0,
            ndata: 0,
            goodblocks: 0,
            badblocks: 0,
            restoredbytes: 0,
            recoveredblocks: 0,
            pages_seen: vec![false; npages],
            super_data: sd,
        })
    }

    fn matches(&self, sd: &SuperData) -> bool {
        self.super_data.identity() == sd.identity()
    }

    fn put_data(&mut self, offset: u32, payload: &[u8]) -> bool {
        if offset % NDATA as u32 != 0 || offset >= self.super_data.datasize {
            return false;
        }
        let idx = offset as usize / NDATA;
        if self.datavalid[idx] == VALID_PAYLOAD {
            return false;
        }
        self.data[idx * NDATA..(idx + 1) * NDATA].copy_from_slice(payload);
        self.datavalid[idx] = VALID_PAYLOAD;
        self.ndata += 1;
        self.goodblocks += 1;
        true
    }

    fn put_parity(&mut self, offset: u32, ngroup: u32, payload: &[u8]) -> bool {
        if ngroup > NGROUPMAX || ngroup == 0 {
            return false;
        }
        if offset >= self.super_data.datasize
            || offset % (ngroup * NDATA as u32) != 0
        {
            return false;
        }
        if self.ngroup == 0 {
            self.ngroup = ngroup;
        } else if self.ngroup != ngroup {
            warn!(
                "parity block for {} claims group size {ngroup}, file uses {}",
                self.super_data.name, self.ngroup
            );
            return false;
        }
        // Keep a copy in the group's leading position while its payload
        // is still missing; the real data block may overwrite it later.
        let idx = offset as usize / NDATA;
        if self.datavalid[idx] == VALID_MISSING {
            self.data[idx * NDATA..(idx + 1) * NDATA].copy_from_slice(payload);
            self.datavalid[idx] = VALID_PARITY;
        }
        true
    }

    /// Rebuilds the single missing member of a group from its parity:
    /// missing = 0xFF XOR parity XOR (XOR of the other payloads).
    fn recover_group(&mut self, offset: u32, ngroup: u32, parity: &[u8]) -> bool {
        let first = offset as usize / NDATA;
        let last = (first + ngroup as usize).min(self.nblock);
        let mut missing = None;
        for idx in first..last {
            if self.datavalid[idx] != VALID_PAYLOAD {
                if missing.is_some() {
                    return false;
                }
                missing = Some(idx);
            }
        }
        let Some(target) = missing else {
            return false;
        };
        let mut rebuilt = [0xFFu8; NDATA];
        for (r, p) in rebuilt.iter_mut().zip(parity.iter()) {
            *r ^= p;
        }
        for idx in first..last {
            if idx == target {
                continue;
            }
            let member = &self.data[idx * NDATA..(idx + 1) * NDATA];
            for (r, m) in rebuilt.iter_mut().zip(member.iter()) {
                *r ^= m;
            }
        }
        self.data[target * NDATA..(target + 1) * NDATA].copy_from_slice(&rebuilt);
        self.datavalid[target] = VALID_PAYLOAD;
        self.ndata += 1;
        self.recoveredblocks += 1;
        true
    }

    pub fn complete(&self) -> bool {
        self.ndata == self.nblock
    }

    pub fn missing_pages(&self) -> Vec<u16> {
        self.pages_seen
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(i, _)| i as u16 + 1)
            .collect()
    }
}

/// Per-slot state visible to callers for progress and diagnostics.
#[derive(Clone, Debug)]
pub struct SlotDiagnostics {
    pub name: String,
    pub ndata: usize,
    pub nblock: usize,
    pub goodblocks: usize,
    pub badblocks: usize,
    pub restoredbytes: usize,
    pub recoveredblocks: usize,
    pub missing_pages: Vec<u16>,
}

/// What one processed page did to the assembly state.
#[derive(Debug, Default)]
pub struct PageOutcome {
    pub file: String,
    pub page: u16,
    pub placed: usize,
    pub recovered: usize,
    /// Files finished by this page, with the result of the final
    /// decrypt/decompress stage.
    pub completed: Vec<(String, Result<DecodedFile, CodecError>)>,
}

#[derive(Default)]
pub struct Assembler {
    slots: Vec<FileSlot>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::default()
    }

    fn slot_for(&mut self, sd: &SuperData) -> Result<usize, CodecError> {
        if let Some(idx) = self.slots.iter().position(|s| s.matches(sd)) {
            return Ok(idx);
        }
        if self.slots.len() >= NFILE {
            return Err(CodecError::TooManyFiles);
        }
        info!(
            "new file on paper: {} ({} stream bytes, {} original)",
            sd.name, sd.datasize, sd.origsize
        );
        self.slots.push(FileSlot::new(sd.clone())?);
        Ok(self.slots.len() - 1)
    }

    /// Folds one decoded page into the assembly state. `data_blocks` and
    /// `parity_blocks` come from the page's RS/CRC-valid frames;
    /// `badblocks` and `restoredbytes` are the page's sampling counters.
    pub fn process_page(
        &mut self,
        sd: SuperData,
        data_blocks: &[(u32, [u8; NDATA])],
        parity_blocks: &[(u32, u32, [u8; NDATA])],
        badblocks: usize,
        restoredbytes: usize,
        password: Option<&str>,
    ) -> Result<PageOutcome, CodecError> {
        let idx = self.slot_for(&sd)?;
        let slot = &mut self.slots[idx];
        slot.badblocks += badblocks;
        slot.restoredbytes += restoredbytes;
        if (sd.page as usize) <= slot.npages {
            slot.pages_seen[sd.page as usize - 1] = true;
        }

        let mut outcome = PageOutcome {
            file: sd.name.clone(),
            page: sd.page,
            ..PageOutcome::default()
        };

        for (offset, payload) in data_blocks {
            if slot.put_data(*offset, payload) {
                outcome.placed += 1;
            }
        }
        for (offset, ngroup, payload) in parity_blocks {
            slot.put_parity(*offset, *ngroup, payload);
        }

        // Page-end erasure recovery over every group this page carried a
        // parity block for.
        for (offset, ngroup, payload) in parity_blocks {
            if slot.recover_group(*offset, *ngroup, payload) {
                outcome.recovered += 1;
            }
        }
        debug!(
            "page {} of {}: {} placed, {} recovered, {}/{} blocks",
            sd.page, sd.name, outcome.placed, outcome.recovered, slot.ndata, slot.nblock
        );

        if slot.complete() {
            let slot = self.slots.remove(idx);
            let sd = &slot.super_data;
            let result = stream::restore(
                &slot.data[..sd.datasize as usize],
                sd,
                password,
            )
            .map(|bytes| DecodedFile {
                name: sd.name.clone(),
                bytes,
                mtime_ms: from_filetime(sd.modified),
            });
            outcome.completed.push((sd.name.clone(), result));
        }
        Ok(outcome)
    }

    pub fn diagnostics(&self) -> Vec<SlotDiagnostics> {
        self.slots
            .iter()
            .map(|s| SlotDiagnostics {
                name: s.super_data.name.clone(),
                ndata: s.ndata,
                nblock: s.nblock,
                goodblocks: s.goodblocks,
                badblocks: s.badblocks,
                restoredbytes: s.restoredbytes,
                recoveredblocks: s.recoveredblocks,
                missing_pages: s.missing_pages(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
