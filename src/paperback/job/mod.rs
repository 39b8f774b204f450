//! Encode and decode job drivers: linear state machines with progress
//! reporting and cooperative cancellation between steps.

use anyhow::Result;
use tracing::{debug, info};

use super::{
    assembly::{Assembler, DecodedFile, PageOutcome, SlotDiagnostics},
    block::{self, superblock::SuperData, BlockKind, RawBlock},
    printer::{raster::PageRaster, PageLayout},
    scanner::{
        locate_grid,
        sampler::{BlockRead, BlockSampler},
    },
    stream, to_filetime, Bitmap, CodecError, EncodeOptions, ModeFlags, NDATA,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeStage {
    Prepare,
    Compress,
    Encrypt,
    Layout,
    NextPage,
    Done,
}

/// One grayscale page ready for the container layer; `name` carries the
/// output stem, numbered when the file spans several pages.
pub struct PageImage {
    pub name: String,
    pub page: u16,
    pub npages: usize,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

pub enum EncodeEvent {
    Progress { stage: EncodeStage, percent: u8 },
    Page(PageImage),
}

pub struct EncodeJob {
    name: String,
    mtime_ms: i64,
    options: EncodeOptions,
    stage: EncodeStage,
    done_reported: bool,
    cancelled: bool,
    payload: Vec<u8>,
    origsize: u32,
    mode: ModeFlags,
    stream_data: Vec<u8>,
    filecrc: u16,
    salt: Option<[u8; 16]>,
    iv: Option<[u8; 16]>,
    layout: Option<PageLayout>,
    npages: usize,
    page: usize,
}

impl EncodeJob {
    pub fn new(name: &str, bytes: Vec<u8>, mtime_ms: i64, options: EncodeOptions) -> EncodeJob {
        EncodeJob {
            name: name.to_string(),
            mtime_ms,
            options,
            stage: EncodeStage::Prepare,
            done_reported: false,
            cancelled: false,
            payload: bytes,
            origsize: 0,
            mode: ModeFlags::empty(),
            stream_data: Vec::new(),
            filecrc: 0,
            salt: None,
            iv: None,
            layout: None,
            npages: 0,
            page: 0,
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn output_stem(&self, page: usize) -> String {
        let stem = match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => self.name.as_str(),
        };
        if self.npages > 1 {
            format!("{stem}_{:04}", page + 1)
        } else {
            stem.to_string()
        }
    }

    fn superblock_for_page(&self, layout: &PageLayout, page: usize) -> SuperData {
        SuperData {
            datasize: self.stream_data.len() as u32,
            pagesize: layout.pagesize as u32,
            origsize: self.origsize,
            mode: self.mode,
            attributes: 0,
            page: page as u16 + 1,
            modified: to_filetime(self.mtime_ms),
            filecrc: self.filecrc,
            name: self.name.clone(),
            salt: self.salt,
            iv: self.iv,
        }
    }

    /// Stream payload for one data block, zero-padded past the end.
    fn block_payload(&self, offset: usize) -> [u8; NDATA] {
        let mut payload = [0u8; NDATA];
        if offset < self.stream_data.len() {
            let end = (offset + NDATA).min(self.stream_data.len());
            payload[..end - offset].copy_from_slice(&self.stream_data[offset..end]);
        }
        payload
    }

    fn render_page(&self, page: usize) -> Result<PageImage, CodecError> {
        let layout = self.layout.as_ref().expect("layout before pages");
        let sd = self.superblock_for_page(layout, page);
        let super_frame = sd.pack();
        let pagebase = page * layout.pagesize;
        let gpp = layout.groups_per_page;
        let red = layout.redundancy;

        let mut raster = PageRaster::new(layout);
        if self.options.printborder {
            raster.draw_border(layout);
        }
        for k in 0..layout.nx * layout.ny {
            let bx = k % layout.nx;
            let by = k / layout.nx;
            let j = k / (gpp + 1);
            let rem = k % (gpp + 1);
            let frame: RawBlock = if rem == 0 || j > red {
                super_frame.clone()
            } else if j < red {
                let offset = pagebase + ((rem - 1) * red + j) * NDATA;
                block::pack_data_block(offset as u32, &self.block_payload(offset))
                    .map_err(|_| CodecError::InvalidParameter {
                        name: "stream offset",
                        value: offset as i64,
                    })?
            } else {
                let offset = pagebase + (rem - 1) * red * NDATA;
                let members: Vec<[u8; NDATA]> =
                    (0..red).map(|m| self.block_payload(offset + m * NDATA)).collect();
                let refs: Vec<&[u8]> = members.iter().map(|m| m.as_slice()).collect();
                block::pack_parity_block(offset as u32, red as u32, &refs).map_err(|_| {
                    CodecError::InvalidParameter {
                        name: "stream offset",
                        value: offset as i64,
                    }
                })?
            };
            raster.draw_block(layout, bx, by, &frame);
        }
        raster.draw_closing_lines(layout);

        Ok(PageImage {
            name: self.output_stem(page),
            page: page as u16 + 1,
            npages: self.npages,
            width: raster.width,
            height: raster.height,
            pixels: raster.pixels,
        })
    }

    /// Terminal failure: no further events after the error.
    fn fail(&mut self, e: anyhow::Error) -> Option<Result<EncodeEvent>> {
        self.stage = EncodeStage::Done;
        self.done_reported = true;
        Some(Err(e))
    }

    fn step(&mut self) -> Option<Result<EncodeEvent>> {
        match self.stage {
            EncodeStage::Prepare => {
                if let Err(e) = self.options.validate() {
                    return self.fail(e.into());
                }
                self.stage = EncodeStage::Compress;
                Some(Ok(EncodeEvent::Progress {
                    stage: EncodeStage::Prepare,
                    percent: 5,
                }))
            }
            EncodeStage::Compress => {
                self.origsize = self.payload.len() as u32;
                let (compressed, did_compress) =
                    match stream::compress(&self.payload, self.options.compress) {
                        Ok(r) => r,
                        Err(e) => return self.fail(e),
                    };
                if did_compress {
                    self.mode |= ModeFlags::COMPRESSED;
                }
                // The original buffer is no longer needed once the
                // stream exists.
                self.payload = Vec::new();
                self.stream_data = compressed;
                self.stage = EncodeStage::Encrypt;
                Some(Ok(EncodeEvent::Progress {
                    stage: EncodeStage::Compress,
                    percent: 15,
                }))
            }
            EncodeStage::Encrypt => {
                if let Some(password) = self.options.password.clone() {
                    self.filecrc = stream::padded_stream_crc(&self.stream_data);
                    match stream::encrypt(&self.stream_data, &password) {
                        Ok((data, salt, iv)) => {
                            self.stream_data = data;
                            self.salt = Some(salt);
                            self.iv = Some(iv);
                            self.mode |= ModeFlags::ENCRYPTED;
                        }
                        Err(e) => return self.fail(e),
                    }
                } else {
                    self.filecrc = super::crc16::stream_crc(&self.stream_data);
                }
                self.stage = EncodeStage::Layout;
                Some(Ok(EncodeEvent::Progress {
                    stage: EncodeStage::Encrypt,
                    percent: 30,
                }))
            }
            EncodeStage::Layout => {
                let layout = match PageLayout::compute(&self.options) {
                    Ok(layout) => layout,
                    Err(e) => return self.fail(e.into()),
                };
                if self.stream_data.len() as u64 + layout.pagesize as u64 >= 1 << 28 {
                    return self.fail(
                        CodecError::InvalidParameter {
                            name: "file too large for 28-bit addressing",
                            value: self.stream_data.len() as i64,
                        }
                        .into(),
                    );
                }
                self.npages = self.stream_data.len().div_ceil(layout.pagesize).max(1);
                if self.npages > u16::MAX as usize {
                    return self.fail(
                        CodecError::InvalidParameter {
                            name: "page count",
                            value: self.npages as i64,
                        }
                        .into(),
                    );
                }
                info!(
                    "{}: {} stream bytes over {} page(s) of {} bytes",
                    self.name, self.stream_data.len(), self.npages, layout.pagesize
                );
                self.layout = Some(layout);
                self.stage = EncodeStage::NextPage;
                Some(Ok(EncodeEvent::Progress {
                    stage: EncodeStage::Layout,
                    percent: 35,
                }))
            }
            EncodeStage::NextPage => {
                if self.page >= self.npages {
                    self.stage = EncodeStage::Done;
                    return self.step();
                }
                let image = match self.render_page(self.page) {
                    Ok(image) => image,
                    Err(e) => return self.fail(e.into()),
                };
                self.page += 1;
                debug!("rendered page {}/{}", self.page, self.npages);
                Some(Ok(EncodeEvent::Page(image)))
            }
            EncodeStage::Done => {
                if self.done_reported {
                    return None;
                }
                self.done_reported = true;
                Some(Ok(EncodeEvent::Progress {
                    stage: EncodeStage::Done,
                    percent: 100,
                }))
            }
        }
    }
}

impl Iterator for EncodeJob {
    type Item = Result<EncodeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancelled {
            return None;
        }
        self.step()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStage {
    LoadBitmap,
    FindGrid,
    FindAngles,
    Prepare,
    DecodeBlocks,
    Finish,
}

/// What one fed page produced.
#[derive(Debug, Default)]
pub struct PageReport {
    /// File this page belongs to; None when no superblock decoded.
    pub file: Option<String>,
    pub page: u16,
    /// Block positions attempted on the grid.
    pub positions: usize,
    /// RS/CRC-valid frames of any kind.
    pub goodblocks: usize,
    /// Frames the RS decoder or CRC rejected.
    pub badblocks: usize,
    /// New payload blocks placed into the file.
    pub placed: usize,
    /// Blocks rebuilt by XOR erasure recovery.
    pub recovered: usize,
    /// Bytes repaired by the RS decoder across the page.
    pub restoredbytes: usize,
    pub completed: Vec<(String, Result<DecodedFile, CodecError>)>,
}

type ProgressFn = Box<dyn FnMut(DecodeStage, u8)>;

pub struct DecodeJob {
    assembler: Assembler,
    password: Option<String>,
    best_quality: bool,
    cancelled: bool,
    progress: Option<ProgressFn>,
}

impl DecodeJob {
    pub fn new(password: Option<String>) -> DecodeJob {
        DecodeJob {
            assembler: Assembler::new(),
            password,
            best_quality: false,
            cancelled: false,
            progress: None,
        }
    }

    /// Keep searching shifts and dot sizes for the lowest-error read of
    /// every block instead of stopping at the first success.
    pub fn with_best_quality(mut self, best: bool) -> DecodeJob {
        self.best_quality = best;
        self
    }

    pub fn set_progress(&mut self, f: ProgressFn) {
        self.progress = Some(f);
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn report(&mut self, stage: DecodeStage, percent: u8) {
        if let Some(f) = &mut self.progress {
            f(stage, percent);
        }
    }

    /// Runs the full per-page pipeline and folds the result into the
    /// reassembly state. Grid-level failures are fatal for the page only;
    /// the job accepts further pages afterwards.
    pub fn feed_page(&mut self, bmp: &Bitmap) -> Result<PageReport, CodecError> {
        self.report(DecodeStage::LoadBitmap, 0);
        self.report(DecodeStage::FindGrid, 5);
        let grid = locate_grid(bmp)?;
        self.report(DecodeStage::FindAngles, 10);
        self.report(DecodeStage::Prepare, 15);
        let sampler = BlockSampler::new(bmp, &grid, self.best_quality);

        let mut report = PageReport::default();
        let mut super_data: Option<SuperData> = None;
        let mut data_blocks: Vec<(u32, [u8; NDATA])> = Vec::new();
        let mut parity_blocks: Vec<(u32, u32, [u8; NDATA])> = Vec::new();

        let total = grid.nposx * grid.nposy;
        for posy in 0..grid.nposy {
            for posx in 0..grid.nposx {
                if self.cancelled {
                    return Err(CodecError::Cancelled);
                }
                report.positions += 1;
                match sampler.read_block(posx, posy) {
                    BlockRead::Decoded { block, rs_errors } => {
                        report.goodblocks += 1;
                        report.restoredbytes += rs_errors as usize;
                        let mut payload = [0u8; NDATA];
                        payload.copy_from_slice(block.payload());
                        match block.classify() {
                            BlockKind::Super => {
                                if super_data.is_none() {
                                    match SuperData::try_from_block(&block) {
                                        Ok(sd) => super_data = Some(sd),
                                        Err(e) => debug!("superblock rejected: {e}"),
                                    }
                                }
                            }
                            BlockKind::Data { offset } => data_blocks.push((offset, payload)),
                            BlockKind::Parity { offset, ngroup } => {
                                parity_blocks.push((offset, ngroup, payload))
                            }
                        }
                    }
                    BlockRead::Uncorrectable => report.badblocks += 1,
                    BlockRead::NoBlock => {}
                }
                let done = posy * grid.nposx + posx + 1;
                self.report(
                    DecodeStage::DecodeBlocks,
                    (15 + done * 80 / total.max(1)) as u8,
                );
            }
        }

        self.report(DecodeStage::Finish, 95);
        let Some(sd) = super_data else {
            debug!("page without a decodable superblock");
            return Ok(report);
        };
        report.file = Some(sd.name.clone());
        report.page = sd.page;

        let outcome: PageOutcome = self.assembler.process_page(
            sd,
            &data_blocks,
            &parity_blocks,
            report.badblocks,
            report.restoredbytes,
            self.password.as_deref(),
        )?;
        report.placed = outcome.placed;
        report.recovered = outcome.recovered;
        report.completed = outcome.completed;
        self.report(DecodeStage::Finish, 100);
        Ok(report)
    }

    /// Diagnostics for files still missing blocks.
    pub fn unfinished(&self) -> Vec<SlotDiagnostics> {
        self.assembler.diagnostics()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(job: EncodeJob) -> (Vec<EncodeStage>, Vec<PageImage>) {
        let mut stages = Vec::new();
        let mut pages = Vec::new();
        for event in job {
            match event.expect("encode step") {
                EncodeEvent::Progress { stage, .. } => stages.push(stage),
                EncodeEvent::Page(page) => pages.push(page),
            }
        }
        (stages, pages)
    }

    fn small_options() -> EncodeOptions {
        EncodeOptions {
            redundancy: 2,
            compress: 0,
            printborder: false,
            paper_width1000: 4000,
            paper_height1000: 4000,
            ..EncodeOptions::default()
        }
    }

    #[test]
    fn stages_run_in_order() {
        let job = EncodeJob::new("a.bin", vec![1, 2, 3], 0, small_options());
        let (stages, pages) = collect(job);
        assert_eq!(
            stages,
            vec![
                EncodeStage::Prepare,
                EncodeStage::Compress,
                EncodeStage::Encrypt,
                EncodeStage::Layout,
                EncodeStage::Done,
            ]
        );
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].name, "a");
        assert_eq!(pages[0].page, 1);
    }

    #[test]
    fn multi_page_names_are_numbered() {
        let options = small_options();
        let layout = PageLayout::compute(&options).unwrap();
        let bytes = vec![0x5Au8; layout.pagesize + 1];
        let job = EncodeJob::new("big.bin", bytes, 0, options);
        let (_, pages) = collect(job);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].name, "big_0001");
        assert_eq!(pages[1].name, "big_0002");
    }

    #[test]
    fn invalid_options_fail_fast() {
        let mut options = small_options();
        options.dpi = 1200;
        let mut job = EncodeJob::new("a.bin", vec![0u8; 10], 0, options);
        assert!(job.next().unwrap().is_err());
        assert!(job.next().is_none());
    }

    #[test]
    fn cancellation_stops_the_iterator() {
        let mut job = EncodeJob::new("a.bin", vec![0u8; 10], 0, small_options());
        assert!(job.next().is_some());
        job.cancel();
        assert!(job.next().is_none());
    }

    #[test]
    fn every_rendered_page_carries_the_superblock() {
        let options = small_options();
        let job = EncodeJob::new("sb.bin", vec![7u8; 500], 123_456_789_000, options);
        let (_, pages) = collect(job);
        let bmp = Bitmap::new(pages[0].width, pages[0].height, pages[0].pixels.clone()).unwrap();
        let grid = locate_grid(&bmp).unwrap();
        let sampler = BlockSampler::new(&bmp, &grid, false);
        // Cell 0 holds a superblock by layout.
        match sampler.read_block(0, 0) {
            BlockRead::Decoded { block, .. } => {
                let sd = SuperData::try_from_block(&block).unwrap();
                assert_eq!(sd.name, "sb.bin");
                assert_eq!(sd.page, 1);
                assert_eq!(sd.origsize, 500);
                assert_eq!(super::super::from_filetime(sd.modified), 123_456_789_000);
            }
            other => panic!("superblock cell unreadable: {other:?}"),
        }
    }
}
