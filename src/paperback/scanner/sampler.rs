//! Per-block sampling: bilinear affine read of the block's neighbourhood,
//! optional sharpening, local grid lock, then a shift and dot-size search
//! feeding the bit recogniser and the RS decoder.

use tracing::trace;

use super::{peaks::find_peaks, GridInfo};
use crate::paperback::{
    block::RawBlock,
    ecc,
    printer::BLOCK_CELLS,
    Bitmap, NDOT, SUBDX, SUBDY,
};

/// Outcome of reading one block position.
#[derive(Debug)]
pub enum BlockRead {
    /// RS-corrected and CRC-valid frame.
    Decoded { block: RawBlock, rs_errors: i32 },
    /// The local grid locked but no shift/dot-size combination decoded.
    Uncorrectable,
    /// No block structure at this position.
    NoBlock,
}

pub struct BlockSampler<'a> {
    bmp: &'a Bitmap,
    grid: &'a GridInfo,
    /// Keep searching after the first success and return the best result.
    best_mode: bool,
    sharpfactor: f64,
}

const GRID_BITS: usize = NDOT * NDOT;

/// Neighbourhood patterns for dot sizes 1..4.
const PATTERN1: &[(i32, i32)] = &[(0, 0)];
const PATTERN2: &[(i32, i32)] = &[(0, 0), (1, 0), (0, 1), (1, 1)];
const PATTERN3: &[(i32, i32)] = &[
    (-1, -1), (0, -1), (1, -1),
    (-1, 0), (0, 0), (1, 0),
    (-1, 1), (0, 1), (1, 1),
];
const PATTERN4: &[(i32, i32)] = &[
    (-1, -1), (0, -1), (1, -1), (2, -1),
    (-1, 0), (0, 0), (1, 0), (2, 0),
    (-1, 1), (0, 1), (1, 1), (2, 1),
    (-1, 2), (0, 2), (1, 2), (2, 2),
];

fn pattern(dotsize: usize) -> &'static [(i32, i32)] {
    match dotsize {
        1 => PATTERN1,
        2 => PATTERN2,
        3 => PATTERN3,
        _ => PATTERN4,
    }
}

/// Centroid of the intensity dip inside a window of the histogram, or
/// None when the window holds no line at least `depth_floor` deep.
fn locate_line(hist: &[i64], around: f64, halfwidth: f64, depth_floor: i64) -> Option<f64> {
    let lo = (around - halfwidth).floor().max(0.0) as usize;
    let hi = (((around + halfwidth).ceil()) as usize).min(hist.len().saturating_sub(1));
    if lo >= hi {
        return None;
    }
    let window = &hist[lo..=hi];
    let top = *window.iter().max()?;
    let bottom = *window.iter().min()?;
    if top - bottom < depth_floor {
        return None;
    }
    let cut = bottom + (top - bottom) / 4;
    let mut moment = 0f64;
    let mut mass = 0f64;
    for (i, &h) in window.iter().enumerate() {
        if h <= cut {
            let weight = (cut - h) as f64;
            moment += (lo + i) as f64 * weight;
            mass += weight;
        }
    }
    if mass <= 0.0 {
        return None;
    }
    Some(moment / mass)
}

/// Locks onto the block's leading guard line and pitch along one axis.
///
/// The peak finder handles the general case; when its fit is missing or
/// drifts more than 1/16 from the global pitch (a dense dot column can
/// fake a grid line), the guard lines are re-located directly inside
/// windows around their predicted positions.
fn axis_lock(
    hist: &[i64],
    global_step: f64,
    margin: f64,
    depth_floor: i64,
) -> Option<(f64, f64)> {
    if let Some(fit) = find_peaks(hist) {
        if (fit.step - global_step).abs() <= global_step / 16.0 {
            return Some((fit.peak, fit.step));
        }
    }
    let halfwidth = global_step / 8.0;
    let first = locate_line(hist, margin, halfwidth, depth_floor)?;
    let second = locate_line(hist, margin + global_step, halfwidth, depth_floor)?;
    let step = second - first;
    if (step - global_step).abs() > global_step / 16.0 {
        return None;
    }
    Some((first, step))
}

impl<'a> BlockSampler<'a> {
    pub fn new(bmp: &'a Bitmap, grid: &'a GridInfo, best_mode: bool) -> BlockSampler<'a> {
        // Sharpen only when the dot pitch is tight enough for ink to
        // bleed between neighbouring dots.
        let dotpitch = grid.xstep.min(grid.ystep) / BLOCK_CELLS as f64;
        let sharpfactor = ((3.5 - dotpitch) / 3.5).clamp(0.0, 1.0);
        BlockSampler {
            bmp,
            grid,
            best_mode,
            sharpfactor,
        }
    }

    fn bilinear(&self, x: f64, y: f64) -> f32 {
        let white = self.grid.cmax as f32;
        if x < 0.0 || y < 0.0 {
            return white;
        }
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        if x0 + 1 >= self.bmp.width || y0 + 1 >= self.bmp.height {
            return white;
        }
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        let idx = y0 * self.bmp.width + x0;
        let p00 = self.bmp.pixels[idx] as f32;
        let p10 = self.bmp.pixels[idx + 1] as f32;
        let p01 = self.bmp.pixels[idx + self.bmp.width] as f32;
        let p11 = self.bmp.pixels[idx + self.bmp.width + 1] as f32;
        p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy
    }

    /// Reads the block at grid position (posx, posy).
    pub fn read_block(&self, posx: usize, posy: usize) -> BlockRead {
        let grid = self.grid;
        let margin_x = grid.xstep / 8.0;
        let margin_y = grid.ystep / 8.0;
        let bufdx = (grid.xstep * 1.25).round() as usize + 2;
        let bufdy = (grid.ystep * 1.25).round() as usize + 2;

        let ox = grid.xpeak + grid.xstep * posx as f64 - margin_x;
        let oy = grid.ypeak + grid.ystep * posy as f64 - margin_y;

        // Affine sample of the neighbourhood; out-of-bitmap reads white.
        let mut buf = vec![0f32; bufdx * bufdy];
        for j in 0..bufdy {
            for i in 0..bufdx {
                let sx = ox + i as f64 + (oy + j as f64) * grid.xangle;
                let sy = oy + j as f64 + (ox + i as f64) * grid.yangle;
                buf[j * bufdx + i] = self.bilinear(sx, sy);
            }
        }
        if self.sharpfactor > 0.05 {
            buf = self.sharpen(&buf, bufdx, bufdy);
        }

        // Local grid lock from the projected histograms.
        let mut hx = vec![0i64; bufdx];
        let mut hy = vec![0i64; bufdy];
        for j in 0..bufdy {
            for i in 0..bufdx {
                let v = buf[j * bufdx + i] as i64;
                hx[i] += v;
                hy[j] += v;
            }
        }
        let depth_x = (self.grid.cmax as i64 - self.grid.cmin as i64) * bufdy as i64 / 8;
        let depth_y = (self.grid.cmax as i64 - self.grid.cmin as i64) * bufdx as i64 / 8;
        let Some((xpeak_local, xstep_local)) = axis_lock(&hx, grid.xstep, margin_x, depth_x)
        else {
            trace!("block ({posx},{posy}): no horizontal lock");
            return BlockRead::NoBlock;
        };
        let Some((ypeak_local, ystep_local)) = axis_lock(&hy, grid.ystep, margin_y, depth_y)
        else {
            trace!("block ({posx},{posy}): no vertical lock");
            return BlockRead::NoBlock;
        };

        let dotstep_x = xstep_local / BLOCK_CELLS as f64;
        let dotstep_y = ystep_local / BLOCK_CELLS as f64;
        let origin_x = xpeak_local + 2.0 * dotstep_x;
        let origin_y = ypeak_local + 2.0 * dotstep_y;
        let maxdotsize = (dotstep_x.min(dotstep_y).floor() as usize).clamp(1, 4);

        let mut best: Option<(RawBlock, i32)> = None;
        for dotsize in 1..=maxdotsize {
            // Nine grids for the +-1 pixel shifts around the dot centers.
            let mut grids = Vec::with_capacity(9);
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    grids.push(self.sample_grid(
                        &buf, bufdx, bufdy, origin_x, origin_y, dotstep_x, dotstep_y, dx, dy,
                        dotsize,
                    ));
                }
            }

            // Centered grid first; the max-dispersion composite only when
            // the centered read fails.
            let recognized = self
                .recognize(&grids[4])
                .or_else(|| self.recognize(&self.composite(&grids)));
            if let Some((block, rs_errors)) = recognized {
                if !self.best_mode {
                    return BlockRead::Decoded { block, rs_errors };
                }
                match &best {
                    Some((_, e)) if *e <= rs_errors => {}
                    _ => best = Some((block, rs_errors)),
                }
            }
        }

        match best {
            Some((block, rs_errors)) => BlockRead::Decoded { block, rs_errors },
            None => BlockRead::Uncorrectable,
        }
    }

    /// Five-point unsharp mask clamped to the page's intensity range.
    fn sharpen(&self, buf: &[f32], bufdx: usize, bufdy: usize) -> Vec<f32> {
        let k = self.sharpfactor as f32;
        let lo = self.grid.cmin as f32;
        let hi = self.grid.cmax as f32;
        let mut out = buf.to_vec();
        for j in 1..bufdy - 1 {
            for i in 1..bufdx - 1 {
                let idx = j * bufdx + i;
                let v = buf[idx] * (1.0 + 4.0 * k)
                    - k * (buf[idx - 1] + buf[idx + 1] + buf[idx - bufdx] + buf[idx + bufdx]);
                out[idx] = v.clamp(lo, hi);
            }
        }
        out
    }

    /// Samples one NDOT x NDOT grid at the given pixel shift, averaging a
    /// dotsize-sized neighbourhood per dot.
    #[allow(clippy::too_many_arguments)]
    fn sample_grid(
        &self,
        buf: &[f32],
        bufdx: usize,
        bufdy: usize,
        origin_x: f64,
        origin_y: f64,
        dotstep_x: f64,
        dotstep_y: f64,
        shift_x: i32,
        shift_y: i32,
        dotsize: usize,
    ) -> Vec<f32> {
        let white = self.grid.cmax as f32;
        let pat = pattern(dotsize);
        let mut grid = vec![white; GRID_BITS];
        for row in 0..NDOT {
            let cy = (origin_y + row as f64 * dotstep_y).round() as i32 + shift_y;
            for col in 0..NDOT {
                let cx = (origin_x + col as f64 * dotstep_x).round() as i32 + shift_x;
                let mut sum = 0f32;
                for &(px, py) in pat {
                    let x = cx + px;
                    let y = cy + py;
                    if x >= 0 && y >= 0 && (x as usize) < bufdx && (y as usize) < bufdy {
                        sum += buf[y as usize * bufdx + x as usize];
                    } else {
                        sum += white;
                    }
                }
                grid[row * NDOT + col] = sum / pat.len() as f32;
            }
        }
        grid
    }

    /// Builds a composite grid: each SUBDX x SUBDY sub-block takes the
    /// shift with the highest intra-sub-block variance, the cleanest
    /// separation between ink and paper.
    fn composite(&self, grids: &[Vec<f32>]) -> Vec<f32> {
        let mut out = vec![0f32; GRID_BITS];
        for sub_y in 0..NDOT / SUBDY {
            for sub_x in 0..NDOT / SUBDX {
                let mut best_idx = 4;
                let mut best_var = f32::MIN;
                for (idx, grid) in grids.iter().enumerate() {
                    let mut sum = 0f32;
                    let mut sq = 0f32;
                    for dy in 0..SUBDY {
                        for dx in 0..SUBDX {
                            let v = grid[(sub_y * SUBDY + dy) * NDOT + sub_x * SUBDX + dx];
                            sum += v;
                            sq += v * v;
                        }
                    }
                    let n = (SUBDX * SUBDY) as f32;
                    let var = sq / n - (sum / n) * (sum / n);
                    if var > best_var {
                        best_var = var;
                        best_idx = idx;
                    }
                }
                let chosen = &grids[best_idx];
                for dy in 0..SUBDY {
                    for dx in 0..SUBDX {
                        let at = (sub_y * SUBDY + dy) * NDOT + sub_x * SUBDX + dx;
                        out[at] = chosen[at];
                    }
                }
            }
        }
        out
    }

    /// Thresholds the sampled grid into 128 bytes and validates them with
    /// the RS decoder and the frame CRC.
    fn recognize(&self, grid: &[f32]) -> Option<(RawBlock, i32)> {
        let threshold = (self.grid.cmin as f32 + self.grid.cmax as f32) / 2.0;
        let mut bytes = [0u8; GRID_BITS / 8];
        for (idx, &v) in grid.iter().enumerate() {
            if v < threshold {
                bytes[idx >> 3] |= 1 << (idx & 7);
            }
        }
        let mut block = RawBlock::from_bytes(bytes);
        let rs_errors = block.correct();
        if rs_errors < 0 || rs_errors as usize > ecc::NROOTS / 2 {
            return None;
        }
        if !block.crc_ok() {
            return None;
        }
        Some((block, rs_errors))
    }
}
