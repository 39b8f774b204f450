//! Locates the dot grid on a scanned page: rough bounds, intensity
//! statistics, then per-axis skew and pitch via shifted projection
//! histograms and the peak finder.

pub mod peaks;
pub mod sampler;

use tracing::{debug, trace};

use self::peaks::find_peaks;
use super::{Bitmap, CodecError, NDOT, NHYST};

/// Skew search range in 1/1024 units, about +-0.1 rad.
const MAX_SKEW: i64 = 2 * 1024 / 20;
const SKEW_STEP: i64 = 6;

#[derive(Clone, Debug)]
pub struct GridInfo {
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
    pub cmin: u8,
    pub cmax: u8,
    pub cmean: f64,
    /// First vertical grid line at y = 0, and the horizontal pitch.
    pub xpeak: f64,
    pub xstep: f64,
    /// Horizontal drift of vertical lines per pixel of y.
    pub xangle: f64,
    pub ypeak: f64,
    pub ystep: f64,
    pub yangle: f64,
    /// Block positions visible on the page.
    pub nposx: usize,
    pub nposy: usize,
}

/// Local contrast over a 3x3 stencil centered at (x, y).
fn contrast(bmp: &Bitmap, x: usize, y: usize) -> i64 {
    let mut lo = 255u8;
    let mut hi = 0u8;
    for dy in 0..3 {
        for dx in 0..3 {
            let p = bmp.pixel(x + dx - 1, y + dy - 1);
            lo = lo.min(p);
            hi = hi.max(p);
        }
    }
    (hi - lo) as i64
}

fn bounded_span(distr: &[i64], step: usize) -> Option<(usize, usize)> {
    let max = *distr.iter().max()?;
    if max == 0 {
        return None;
    }
    let first = distr.iter().position(|&v| v * 2 >= max)?;
    let last = distr.iter().rposition(|&v| v * 2 >= max)?;
    Some((first * step + 1, last * step + 1))
}

/// Projection histogram along one axis with rows (or columns) shifted by
/// `skew`/1024 pixels per pixel of the cross axis.
fn skewed_histogram(
    bmp: &Bitmap,
    xrange: (usize, usize),
    yrange: (usize, usize),
    skew: i64,
    vertical_lines: bool,
) -> Vec<i64> {
    let (xmin, xmax) = xrange;
    let (ymin, ymax) = yrange;
    let nbins = if vertical_lines {
        (xmax - xmin).min(NHYST)
    } else {
        (ymax - ymin).min(NHYST)
    };
    let mut hist = vec![0i64; nbins];

    if vertical_lines {
        let ystep = ((ymax - ymin) / 400).max(1);
        let mut y = ymin;
        while y < ymax {
            let shift = (y - ymin) as i64 * skew / 1024;
            let row = y * bmp.width;
            for x in xmin..xmax {
                let bin = (x - xmin) as i64 - shift;
                if bin >= 0 && (bin as usize) < nbins {
                    hist[bin as usize] += bmp.pixels[row + x] as i64;
                }
            }
            y += ystep;
        }
    } else {
        let xstep = ((xmax - xmin) / 400).max(1);
        let mut x = xmin;
        while x < xmax {
            let shift = (x - xmin) as i64 * skew / 1024;
            for y in ymin..ymax {
                let bin = (y - ymin) as i64 - shift;
                if bin >= 0 && (bin as usize) < nbins {
                    hist[bin as usize] += bmp.pixels[y * bmp.width + x] as i64;
                }
            }
            x += xstep;
        }
    }
    hist
}

/// Finds the best (origin, pitch, skew) for one axis, preferring small
/// skews through the 1/(|a|+10) score adjustment.
fn axis_fit(
    bmp: &Bitmap,
    xrange: (usize, usize),
    yrange: (usize, usize),
    vertical_lines: bool,
) -> Option<(f64, f64, f64, f64)> {
    let mut best: Option<(f64, f64, f64, f64)> = None;
    let mut best_score = 0.0f64;
    let mut skew = -MAX_SKEW;
    while skew <= MAX_SKEW {
        let hist = skewed_histogram(bmp, xrange, yrange, skew, vertical_lines);
        if let Some(fit) = find_peaks(&hist) {
            let score = fit.weight / ((skew.abs() + 10) as f64);
            if score > best_score {
                best_score = score;
                best = Some((fit.peak, fit.step, skew as f64 / 1024.0, fit.weight));
            }
        }
        skew += SKEW_STEP;
    }
    best
}

pub fn locate_grid(bmp: &Bitmap) -> Result<GridInfo, CodecError> {
    // Rough bounds from subsampled 3x3 contrast projections.
    let stepx = (bmp.width / 256).max(1);
    let stepy = (bmp.height / 256).max(1);
    let nsx = (bmp.width - 2) / stepx;
    let nsy = (bmp.height - 2) / stepy;
    let mut distrx = vec![0i64; nsx];
    let mut distry = vec![0i64; nsy];
    for sy in 0..nsy {
        for sx in 0..nsx {
            let c = contrast(bmp, sx * stepx + 1, sy * stepy + 1);
            distrx[sx] += c;
            distry[sy] += c;
        }
    }
    let (xmin, xmax) = bounded_span(&distrx, stepx).ok_or(CodecError::GridNotFound)?;
    let (ymin, ymax) = bounded_span(&distry, stepy).ok_or(CodecError::GridNotFound)?;
    let xmax = (xmax + stepx).min(bmp.width);
    let ymax = (ymax + stepy).min(bmp.height);
    if xmax - xmin < NDOT || ymax - ymin < NDOT {
        return Err(CodecError::GridNotFound);
    }
    debug!("grid bounds x {xmin}..{xmax}, y {ymin}..{ymax}");

    // Intensity statistics over the bounded region.
    let istep = (((xmax - xmin) * (ymax - ymin)) as f64).sqrt() as usize / 512 + 1;
    let mut cmin = 255u8;
    let mut cmax = 0u8;
    let mut sum = 0u64;
    let mut count = 0u64;
    let mut y = ymin;
    while y < ymax {
        let mut x = xmin;
        while x < xmax {
            let p = bmp.pixel(x, y);
            cmin = cmin.min(p);
            cmax = cmax.max(p);
            sum += p as u64;
            count += 1;
            x += istep;
        }
        y += istep;
    }
    let cmean = sum as f64 / count.max(1) as f64;

    // Per-axis skew and pitch.
    let (xfit_peak, xstep, xangle, xweight) = axis_fit(bmp, (xmin, xmax), (ymin, ymax), true)
        .ok_or(CodecError::GridNotFound)?;
    let (yfit_peak, ystep, yangle, yweight) = axis_fit(bmp, (xmin, xmax), (ymin, ymax), false)
        .ok_or(CodecError::GridNotFound)?;
    trace!(
        "axis fits: x {xfit_peak:.2}+{xstep:.3} angle {xangle:.4} w {xweight:.0}, \
         y {yfit_peak:.2}+{ystep:.3} angle {yangle:.4} w {yweight:.0}"
    );

    if xweight <= 0.0 || yweight <= 0.0 {
        return Err(CodecError::GridNotFound);
    }
    if xstep < NDOT as f64 || ystep < NDOT as f64 {
        return Err(CodecError::GridNotFound);
    }
    let ratio = xstep / ystep;
    if !(0.4..=2.5).contains(&ratio) {
        return Err(CodecError::GridNotFound);
    }

    // Renormalize the fitted origins from the histogram reference corner
    // to absolute coordinates at y = 0 (resp. x = 0).
    let xpeak = xmin as f64 + xfit_peak - ymin as f64 * xangle;
    let ypeak = ymin as f64 + yfit_peak - xmin as f64 * yangle;

    let nposx = (((xmax - xmin) as f64 / xstep).round() as usize).max(1);
    let nposy = (((ymax - ymin) as f64 / ystep).round() as usize).max(1);

    Ok(GridInfo {
        xmin,
        xmax,
        ymin,
        ymax,
        cmin,
        cmax,
        cmean,
        xpeak,
        xstep,
        xangle,
        ypeak,
        ystep,
        yangle,
        nposx,
        nposy,
    })
}
