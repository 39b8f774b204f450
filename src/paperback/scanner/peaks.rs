//! Histogram peak finder shared by the page-level grid locator and the
//! per-block sampler.
//!
//! Grid lines show up as dips in an intensity projection. A decaying
//! envelope turns dips into positive humps; humps become peaks, pairwise
//! distances vote for the grid pitch, and a least-squares line through
//! the chained peaks yields origin and step with sub-pixel precision.

use crate::paperback::{NPEAK, NHYST};

#[derive(Clone, Copy, Debug)]
pub struct PeakFit {
    /// Position of the first chained grid line.
    pub peak: f64,
    /// Grid pitch.
    pub step: f64,
    /// Mean height of the peaks used by the fit; 0 means no fit.
    pub weight: f64,
}

struct Peak {
    position: f64,
    height: i64,
}

pub fn find_peaks(hist: &[i64]) -> Option<PeakFit> {
    let n = hist.len().min(NHYST);
    if n < 8 {
        return None;
    }
    let hist = &hist[..n];
    let amax = *hist.iter().max().unwrap();
    let amin = *hist.iter().min().unwrap();
    if amax == amin {
        return None;
    }

    // Decaying envelope, forward then backward; the envelope minus the
    // histogram has positive humps at the dips.
    let decay = (amax - amin + 16) / 32;
    let mut envelope = vec![0i64; n];
    let mut level = hist[0];
    for (e, &h) in envelope.iter_mut().zip(hist.iter()) {
        level = (level - decay).max(h);
        *e = level;
    }
    level = hist[n - 1];
    for (e, &h) in envelope.iter_mut().zip(hist.iter()).rev() {
        level = (level - decay).max(h);
        *e = (*e).max(level);
    }
    let hump: Vec<i64> = envelope
        .iter()
        .zip(hist.iter())
        .map(|(e, h)| e - h)
        .collect();
    let hmax = *hump.iter().max().unwrap();
    if hmax <= 0 {
        return None;
    }

    // Extract up to NPEAK humps above 3/4 of the strongest; position is
    // the first moment of the run, height its local maximum.
    let limit = hmax * 3 / 4;
    let mut peaks: Vec<Peak> = Vec::new();
    let mut i = 0;
    while i < n && peaks.len() < NPEAK {
        if hump[i] < limit {
            i += 1;
            continue;
        }
        let mut moment = 0i64;
        let mut mass = 0i64;
        let mut height = 0i64;
        while i < n && hump[i] >= limit {
            moment += i as i64 * hump[i];
            mass += hump[i];
            height = height.max(hump[i]);
            i += 1;
        }
        let peak = Peak {
            position: moment as f64 / mass as f64,
            height,
        };
        match peaks.last() {
            Some(prev) if peak.height * 8 < prev.height => {} // runt, skip
            Some(prev) if prev.height * 8 < peak.height => {
                peaks.pop();
                peaks.push(peak);
            }
            _ => peaks.push(peak),
        }
    }
    if peaks.len() < 2 {
        return None;
    }

    // Pairwise distances vote for the pitch; the winner is the distance
    // whose window [d, d + d/33 + 1] collects the most votes.
    let mut dist_counts = vec![0u32; n];
    for i in 0..peaks.len() {
        for j in i + 1..peaks.len() {
            let d = (peaks[j].position - peaks[i].position) as usize;
            if d < n {
                dist_counts[d] += 1;
            }
        }
    }
    let mut best_dist = 0usize;
    let mut best_votes = 0u32;
    for d in 1..n {
        let hi = (d + d / 33 + 1).min(n - 1);
        let votes: u32 = dist_counts[d..=hi].iter().sum();
        if votes > best_votes {
            best_votes = votes;
            best_dist = d;
        }
    }
    if best_votes == 0 {
        return None;
    }
    let window_hi = (best_dist + best_dist / 33 + 1) as f64;

    // Chain peaks whose spacing falls inside the window and whose height
    // is at least a quarter of the strongest, then least-squares fit
    // position ~ peak + step * k.
    let strongest = peaks.iter().map(|p| p.height).max().unwrap();
    let eligible: Vec<bool> = peaks
        .iter()
        .map(|p| p.height * 4 >= strongest)
        .collect();
    let mut index: Vec<Option<i64>> = vec![None; peaks.len()];
    let mut anchored = false;
    for i in 0..peaks.len() {
        for j in i + 1..peaks.len() {
            if !eligible[i] || !eligible[j] {
                continue;
            }
            let d = peaks[j].position - peaks[i].position;
            if d < best_dist as f64 || d > window_hi {
                continue;
            }
            if index[i].is_none() && !anchored {
                index[i] = Some(0);
                anchored = true;
            }
            if let (Some(k), None) = (index[i], index[j]) {
                index[j] = Some(k + 1);
            }
        }
    }

    let mut sn = 0.0f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    let mut total_height = 0.0f64;
    for (p, k) in peaks.iter().zip(index.iter()) {
        if let Some(k) = k {
            let k = *k as f64;
            sn += 1.0;
            sx += k;
            sy += p.position;
            sxx += k * k;
            sxy += k * p.position;
            total_height += p.height as f64;
        }
    }
    if sn < 2.0 {
        return None;
    }
    let det = sn * sxx - sx * sx;
    if det.abs() < f64::EPSILON {
        return None;
    }
    let step = (sn * sxy - sx * sy) / det;
    let peak = (sy - step * sx) / sn;
    if step <= 0.0 {
        return None;
    }
    Some(PeakFit {
        peak,
        step,
        weight: total_height / sn,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn grid_histogram(n: usize, origin: usize, pitch: usize, depth: i64) -> Vec<i64> {
        let mut hist = vec![1000i64; n];
        let mut x = origin;
        while x < n {
            hist[x] = 1000 - depth;
            if x + 1 < n {
                hist[x + 1] = 1000 - depth / 2;
            }
            x += pitch;
        }
        hist
    }

    #[test]
    fn finds_regular_grid() {
        let hist = grid_histogram(700, 10, 35, 800);
        let fit = find_peaks(&hist).expect("fit");
        assert!((fit.step - 35.0).abs() < 0.5, "step {}", fit.step);
        assert!((fit.peak - 10.0).abs() < 1.5, "peak {}", fit.peak);
        assert!(fit.weight > 0.0);
    }

    #[test]
    fn flat_histogram_has_no_peaks() {
        assert!(find_peaks(&vec![500i64; 300]).is_none());
        assert!(find_peaks(&[1, 2, 3]).is_none());
    }

    #[test]
    fn two_lines_are_enough() {
        let mut hist = vec![900i64; 120];
        for x in [20usize, 90] {
            hist[x] = 50;
            hist[x + 1] = 80;
        }
        let fit = find_peaks(&hist).expect("fit");
        assert!((fit.step - 70.0).abs() < 1.0, "step {}", fit.step);
    }

    #[test]
    fn shallow_secondary_dips_ignored() {
        // Data columns dip to half the guard depth; only the deep dips
        // should chain into the fit.
        let mut hist = grid_histogram(700, 5, 35, 900);
        for x in (0..700).step_by(7) {
            if hist[x] == 1000 {
                hist[x] = 700;
            }
        }
        let fit = find_peaks(&hist).expect("fit");
        assert!((fit.step - 35.0).abs() < 1.0, "step {}", fit.step);
    }
}
