use std::f64::consts::TAU;

const NUM_BINS: usize = 180;
const PEAK_SEPARATION: f64 = 0.9;
/// Pairwise accumulation is quadratic; larger match sets are subsampled.
const MAX_MATCHES: usize = 500;
const SMOOTHING_KERNEL: [f64; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Rotation in degrees `[0, 360)` of the second point set relative to the
/// first, from a histogram of pairwise bearing differences.
///
/// Returns `None` when the histogram has no clearly dominant peak.
pub fn estimate_relative_rotation(pairs: &[([f64; 2], [f64; 2])]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let stride = pairs.len().div_ceil(MAX_MATCHES);
    let sample: Vec<_> = pairs.iter().step_by(stride).collect();

    let mut hist = [0.0f64; NUM_BINS];
    let to_bin = NUM_BINS as f64 / TAU;
    for (i, (a_i, b_i)) in sample.iter().enumerate() {
        for (j, (a_j, b_j)) in sample.iter().enumerate() {
            if i == j {
                continue;
            }
            let angle_a = (a_j[1] - a_i[1]).atan2(a_j[0] - a_i[0]);
            let angle_b = (b_j[1] - b_i[1]).atan2(b_j[0] - b_i[0]);
            let diff = (angle_a - angle_b).rem_euclid(TAU);
            let bin = ((diff * to_bin) as usize).min(NUM_BINS - 1);
            hist[bin] += 1.0;
        }
    }

    find_peak(&hist).map(|bin| bin as f64 * 360.0 / NUM_BINS as f64)
}

/// Index of the dominant bin of a circular histogram after smoothing, if the
/// runner-up is at most `PEAK_SEPARATION` of it.
fn find_peak(hist: &[f64]) -> Option<usize> {
    let n = hist.len();
    let half = SMOOTHING_KERNEL.len() / 2;
    let smoothed: Vec<f64> = (0..n)
        .map(|i| {
            SMOOTHING_KERNEL
                .iter()
                .enumerate()
                .map(|(k, w)| w * hist[(i + n + k - half) % n])
                .sum()
        })
        .collect();

    let (mut peak1, mut val1, mut val2) = (0usize, 0.0f64, 0.0f64);
    for (i, &v) in smoothed.iter().enumerate() {
        if v > val1 {
            val2 = val1;
            val1 = v;
            peak1 = i;
        } else if v > val2 {
            val2 = v;
        }
    }
    (val1 > 0.0 && val2 <= val1 * PEAK_SEPARATION).then_some(peak1)
}
