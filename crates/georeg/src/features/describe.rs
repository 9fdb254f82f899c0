use std::sync::OnceLock;

use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::detect::Keypoint;

const PATTERN_SEED: u64 = 0x0b1e_c7ed;
const PATTERN_RADIUS: i32 = 13;

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Fixed pseudo-random test pairs `(x1, y1, x2, y2)` inside the patch.
fn sampling_pattern() -> &'static [[i32; 4]; 256] {
    static PATTERN: OnceLock<[[i32; 4]; 256]> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut pattern = [[0i32; 4]; 256];
        for pair in pattern.iter_mut() {
            loop {
                let candidate = [
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                    rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                ];
                if candidate[0] != candidate[2] || candidate[1] != candidate[3] {
                    *pair = candidate;
                    break;
                }
            }
        }
        pattern
    })
}

/// Steered BRIEF descriptors sampled from a smoothed image.
pub fn compute_descriptors(smoothed: &GrayImage, keypoints: &[Keypoint]) -> Vec<Descriptor> {
    keypoints
        .par_iter()
        .map(|kp| describe_one(smoothed, kp))
        .collect()
}

fn describe_one(image: &GrayImage, kp: &Keypoint) -> Descriptor {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (sin, cos) = kp.angle.sin_cos();
    let sample = |dx: i32, dy: i32| -> u8 {
        let rx = (dx as f64 * cos - dy as f64 * sin).round() as i64;
        let ry = (dx as f64 * sin + dy as f64 * cos).round() as i64;
        let px = (kp.x.round() as i64 + rx).clamp(0, w - 1);
        let py = (kp.y.round() as i64 + ry).clamp(0, h - 1);
        image.get_pixel(px as u32, py as u32)[0]
    };
    let mut bits = [0u64; 4];
    for (i, p) in sampling_pattern().iter().enumerate() {
        if sample(p[0], p[1]) < sample(p[2], p[3]) {
            bits[i / 64] |= 1u64 << (i % 64);
        }
    }
    Descriptor(bits)
}
