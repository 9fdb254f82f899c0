//! In-process keypoint detector, binary descriptor and matcher.
//!
//! Oriented FAST corners with rotated BRIEF descriptors, matched by
//! brute-force Hamming k-NN with a ratio test. Suitable for same-modality
//! oblique-vs-nadir matching after an intensity stretch.

mod describe;
mod detect;
mod matching;
mod preprocess;
mod rotation;

use image::GrayImage;
use serde::{Deserialize, Serialize};

pub use describe::{compute_descriptors, Descriptor};
pub use detect::{detect_keypoints, Keypoint};
pub use matching::{match_descriptors, remove_ambiguous_matches, FeatureMatch};
pub use preprocess::{intensity_stretch, smooth};
pub use rotation::estimate_relative_rotation;

/// Detector / descriptor / matcher parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// FAST-9 intensity threshold.
    pub fast_threshold: u8,
    /// Keypoints kept per image, strongest first.
    pub max_keypoints: usize,
    /// Non-maximum suppression cell size in pixels.
    pub nms_cell_px: f64,
    /// Gaussian sigma applied before sampling descriptors.
    pub descriptor_blur_sigma: f32,
    /// Lower percentile of the intensity stretch.
    pub stretch_low: f64,
    /// Upper percentile of the intensity stretch.
    pub stretch_high: f64,
    /// Best / second-best Hamming distance ratio.
    pub ratio: f32,
    /// A match is dropped when at least this many other matches share its
    /// query or train keypoint.
    pub duplicate_cutoff: usize,
    /// Minimum number of filtered matches before robust fitting.
    pub min_legal_matches: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            max_keypoints: 2000,
            nms_cell_px: 5.0,
            descriptor_blur_sigma: 2.0,
            stretch_low: 0.02,
            stretch_high: 0.98,
            ratio: 0.8,
            duplicate_cutoff: 2,
            min_legal_matches: 3,
        }
    }
}

/// Keypoints with their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Stretch, detect and describe one grey image.
pub fn extract_features(image: &GrayImage, config: &FeatureConfig) -> FeatureSet {
    let stretched = intensity_stretch(image, config.stretch_low, config.stretch_high);
    let keypoints = detect_keypoints(&stretched, config);
    let smoothed = smooth(&stretched, config.descriptor_blur_sigma);
    let descriptors = compute_descriptors(&smoothed, &keypoints);
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        keypoints = keypoints.len(),
        "extracted features"
    );
    FeatureSet {
        keypoints,
        descriptors,
    }
}

/// Match two feature sets and return `(query point, train point)` pairs
/// after the ratio test and the ambiguity filter.
pub fn match_features(
    query: &FeatureSet,
    train: &FeatureSet,
    config: &FeatureConfig,
) -> Vec<([f64; 2], [f64; 2])> {
    let raw = match_descriptors(&query.descriptors, &train.descriptors, config.ratio);
    let filtered = remove_ambiguous_matches(&raw, config.duplicate_cutoff);
    tracing::debug!(
        ratio_matches = raw.len(),
        filtered = filtered.len(),
        "matched descriptors"
    );
    filtered
        .iter()
        .map(|m| {
            let q = &query.keypoints[m.query];
            let t = &train.keypoints[m.train];
            ([q.x, q.y], [t.x, t.y])
        })
        .collect()
}
