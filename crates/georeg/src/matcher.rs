//! Target-to-reference image matching.
//!
//! [`ImageMatcher`] normalises the target to the reference ground
//! resolution, asks a [`FeatureMatcher`] backend for putative
//! correspondences, fits a robust homography and classifies the result.
//! Inliers and the returned transform are always expressed in the original
//! (un-resampled) target pixel space.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::GrayImage;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::confidence::{classify, Confidence, ConfidenceThresholds, MatchStatistics};
use crate::error::Error;
use crate::features::{self, estimate_relative_rotation, FeatureConfig};
use crate::homography::{fit_homography_robust, CorrespondenceSet, RansacHomographyConfig};
use crate::transform::GeoTransform;

/// How hard to look for a match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Fast,
    #[default]
    Thorough,
}

/// Image matcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Detector / descriptor parameters.
    pub features: FeatureConfig,
    /// Keypoint budget per image for [`MatchStrategy::Fast`].
    pub fast_max_keypoints: usize,
    /// Keypoint budget per image for [`MatchStrategy::Thorough`].
    pub thorough_max_keypoints: usize,
    /// Robust-fit parameters. `max_iters` is replaced per strategy.
    pub ransac: RansacHomographyConfig,
    /// RANSAC iterations for [`MatchStrategy::Fast`].
    pub fast_ransac_iters: usize,
    /// RANSAC iterations for [`MatchStrategy::Thorough`].
    pub thorough_ransac_iters: usize,
    /// The target is resampled when the scale factor differs from 1 by more
    /// than this.
    pub scale_tolerance: f64,
    /// Minimum area of the target footprint in the reference, as a fraction
    /// of the resampled target area.
    pub min_footprint_area_ratio: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            fast_max_keypoints: 1500,
            thorough_max_keypoints: 4000,
            ransac: RansacHomographyConfig::default(),
            fast_ransac_iters: 1000,
            thorough_ransac_iters: 4000,
            scale_tolerance: 0.10,
            min_footprint_area_ratio: 0.01,
        }
    }
}

/// Source of putative target→reference correspondences.
///
/// Points are in the pixel spaces of the images passed in.
pub trait FeatureMatcher: Send + Sync {
    fn correspondences(
        &self,
        target: &GrayImage,
        reference: &GrayImage,
        strategy: MatchStrategy,
    ) -> Result<CorrespondenceSet, Error>;
}

/// In-process ORB-style backend.
#[derive(Debug, Clone)]
pub struct OrbFeatureMatcher {
    features: FeatureConfig,
    fast_max_keypoints: usize,
    thorough_max_keypoints: usize,
}

impl OrbFeatureMatcher {
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            features: config.features.clone(),
            fast_max_keypoints: config.fast_max_keypoints,
            thorough_max_keypoints: config.thorough_max_keypoints,
        }
    }
}

impl Default for OrbFeatureMatcher {
    fn default() -> Self {
        Self::new(&MatcherConfig::default())
    }
}

impl FeatureMatcher for OrbFeatureMatcher {
    fn correspondences(
        &self,
        target: &GrayImage,
        reference: &GrayImage,
        strategy: MatchStrategy,
    ) -> Result<CorrespondenceSet, Error> {
        let mut config = self.features.clone();
        config.max_keypoints = match strategy {
            MatchStrategy::Fast => self.fast_max_keypoints,
            MatchStrategy::Thorough => self.thorough_max_keypoints,
        };
        let (target_features, reference_features) = rayon::join(
            || features::extract_features(target, &config),
            || features::extract_features(reference, &config),
        );
        if target_features.is_empty() || reference_features.is_empty() {
            return Err(Error::MatchFailed {
                reason: format!(
                    "no features (target {}, reference {})",
                    target_features.len(),
                    reference_features.len()
                ),
            });
        }
        let pairs = features::match_features(&target_features, &reference_features, &config);
        if pairs.len() < config.min_legal_matches {
            return Err(Error::MatchFailed {
                reason: format!(
                    "{} filtered matches, need {}",
                    pairs.len(),
                    config.min_legal_matches
                ),
            });
        }
        Ok(CorrespondenceSet::from_pairs(pairs))
    }
}

/// Outcome of one match attempt. Never an error for "no match".
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Original target pixel → reference pixel. Identity on failure.
    pub transform: GeoTransform,
    pub confidence: Confidence,
    /// Target pixel → reference pixel inlier pairs. Empty on failure.
    pub inliers: CorrespondenceSet,
    pub statistics: MatchStatistics,
    /// Why the attempt produced no transform.
    pub failure: Option<String>,
}

impl MatchOutcome {
    pub fn failed(reason: impl Into<String>, statistics: MatchStatistics) -> Self {
        Self {
            transform: GeoTransform::identity(),
            confidence: Confidence::None,
            inliers: CorrespondenceSet::new(),
            statistics,
            failure: Some(reason.into()),
        }
    }

    pub fn is_match(&self) -> bool {
        self.confidence > Confidence::None
    }
}

/// Scale-normalising robust matcher over a pluggable backend.
pub struct ImageMatcher<M = OrbFeatureMatcher> {
    backend: M,
    config: MatcherConfig,
    thresholds: ConfidenceThresholds,
}

impl ImageMatcher<OrbFeatureMatcher> {
    pub fn new(config: MatcherConfig, thresholds: ConfidenceThresholds) -> Self {
        let backend = OrbFeatureMatcher::new(&config);
        Self::with_backend(backend, config, thresholds)
    }
}

impl Default for ImageMatcher<OrbFeatureMatcher> {
    fn default() -> Self {
        Self::new(MatcherConfig::default(), ConfidenceThresholds::default())
    }
}

impl<M: FeatureMatcher> ImageMatcher<M> {
    pub fn with_backend(backend: M, config: MatcherConfig, thresholds: ConfidenceThresholds) -> Self {
        Self {
            backend,
            config,
            thresholds,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn thresholds(&self) -> &ConfidenceThresholds {
        &self.thresholds
    }

    /// Load two images from disk and match them.
    ///
    /// Missing or unreadable files are errors; a failed match is not.
    pub fn match_files(
        &self,
        target: &Path,
        reference: &Path,
        scale_factor: Option<f64>,
        strategy: MatchStrategy,
    ) -> Result<MatchOutcome, Error> {
        let target = image::open(target)?.to_luma8();
        let reference = image::open(reference)?.to_luma8();
        Ok(self.match_images(&target, &reference, scale_factor, strategy))
    }

    /// Match `target` against `reference`.
    ///
    /// `scale_factor` is target ground resolution divided by reference
    /// ground resolution (meters per pixel).
    pub fn match_images(
        &self,
        target: &GrayImage,
        reference: &GrayImage,
        scale_factor: Option<f64>,
        strategy: MatchStrategy,
    ) -> MatchOutcome {
        let (w, h) = target.dimensions();
        if w == 0 || h == 0 || reference.width() == 0 || reference.height() == 0 {
            return MatchOutcome::failed("empty image", MatchStatistics::default());
        }

        let k = match scale_factor {
            Some(k) if k.is_finite() && k > 0.0 => k,
            Some(k) => {
                tracing::warn!(scale_factor = k, "ignoring invalid scale factor");
                1.0
            }
            None => 1.0,
        };

        let resampled;
        let (work, kx, ky) = if (k - 1.0).abs() > self.config.scale_tolerance {
            let new_w = ((w as f64 * k).round() as u32).max(1);
            let new_h = ((h as f64 * k).round() as u32).max(1);
            tracing::debug!(k, new_w, new_h, "resampling target to reference scale");
            resampled = imageops::resize(target, new_w, new_h, FilterType::Triangle);
            (&resampled, new_w as f64 / w as f64, new_h as f64 / h as f64)
        } else {
            (target, 1.0, 1.0)
        };

        let putative = match self.backend.correspondences(work, reference, strategy) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!("feature matching failed: {}", e);
                return MatchOutcome::failed(e.to_string(), MatchStatistics::default());
            }
        };

        let mut statistics = MatchStatistics {
            candidate_matches: putative.len(),
            relative_rotation_deg: estimate_relative_rotation(
                &putative.iter().map(|c| (c.source, c.target)).collect::<Vec<_>>(),
            ),
            ..Default::default()
        };

        let ransac = RansacHomographyConfig {
            max_iters: match strategy {
                MatchStrategy::Fast => self.config.fast_ransac_iters,
                MatchStrategy::Thorough => self.config.thorough_ransac_iters,
            },
            ..self.config.ransac.clone()
        };
        let (h_work, inliers_work, ransac_stats) = match fit_homography_robust(&putative, &ransac) {
            Ok(fit) => fit,
            Err(e) => {
                tracing::warn!("homography RANSAC failed: {}", e);
                return MatchOutcome::failed(e.to_string(), statistics);
            }
        };
        statistics.inliers = ransac_stats.n_inliers;
        statistics.mean_residual_px = ransac_stats.mean_err;
        statistics.p95_residual_px = ransac_stats.p95_err;

        let confidence = classify(&statistics, &self.thresholds);
        if confidence == Confidence::None {
            return MatchOutcome::failed(
                format!("{} inliers below threshold", statistics.inliers),
                statistics,
            );
        }

        // Undo the resampling: H_orig = H_work * diag(kx, ky, 1).
        let h_orig = h_work * Matrix3::new(kx, 0.0, 0.0, 0.0, ky, 0.0, 0.0, 0.0, 1.0);
        let transform = match GeoTransform::from_matrix(h_orig) {
            Ok(t) => t,
            Err(e) => return MatchOutcome::failed(e.to_string(), statistics),
        };

        let min_area = self.config.min_footprint_area_ratio * (w as f64 * kx) * (h as f64 * ky);
        if let Err(reason) = check_footprint(&transform, w, h, min_area) {
            tracing::warn!("implausible transform: {}", reason);
            return MatchOutcome::failed(reason, statistics);
        }

        let inliers = inliers_work.map_sources(|s| Some([s[0] / kx, s[1] / ky]));
        tracing::info!(
            inliers = statistics.inliers,
            candidates = statistics.candidate_matches,
            mean_residual_px = statistics.mean_residual_px,
            %confidence,
            "matched target to reference"
        );
        MatchOutcome {
            transform,
            confidence,
            inliers,
            statistics,
            failure: None,
        }
    }
}

/// The target corners must map to a convex, correctly wound quadrilateral of
/// at least `min_area` square reference pixels.
fn check_footprint(t: &GeoTransform, w: u32, h: u32, min_area: f64) -> Result<(), String> {
    let (w, h) = (w as f64, h as f64);
    let mut quad = [[0.0f64; 2]; 4];
    for (q, c) in quad.iter_mut().zip([[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]]) {
        *q = t
            .try_forward(c)
            .ok_or_else(|| "target corner maps to infinity".to_string())?;
    }
    let cross = |a: [f64; 2], b: [f64; 2], c: [f64; 2]| {
        (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
    };
    let turns: Vec<f64> = (0..4)
        .map(|i| cross(quad[i], quad[(i + 1) % 4], quad[(i + 2) % 4]))
        .collect();
    let all_pos = turns.iter().all(|&v| v > 0.0);
    let all_neg = turns.iter().all(|&v| v < 0.0);
    if !(all_pos || all_neg) {
        return Err("footprint is not a convex quadrilateral".into());
    }
    let area = 0.5
        * (0..4)
            .map(|i| quad[i][0] * quad[(i + 1) % 4][1] - quad[(i + 1) % 4][0] * quad[i][1])
            .sum::<f64>();
    if area <= 0.0 {
        return Err("footprint is mirrored".into());
    }
    if area < min_area {
        return Err(format!("footprint area {area:.1} px² below {min_area:.1}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{crop, textured_canvas, FailingMatcher, SyntheticMatcher};
    use approx::assert_relative_eq;
    use image::Luma;

    #[test]
    fn real_matcher_recovers_translation() {
        let canvas = textured_canvas(420, 360, 11);
        let target = crop(&canvas, 60, 40, 300, 280);
        let reference = crop(&canvas, 20, 10, 320, 300);
        let matcher = ImageMatcher::default();
        let out = matcher.match_images(&target, &reference, None, MatchStrategy::Thorough);
        assert!(out.confidence >= Confidence::Low, "failure: {:?}", out.failure);
        let p = out.transform.forward([150.0, 140.0]);
        assert!((p[0] - 190.0).abs() < 1.5, "x = {}", p[0]);
        assert!((p[1] - 170.0).abs() < 1.5, "y = {}", p[1]);
        for c in &out.inliers {
            assert!((c.target[0] - c.source[0] - 40.0).abs() < 10.0);
        }
    }

    #[test]
    fn blank_reference_gives_identity_and_no_confidence() {
        let target = textured_canvas(256, 256, 3);
        let reference = GrayImage::from_pixel(256, 256, Luma([128]));
        let out = ImageMatcher::default().match_images(&target, &reference, None, MatchStrategy::Fast);
        assert_eq!(out.confidence, Confidence::None);
        assert!(out.transform.is_identity());
        assert!(out.inliers.is_empty());
        assert!(out.failure.is_some());
    }

    #[test]
    fn disjoint_content_does_not_match() {
        let target = textured_canvas(256, 256, 100);
        let reference = textured_canvas(256, 256, 200);
        let out = ImageMatcher::default().match_images(&target, &reference, None, MatchStrategy::Fast);
        assert_eq!(out.confidence, Confidence::None);
        assert!(out.transform.is_identity());
        assert!(out.inliers.is_empty());
    }

    #[test]
    fn backend_error_is_recovered() {
        let matcher = ImageMatcher::with_backend(
            FailingMatcher,
            MatcherConfig::default(),
            ConfidenceThresholds::default(),
        );
        let img = GrayImage::new(64, 64);
        let out = matcher.match_images(&img, &img, Some(1.0), MatchStrategy::Fast);
        assert_eq!(out.confidence, Confidence::None);
        assert!(out.transform.is_identity());
    }

    #[test]
    fn upscaled_target_inliers_are_in_original_space() {
        // Target pixels are half the reference ground size: resample by 0.5.
        #[rustfmt::skip]
        let truth = GeoTransform::from_matrix(Matrix3::new(
            0.5, 0.02, 30.0,
            -0.01, 0.5, 12.0,
            0.0, 0.0, 1.0,
        )).unwrap();
        let backend = SyntheticMatcher::new(truth, 800, 600);
        let matcher = ImageMatcher::with_backend(
            backend,
            MatcherConfig::default(),
            ConfidenceThresholds::default(),
        );
        let target = GrayImage::new(800, 600);
        let reference = GrayImage::new(500, 400);
        let out = matcher.match_images(&target, &reference, Some(0.5), MatchStrategy::Thorough);
        assert_eq!(out.confidence, Confidence::High);
        assert!(out.inliers.len() >= 20);
        for c in &out.inliers {
            // Synthetic sources lie on a 40 px grid of the original image.
            assert_relative_eq!(c.source[0], (c.source[0] / 40.0).round() * 40.0, epsilon = 1e-6);
            assert_relative_eq!(c.source[1], (c.source[1] / 40.0).round() * 40.0, epsilon = 1e-6);
            let expected = truth.forward(c.source);
            assert_relative_eq!(c.target[0], expected[0], epsilon = 1e-6);
            assert_relative_eq!(c.target[1], expected[1], epsilon = 1e-6);
        }
        for p in [[0.0, 0.0], [400.0, 300.0], [799.0, 599.0]] {
            let got = out.transform.forward(p);
            let want = truth.forward(p);
            assert_relative_eq!(got[0], want[0], epsilon = 1e-6);
            assert_relative_eq!(got[1], want[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn real_matcher_rescales_upsampled_target() {
        let canvas = textured_canvas(320, 300, 21);
        let reference = canvas.clone();
        let target_small = crop(&canvas, 40, 30, 240, 220);
        let target = imageops::resize(&target_small, 480, 440, FilterType::Triangle);
        let out = ImageMatcher::default().match_images(
            &target,
            &reference,
            Some(0.5),
            MatchStrategy::Thorough,
        );
        assert!(out.confidence >= Confidence::Low, "failure: {:?}", out.failure);
        let p = out.transform.forward([240.0, 220.0]);
        assert!((p[0] - 160.0).abs() < 3.0, "x = {}", p[0]);
        assert!((p[1] - 140.0).abs() < 3.0, "y = {}", p[1]);
        assert!(out.inliers.iter().any(|c| c.source[0] > 240.0));
    }

    #[test]
    fn small_scale_change_skips_resampling() {
        let truth = GeoTransform::scale_translate(1.0, 1.0, 5.0, -3.0).unwrap();
        let backend = SyntheticMatcher::new(truth, 400, 300);
        let matcher = ImageMatcher::with_backend(
            backend,
            MatcherConfig::default(),
            ConfidenceThresholds::default(),
        );
        let target = GrayImage::new(400, 300);
        let out = matcher.match_images(&target, &target, Some(1.05), MatchStrategy::Fast);
        assert_eq!(out.confidence, Confidence::High);
        let p = out.transform.forward([100.0, 100.0]);
        assert_relative_eq!(p[0], 105.0, epsilon = 1e-6);
        assert_relative_eq!(p[1], 97.0, epsilon = 1e-6);
    }

    #[test]
    fn footprint_rejects_mirror_and_collapse() {
        let mirror = GeoTransform::scale_translate(-1.0, 1.0, 100.0, 0.0).unwrap();
        assert!(check_footprint(&mirror, 100, 100, 1.0).is_err());
        let tiny = GeoTransform::scale_translate(0.001, 0.001, 0.0, 0.0).unwrap();
        assert!(check_footprint(&tiny, 100, 100, 1.0).is_err());
        let ok = GeoTransform::scale_translate(0.9, 1.1, 3.0, 4.0).unwrap();
        assert!(check_footprint(&ok, 100, 100, 1.0).is_ok());
    }
}
