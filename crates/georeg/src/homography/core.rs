//! Planar homography estimation via DLT with Hartley normalization.
//!
//! Provides:
//! - Direct Linear Transform (DLT) from ≥4 point correspondences.
//! - RANSAC wrapper for outlier-robust fitting.
//! - Reprojection error computation.

use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ── Error type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HomographyError {
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("source and destination lengths differ ({src} != {dst})")]
    LengthMismatch { src: usize, dst: usize },
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
    #[error("insufficient inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

// ── Projection ───────────────────────────────────────────────────────────

/// Project a 2D point through a 3×3 homography: H * [x, y, 1]^T → [u, v].
///
/// Returns NaN coordinates for points mapped to the line at infinity.
pub fn homography_project(h: &Matrix3<f64>, x: f64, y: f64) -> [f64; 2] {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [p[0] / p[2], p[1] / p[2]]
}

/// Reprojection error: ||project(H, src) - dst||.
pub fn reprojection_error(h: &Matrix3<f64>, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    let p = homography_project(h, src[0], src[1]);
    let dx = p[0] - dst[0];
    let dy = p[1] - dst[1];
    (dx * dx + dy * dy).sqrt()
}

// ── Hartley normalization ────────────────────────────────────────────────

/// Compute a normalizing transform: translate centroid to origin, scale so
/// mean distance from origin is sqrt(2).
pub(crate) fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx: f64 = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy: f64 = pts.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist: f64 = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized: Vec<[f64; 2]> = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();

    (t, normalized)
}

/// Twice the signed area of triangle (a, b, c).
fn cross(a: &[f64; 2], b: &[f64; 2], c: &[f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// True when any three of the four sample points are (nearly) collinear.
///
/// The tolerance is relative to the squared extent of the sample.
fn sample_is_degenerate(pts: &[[f64; 2]; 4]) -> bool {
    let mut extent = 0.0f64;
    for i in 0..4 {
        for j in (i + 1)..4 {
            let d2 = (pts[i][0] - pts[j][0]).powi(2) + (pts[i][1] - pts[j][1]).powi(2);
            extent = extent.max(d2);
        }
    }
    if extent <= 0.0 {
        return true;
    }
    let tol = 1e-6 * extent;
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES
        .iter()
        .any(|t| cross(&pts[t[0]], &pts[t[1]], &pts[t[2]]).abs() < tol)
}

// ── DLT ──────────────────────────────────────────────────────────────────

/// Estimate homography from ≥4 point correspondences using DLT.
///
/// Returns the 3×3 homography H such that dst ≈ project(H, src).
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::LengthMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // Build 2n × 9 matrix A
    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        // Row 2i:   [  0  0  0 | -sx -sy -1 | dy*sx  dy*sy  dy ]
        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        // Row 2i+1: [ sx  sy  1 |  0  0  0 | -dx*sx -dx*sy -dx ]
        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // h is the eigenvector of the smallest eigenvalue of the 9×9 A^T A.
    let ata = a.transpose() * &a;
    let eig = nalgebra::SymmetricEigen::new(ata);

    let mut min_idx = 0;
    let mut min_val = eig.eigenvalues[0].abs();
    for i in 1..9 {
        let v = eig.eigenvalues[i].abs();
        if v < min_val {
            min_val = v;
            min_idx = i;
        }
    }
    let h_vec: Vec<f64> = (0..9).map(|j| eig.eigenvectors[(j, min_idx)]).collect();
    #[rustfmt::skip]
    let h_norm = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2],
        h_vec[3], h_vec[4], h_vec[5],
        h_vec[6], h_vec[7], h_vec[8],
    );

    // Denormalize: H = T_dst^-1 * H_norm * T_src
    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::NumericalFailure("T_dst not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    if !h.iter().all(|v| v.is_finite()) {
        return Err(HomographyError::NumericalFailure(
            "non-finite homography coefficients".into(),
        ));
    }

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}

// ── RANSAC ───────────────────────────────────────────────────────────────

/// RANSAC configuration for homography fitting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RansacHomographyConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iters: usize,
    /// Inlier threshold (reprojection error in destination units).
    pub inlier_threshold: f64,
    /// Minimum number of inliers for a valid model.
    pub min_inliers: usize,
    /// Random seed.
    pub seed: u64,
}

impl Default for RansacHomographyConfig {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            inlier_threshold: 10.0,
            min_inliers: 10,
            seed: 0,
        }
    }
}

/// Result of RANSAC homography fitting.
#[derive(Debug, Clone)]
pub struct RansacHomographyResult {
    /// The fitted homography.
    pub h: Matrix3<f64>,
    /// Boolean mask: true for inliers.
    pub inlier_mask: Vec<bool>,
    /// Number of inliers.
    pub n_inliers: usize,
    /// Per-correspondence reprojection errors under the final model.
    pub errors: Vec<f64>,
}

/// RANSAC statistics for homography fitting.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RansacStats {
    /// Number of candidate correspondences fed to RANSAC.
    pub n_candidates: usize,
    /// Number of inliers after RANSAC.
    pub n_inliers: usize,
    /// Inlier threshold in destination units.
    pub threshold: f64,
    /// Mean reprojection error of inliers.
    pub mean_err: f64,
    /// 95th percentile reprojection error of inliers.
    pub p95_err: f64,
}

/// Fit homography with RANSAC.
///
/// `src`: source points, `dst`: destination points (same length).
pub fn fit_homography_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    config: &RansacHomographyConfig,
) -> Result<RansacHomographyResult, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::LengthMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut best_inliers = 0usize;
    let mut best_mask: Vec<bool> = vec![false; n];
    let mut best_h: Option<Matrix3<f64>> = None;

    for _ in 0..config.max_iters {
        let indices = rand::seq::index::sample(&mut rng, n, 4);
        let s4 = [
            src[indices.index(0)],
            src[indices.index(1)],
            src[indices.index(2)],
            src[indices.index(3)],
        ];
        let d4 = [
            dst[indices.index(0)],
            dst[indices.index(1)],
            dst[indices.index(2)],
            dst[indices.index(3)],
        ];
        if sample_is_degenerate(&s4) || sample_is_degenerate(&d4) {
            continue;
        }

        let h = match estimate_homography_dlt(&s4, &d4) {
            Ok(h) => h,
            Err(_) => continue,
        };

        let mut count = 0usize;
        let mut mask = vec![false; n];
        for i in 0..n {
            let err = reprojection_error(&h, &src[i], &dst[i]);
            if err < config.inlier_threshold {
                mask[i] = true;
                count += 1;
            }
        }

        if count > best_inliers {
            best_inliers = count;
            best_mask = mask;
            best_h = Some(h);

            // Early exit if >90% inliers
            if count * 10 > n * 9 {
                break;
            }
        }
    }

    let Some(best_h) = best_h else {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers.max(4),
            found: 0,
        });
    };
    if best_inliers < config.min_inliers.max(4) {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers.max(4),
            found: best_inliers,
        });
    }

    // Refit using all inliers
    let inlier_src: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| src[i]).collect();
    let inlier_dst: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| dst[i]).collect();
    let h_refit = estimate_homography_dlt(&inlier_src, &inlier_dst).unwrap_or(best_h);

    // Recompute errors and mask with refined H; keep the sampled model if the
    // refit lost support.
    let (h_final, final_mask, errors, final_inliers) = {
        let refit = score_model(&h_refit, src, dst, config.inlier_threshold);
        if refit.2 >= best_inliers {
            (h_refit, refit.0, refit.1, refit.2)
        } else {
            let sampled = score_model(&best_h, src, dst, config.inlier_threshold);
            (best_h, sampled.0, sampled.1, sampled.2)
        }
    };

    Ok(RansacHomographyResult {
        h: h_final,
        inlier_mask: final_mask,
        n_inliers: final_inliers,
        errors,
    })
}

fn score_model(
    h: &Matrix3<f64>,
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    threshold: f64,
) -> (Vec<bool>, Vec<f64>, usize) {
    let mut mask = vec![false; src.len()];
    let mut errors = vec![0.0f64; src.len()];
    let mut count = 0usize;
    for i in 0..src.len() {
        let err = reprojection_error(h, &src[i], &dst[i]);
        errors[i] = err;
        if err < threshold {
            mask[i] = true;
            count += 1;
        }
    }
    (mask, errors, count)
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn make_test_homography() -> Matrix3<f64> {
        // Scale + translate + mild perspective
        #[rustfmt::skip]
        let h = Matrix3::new(
            0.9, 0.1, 640.0,
            -0.05, 1.1, 480.0,
            0.0001, -0.00005, 1.0,
        );
        h
    }

    #[test]
    fn test_dlt_exact_4points() {
        let h_true = make_test_homography();
        let src = [[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]];
        let dst: Vec<[f64; 2]> = src
            .iter()
            .map(|s| homography_project(&h_true, s[0], s[1]))
            .collect();

        let h_est = estimate_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let err = reprojection_error(&h_est, s, d);
            assert!(err < 1e-6, "reprojection error too large: {}", err);
        }
    }

    #[test]
    fn test_dlt_overdetermined() {
        let h_true = make_test_homography();
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                let s = [i as f64 * 200.0, j as f64 * 150.0];
                dst.push(homography_project(&h_true, s[0], s[1]));
                src.push(s);
            }
        }

        let h_est = estimate_homography_dlt(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(&dst) {
            let err = reprojection_error(&h_est, s, d);
            assert!(err < 1e-6, "reprojection error: {}", err);
        }
    }

    #[test]
    fn test_dlt_pixels_to_degrees() {
        // Pixel coordinates into a small geographic patch: the normalization
        // has to cope with very different magnitudes on each side.
        #[rustfmt::skip]
        let h_true = Matrix3::new(
            0.01, 0.0, 10.0,
            0.0, -0.01, 20.0,
            0.0, 0.0, 1.0,
        );
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                let s = [i as f64 * 400.0, j as f64 * 300.0];
                dst.push(homography_project(&h_true, s[0], s[1]));
                src.push(s);
            }
        }
        let h_est = estimate_homography_dlt(&src, &dst).unwrap();
        let p = homography_project(&h_est, 2000.0, 1500.0);
        assert_relative_eq!(p[0], 30.0, epsilon = 1e-8);
        assert_relative_eq!(p[1], 5.0, epsilon = 1e-8);
    }

    #[test]
    fn test_ransac_with_outliers() {
        let h_true = make_test_homography();
        let mut rng = StdRng::seed_from_u64(42);

        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..30 {
            let s = [(i % 6) as f64 * 60.0, (i / 6) as f64 * 60.0];
            let d = homography_project(&h_true, s[0], s[1]);
            let d = [
                d[0] + rng.gen_range(-0.5..0.5),
                d[1] + rng.gen_range(-0.5..0.5),
            ];
            src.push(s);
            dst.push(d);
        }
        for _ in 0..10 {
            src.push([rng.gen_range(0.0..300.0), rng.gen_range(0.0..240.0)]);
            dst.push([rng.gen_range(0.0..1280.0), rng.gen_range(0.0..960.0)]);
        }

        let config = RansacHomographyConfig {
            max_iters: 2000,
            inlier_threshold: 3.0,
            min_inliers: 10,
            seed: 99,
        };

        let result = fit_homography_ransac(&src, &dst, &config).unwrap();
        assert!(result.n_inliers >= 28, "only {} inliers", result.n_inliers);
        for i in 0..30 {
            let err = reprojection_error(&result.h, &src[i], &dst[i]);
            assert!(err < 3.0, "inlier {} has error {}", i, err);
        }
    }

    #[test]
    fn test_ransac_rejects_below_min_inliers() {
        let h_true = make_test_homography();
        let src: Vec<[f64; 2]> = (0..6)
            .map(|i| [(i % 3) as f64 * 50.0, (i / 3) as f64 * 70.0])
            .collect();
        let dst: Vec<[f64; 2]> = src
            .iter()
            .map(|s| homography_project(&h_true, s[0], s[1]))
            .collect();
        let config = RansacHomographyConfig {
            min_inliers: 10,
            ..Default::default()
        };
        let err = fit_homography_ransac(&src, &dst, &config).unwrap_err();
        assert_eq!(
            err,
            HomographyError::InsufficientInliers {
                needed: 10,
                found: 6
            }
        );
    }

    #[test]
    fn test_project_roundtrip() {
        let h = make_test_homography();
        let h_inv = h.try_inverse().unwrap();

        let p = [50.0, 75.0];
        let q = homography_project(&h, p[0], p[1]);
        let p_back = homography_project(&h_inv, q[0], q[1]);

        assert_relative_eq!(p[0], p_back[0], epsilon = 1e-8);
        assert_relative_eq!(p[1], p_back[1], epsilon = 1e-8);
    }

    #[test]
    fn test_too_few_points() {
        let src = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        let dst = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]];
        assert!(estimate_homography_dlt(&src, &dst).is_err());
    }

    #[test]
    fn test_collinear_sample_is_degenerate() {
        let pts = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [5.0, 0.0]];
        assert!(sample_is_degenerate(&pts));
        let square = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!(!sample_is_degenerate(&square));
    }
}
