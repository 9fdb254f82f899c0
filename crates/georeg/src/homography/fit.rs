//! Least-squares fits of lower-order planar models and RANSAC summaries.

use nalgebra::{DMatrix, DVector, Matrix3};

use super::core::{
    fit_homography_ransac, normalize_points, HomographyError, RansacHomographyConfig, RansacStats,
};
use super::correspondence::{collect_masked_inlier_errors, mean_and_p95, CorrespondenceSet};

/// Ratio below which the smallest singular value of a design matrix is
/// treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;

fn solve_normalized(
    a: DMatrix<f64>,
    b: DVector<f64>,
    what: &str,
) -> Result<DVector<f64>, HomographyError> {
    let svd = a.svd(true, true);
    let s = &svd.singular_values;
    let s_max = s.iter().cloned().fold(0.0f64, f64::max);
    let s_min = s.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(s_max > 0.0) || s_min / s_max < RANK_TOLERANCE {
        return Err(HomographyError::NumericalFailure(format!(
            "{what} fit is rank deficient (points are degenerate)"
        )));
    }
    svd.solve(&b, 1e-15)
        .map_err(|e| HomographyError::NumericalFailure(format!("{what} solve: {e}")))
}

fn check_lengths(src: &[[f64; 2]], dst: &[[f64; 2]], needed: usize) -> Result<(), HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::LengthMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    if src.len() < needed {
        return Err(HomographyError::TooFewPoints {
            needed,
            got: src.len(),
        });
    }
    Ok(())
}

fn denormalize(
    t_src: &Matrix3<f64>,
    t_dst: &Matrix3<f64>,
    m: Matrix3<f64>,
) -> Result<Matrix3<f64>, HomographyError> {
    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::NumericalFailure("T_dst not invertible".into()))?;
    Ok(t_dst_inv * m * t_src)
}

/// Least-squares affine transform from ≥3 correspondences.
pub fn fit_affine_least_squares(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    check_lengths(src, dst, 3)?;
    let n = src.len();
    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 6);
    let mut b = DVector::zeros(2 * n);
    for i in 0..n {
        let [sx, sy] = src_n[i];
        a[(2 * i, 0)] = sx;
        a[(2 * i, 1)] = sy;
        a[(2 * i, 2)] = 1.0;
        b[2 * i] = dst_n[i][0];
        a[(2 * i + 1, 3)] = sx;
        a[(2 * i + 1, 4)] = sy;
        a[(2 * i + 1, 5)] = 1.0;
        b[2 * i + 1] = dst_n[i][1];
    }
    let p = solve_normalized(a, b, "affine")?;
    #[rustfmt::skip]
    let m = Matrix3::new(
        p[0], p[1], p[2],
        p[3], p[4], p[5],
        0.0, 0.0, 1.0,
    );
    denormalize(&t_src, &t_dst, m)
}

/// Least-squares similarity (rotation, uniform scale, translation) from ≥2
/// correspondences.
pub fn fit_similarity_least_squares(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> Result<Matrix3<f64>, HomographyError> {
    check_lengths(src, dst, 2)?;
    let n = src.len();
    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // u = a*x - b*y + tx ; v = b*x + a*y + ty
    let mut a = DMatrix::zeros(2 * n, 4);
    let mut rhs = DVector::zeros(2 * n);
    for i in 0..n {
        let [sx, sy] = src_n[i];
        a[(2 * i, 0)] = sx;
        a[(2 * i, 1)] = -sy;
        a[(2 * i, 2)] = 1.0;
        rhs[2 * i] = dst_n[i][0];
        a[(2 * i + 1, 0)] = sy;
        a[(2 * i + 1, 1)] = sx;
        a[(2 * i + 1, 3)] = 1.0;
        rhs[2 * i + 1] = dst_n[i][1];
    }
    let p = solve_normalized(a, rhs, "similarity")?;
    #[rustfmt::skip]
    let m = Matrix3::new(
        p[0], -p[1], p[2],
        p[1], p[0], p[3],
        0.0, 0.0, 1.0,
    );
    denormalize(&t_src, &t_dst, m)
}

/// Robust homography over a correspondence set.
///
/// Returns the model, the inlier subset and the fit statistics.
pub fn fit_homography_robust(
    set: &CorrespondenceSet,
    config: &RansacHomographyConfig,
) -> Result<(Matrix3<f64>, CorrespondenceSet, RansacStats), HomographyError> {
    let (src, dst) = set.columns();
    let result = fit_homography_ransac(&src, &dst, config)?;
    let mut inlier_errors = collect_masked_inlier_errors(&result.errors, &result.inlier_mask);
    let (mean_err, p95_err) = mean_and_p95(&mut inlier_errors);
    let stats = RansacStats {
        n_candidates: set.len(),
        n_inliers: result.n_inliers,
        threshold: config.inlier_threshold,
        mean_err,
        p95_err,
    };
    Ok((result.h, set.select(&result.inlier_mask), stats))
}
