//! Homography estimation, projection, and related utilities.

mod core;
mod correspondence;
mod fit;

pub use core::{
    estimate_homography_dlt, fit_homography_ransac, homography_project, reprojection_error,
    HomographyError, RansacHomographyConfig, RansacHomographyResult, RansacStats,
};
pub use correspondence::{mean_and_p95, rms, Correspondence, CorrespondenceSet};
pub use fit::{fit_affine_least_squares, fit_homography_robust, fit_similarity_least_squares};
