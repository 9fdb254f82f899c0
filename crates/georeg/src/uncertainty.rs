//! Spatial positional-uncertainty raster and reverse-fit RMS error.
//!
//! The raster grows linearly with the pixel distance to the nearest inlier:
//! `floor + d * step_fraction * floor`, clamped to `max_value_m`.

use image::{GrayImage, Luma};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::homography::{
    estimate_homography_dlt, fit_affine_least_squares, fit_similarity_least_squares, rms,
    CorrespondenceSet, HomographyError,
};

/// Uncertainty modeling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    /// Floor = reference meters-per-pixel times this.
    pub floor_multiplier: f64,
    /// Extra floor fraction added per pixel of distance to the nearest inlier.
    pub step_fraction: f64,
    /// Upper clamp of raster values, in meters.
    pub max_value_m: f64,
    /// Floor multiplier applied to results obtained by local chaining.
    pub chained_error_factor: f64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            floor_multiplier: 1.5,
            step_fraction: 0.03,
            max_value_m: 65_535.0,
            chained_error_factor: 1.10,
        }
    }
}

/// Model used for the reverse geographic → pixel fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverseFitModel {
    Projective,
    Affine,
    Similarity,
    /// Pixel offset only; used when every other model is rank deficient.
    Translation,
}

/// Row-major float raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatRaster {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl FloatRaster {
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Root-mean-square of all cells.
    pub fn rms(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let n = self.data.len() as f64;
        (self.data.iter().map(|&v| (v as f64).powi(2) / n).sum::<f64>()).sqrt()
    }
}

/// Uncertainty raster plus scalar fit error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyModel {
    pub raster: FloatRaster,
    /// Minimum uncertainty in meters.
    pub floor_m: f64,
    /// RMS residual of the reverse fit, in pixels.
    pub rms_error_px: f64,
    pub reverse_fit: ReverseFitModel,
}

#[derive(Debug, Clone, Default)]
pub struct UncertaintyModeler {
    config: UncertaintyConfig,
}

impl UncertaintyModeler {
    pub fn new(config: UncertaintyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UncertaintyConfig {
        &self.config
    }

    /// Minimum uncertainty for a result registered against a reference of
    /// `reference_mpp` meters per pixel.
    pub fn floor_m(&self, reference_mpp: f64, chained: bool) -> f64 {
        let floor = reference_mpp * self.config.floor_multiplier;
        if chained {
            floor * self.config.chained_error_factor
        } else {
            floor
        }
    }

    /// Build the raster and RMS error from image-pixel → geographic inliers.
    pub fn model(
        &self,
        width: u32,
        height: u32,
        inliers: &CorrespondenceSet,
        floor_m: f64,
    ) -> Result<UncertaintyModel, Error> {
        if inliers.len() < 2 {
            return Err(Error::DegenerateCorrespondenceSet { got: inliers.len() });
        }
        let raster = self.distance_raster(width, height, inliers, floor_m)?;
        let (rms_error_px, reverse_fit) = reverse_fit_rms(inliers)?;
        tracing::debug!(
            width,
            height,
            inliers = inliers.len(),
            floor_m,
            rms_error_px,
            "built uncertainty model"
        );
        Ok(UncertaintyModel {
            raster,
            floor_m,
            rms_error_px,
            reverse_fit,
        })
    }

    fn distance_raster(
        &self,
        width: u32,
        height: u32,
        inliers: &CorrespondenceSet,
        floor_m: f64,
    ) -> Result<FloatRaster, Error> {
        let mut seeds = GrayImage::new(width, height);
        let mut seeded = 0usize;
        for c in inliers {
            let (x, y) = (c.source[0].round(), c.source[1].round());
            if x >= 0.0 && y >= 0.0 && x < width as f64 && y < height as f64 {
                seeds.put_pixel(x as u32, y as u32, Luma([255]));
                seeded += 1;
            }
        }
        if seeded == 0 {
            return Err(Error::DegenerateCorrespondenceSet { got: 0 });
        }

        let dist2 = imageproc::distance_transform::euclidean_squared_distance_transform(&seeds);
        let max_value = self.config.max_value_m.max(floor_m);
        let step = self.config.step_fraction * floor_m;
        let data = dist2
            .pixels()
            .map(|p| (floor_m + p[0].sqrt() * step).min(max_value) as f32)
            .collect();
        Ok(FloatRaster {
            width,
            height,
            data,
        })
    }
}

/// Fit geographic → pixel and return the RMS pixel residual.
///
/// Projective with ≥4 points, affine with 3, similarity with 2. A fit that
/// fails on near-collinear points falls back to the next simpler model, down
/// to a translation, so any two or more points yield a finite RMS.
pub fn reverse_fit_rms(inliers: &CorrespondenceSet) -> Result<(f64, ReverseFitModel), Error> {
    let n = inliers.len();
    if n < 2 {
        return Err(Error::DegenerateCorrespondenceSet { got: n });
    }
    let geo = inliers.targets();
    let pixels = inliers.sources();

    let candidates: &[ReverseFitModel] = match n {
        _ if n == 2 || is_collinear(&geo) => &[ReverseFitModel::Similarity],
        3 => &[ReverseFitModel::Affine, ReverseFitModel::Similarity],
        _ => &[
            ReverseFitModel::Projective,
            ReverseFitModel::Affine,
            ReverseFitModel::Similarity,
        ],
    };
    for &model in candidates {
        let fit: Result<Matrix3<f64>, HomographyError> = match model {
            ReverseFitModel::Projective => estimate_homography_dlt(&geo, &pixels),
            ReverseFitModel::Affine => fit_affine_least_squares(&geo, &pixels),
            ReverseFitModel::Similarity => fit_similarity_least_squares(&geo, &pixels),
            ReverseFitModel::Translation => continue,
        };
        match fit {
            Ok(h) => {
                let errors = inliers.swapped().reprojection_errors(&h);
                if let Some(value) = rms(&errors) {
                    return Ok((value, model));
                }
            }
            Err(e) => tracing::debug!(?model, "reverse fit failed: {}", e),
        }
    }
    Ok((translation_rms(&geo, &pixels), ReverseFitModel::Translation))
}

/// RMS of the pixel residuals about the mean geographic → pixel offset.
fn translation_rms(geo: &[[f64; 2]], pixels: &[[f64; 2]]) -> f64 {
    let n = geo.len() as f64;
    let offsets: Vec<[f64; 2]> = geo
        .iter()
        .zip(pixels)
        .map(|(g, p)| [p[0] - g[0], p[1] - g[1]])
        .collect();
    let (mx, my) = offsets
        .iter()
        .fold((0.0, 0.0), |(sx, sy), o| (sx + o[0] / n, sy + o[1] / n));
    let errors: Vec<f64> = offsets
        .iter()
        .map(|o| (o[0] - mx).hypot(o[1] - my))
        .collect();
    rms(&errors).unwrap_or(0.0)
}

/// Whether the points lie (numerically) on a single line.
fn is_collinear(pts: &[[f64; 2]]) -> bool {
    let n = pts.len() as f64;
    let (mx, my) = pts
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0] / n, sy + p[1] / n));
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in pts {
        let (dx, dy) = (p[0] - mx, p[1] - my);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let trace = sxx + syy;
    if trace <= 0.0 {
        return true;
    }
    let det = sxx * syy - sxy * sxy;
    // det / trace^2 approximates minor / major eigenvalue for elongated sets.
    det / (trace * trace) < 1e-10
}
