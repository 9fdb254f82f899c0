//! Ground-resolution estimators for target photographs.
//!
//! Estimates are in meters per pixel and feed the reference bounding box
//! size and the matcher scale factor.

use serde::{Deserialize, Serialize};

/// Capture parameters available for a target frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureGeometry {
    /// Lens focal length in millimeters.
    pub focal_length_mm: Option<f64>,
    pub width_px: u32,
    pub height_px: u32,
    pub sensor_width_mm: Option<f64>,
    pub sensor_height_mm: Option<f64>,
    /// Platform altitude above the surface in nautical miles.
    pub altitude_nmi: Option<f64>,
}

/// Estimates ground resolution (meters per pixel) for a target frame.
pub trait GroundResolutionEstimator: Send + Sync {
    /// `None` when the estimator has no answer for these inputs.
    fn estimate(&self, capture: &CaptureGeometry) -> Option<f64>;
}

/// Empirical focal-length → resolution table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocalLengthTable {
    /// `(max_focal_length_mm, meters_per_pixel)` rows in ascending order.
    pub rows: Vec<(f64, f64)>,
    /// Returned when the focal length is unknown.
    pub missing_focal_length_mpp: f64,
}

impl Default for FocalLengthTable {
    fn default() -> Self {
        Self {
            rows: vec![
                (50.0, 200.0),
                (110.0, 80.0),
                (180.0, 55.0),
                (250.0, 30.0),
                (340.0, 25.0),
                (400.0, 20.0),
                (800.0, 10.0),
            ],
            missing_focal_length_mpp: 150.0,
        }
    }
}

impl FocalLengthTable {
    pub fn lookup(&self, focal_length_mm: Option<f64>) -> Option<f64> {
        let f = match focal_length_mm {
            Some(f) if f > 0.0 => f,
            _ => return Some(self.missing_focal_length_mpp),
        };
        self.rows
            .iter()
            .find(|(max_f, _)| f <= *max_f)
            .map(|&(_, mpp)| mpp)
    }
}

impl GroundResolutionEstimator for FocalLengthTable {
    fn estimate(&self, capture: &CaptureGeometry) -> Option<f64> {
        self.lookup(capture.focal_length_mm)
    }
}

/// Nadir pinhole estimate from sensor size, focal length and altitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinholeGeometry;

const NAUTICAL_MILE_M: f64 = 1852.0;

impl GroundResolutionEstimator for PinholeGeometry {
    fn estimate(&self, capture: &CaptureGeometry) -> Option<f64> {
        let f = capture.focal_length_mm.filter(|&f| f > 0.0)?;
        let (sw, sh) = (capture.sensor_width_mm?, capture.sensor_height_mm?);
        let altitude_m = capture.altitude_nmi? * NAUTICAL_MILE_M;
        let sensor_half_diag = (sw * sw / 4.0 + sh * sh / 4.0).sqrt();
        let (w, h) = (capture.width_px as f64, capture.height_px as f64);
        let pixel_half_diag = (w * w / 4.0 + h * h / 4.0).sqrt();
        if pixel_half_diag <= 0.0 || altitude_m <= 0.0 {
            return None;
        }
        let angle = sensor_half_diag.atan2(f);
        let ground_half_diag = angle.tan() * altitude_m;
        Some(ground_half_diag / pixel_half_diag)
    }
}

/// Try each estimator in order and return the first answer.
pub struct FirstOf(pub Vec<Box<dyn GroundResolutionEstimator>>);

impl GroundResolutionEstimator for FirstOf {
    fn estimate(&self, capture: &CaptureGeometry) -> Option<f64> {
        self.0.iter().find_map(|e| e.estimate(capture))
    }
}
