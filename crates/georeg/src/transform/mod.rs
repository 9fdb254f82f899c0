//! Invertible planar transforms between pixel, geographic and projected
//! coordinate spaces.
//!
//! A [`GeoTransform`] is immutable. It stores the forward matrix together
//! with its inverse, so `forward` and `reverse` are both a single
//! matrix-vector product. On the wire it is exactly nine `f64` values in
//! row-major order.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Maximum deviation of `M * M^-1` from identity accepted for an invertible
/// transform.
const INVERSE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("transform matrix is singular")]
    Singular,
    #[error("transform matrix has non-finite coefficients")]
    NonFinite,
    #[error("expected 9 row-major coefficients, got {0}")]
    WrongLength(usize),
}

/// Tagged transform variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Last row is `[0, 0, 1]`.
    Affine,
    /// Full 8-DOF homography.
    Projective,
}

/// Invertible 3×3 planar transform on homogeneous 2D points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 9]", into = "[f64; 9]")]
pub struct GeoTransform {
    kind: TransformKind,
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl GeoTransform {
    pub fn identity() -> Self {
        Self {
            kind: TransformKind::Affine,
            matrix: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Build from a 3×3 matrix. The kind follows the last row.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Result<Self, TransformError> {
        if !matrix.iter().all(|v| v.is_finite()) {
            return Err(TransformError::NonFinite);
        }
        let scale = matrix[(2, 2)];
        let matrix = if scale != 0.0 { matrix / scale } else { matrix };
        let kind = if matrix[(2, 0)] == 0.0 && matrix[(2, 1)] == 0.0 && matrix[(2, 2)] == 1.0 {
            TransformKind::Affine
        } else {
            TransformKind::Projective
        };
        let inverse = matrix.try_inverse().ok_or(TransformError::Singular)?;
        if !inverse.iter().all(|v| v.is_finite()) {
            return Err(TransformError::Singular);
        }
        let residual = (matrix * inverse - Matrix3::identity()).abs().max();
        if residual > INVERSE_TOLERANCE {
            return Err(TransformError::Singular);
        }
        let inverse = match kind {
            // Keep the inverse exactly affine.
            TransformKind::Affine => {
                let mut inv = inverse;
                inv[(2, 0)] = 0.0;
                inv[(2, 1)] = 0.0;
                inv[(2, 2)] = 1.0;
                inv
            }
            TransformKind::Projective => inverse,
        };
        Ok(Self {
            kind,
            matrix,
            inverse,
        })
    }

    /// Affine transform `x' = a*x + b*y + c`, `y' = d*x + e*y + f`.
    pub fn affine(coeffs: [f64; 6]) -> Result<Self, TransformError> {
        let [a, b, c, d, e, f] = coeffs;
        Self::from_matrix(Matrix3::new(a, b, c, d, e, f, 0.0, 0.0, 1.0))
    }

    /// Axis-aligned scale followed by translation.
    pub fn scale_translate(sx: f64, sy: f64, tx: f64, ty: f64) -> Result<Self, TransformError> {
        Self::affine([sx, 0.0, tx, 0.0, sy, ty])
    }

    pub fn from_row_major(values: &[f64]) -> Result<Self, TransformError> {
        let values: [f64; 9] = values
            .try_into()
            .map_err(|_| TransformError::WrongLength(values.len()))?;
        Self::try_from(values)
    }

    pub fn to_row_major(&self) -> [f64; 9] {
        let m = &self.matrix;
        [
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
        ]
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn is_identity(&self) -> bool {
        self.matrix == Matrix3::identity()
    }

    /// The reverse mapping as its own transform.
    pub fn inverse(&self) -> Self {
        Self {
            kind: self.kind,
            matrix: self.inverse,
            inverse: self.matrix,
        }
    }

    /// Map a point forward. Points sent to infinity come back as NaN.
    pub fn forward(&self, p: [f64; 2]) -> [f64; 2] {
        apply(&self.matrix, p)
    }

    /// Map a point backward. Points sent to infinity come back as NaN.
    pub fn reverse(&self, p: [f64; 2]) -> [f64; 2] {
        apply(&self.inverse, p)
    }

    /// Forward mapping that reports points at infinity as `None`.
    pub fn try_forward(&self, p: [f64; 2]) -> Option<[f64; 2]> {
        let q = self.forward(p);
        (q[0].is_finite() && q[1].is_finite()).then_some(q)
    }

    /// Reverse mapping that reports points at infinity as `None`.
    pub fn try_reverse(&self, p: [f64; 2]) -> Option<[f64; 2]> {
        let q = self.reverse(p);
        (q[0].is_finite() && q[1].is_finite()).then_some(q)
    }

    /// `self ∘ first`: apply `first`, then `self`.
    pub fn compose(&self, first: &GeoTransform) -> Result<Self, TransformError> {
        Self::from_matrix(self.matrix * first.matrix)
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::identity()
    }
}

fn apply(m: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    let q = m * Vector3::new(p[0], p[1], 1.0);
    if q[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [q[0] / q[2], q[1] / q[2]]
}

impl TryFrom<[f64; 9]> for GeoTransform {
    type Error = TransformError;

    fn try_from(v: [f64; 9]) -> Result<Self, Self::Error> {
        Self::from_matrix(Matrix3::new(
            v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8],
        ))
    }
}

impl From<GeoTransform> for [f64; 9] {
    fn from(t: GeoTransform) -> Self {
        t.to_row_major()
    }
}
