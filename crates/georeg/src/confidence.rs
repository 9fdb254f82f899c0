//! Discrete trust level for a registration and the rule that assigns it.

use serde::{Deserialize, Serialize};

/// Trust level of a registration result. Ordered `None < Low < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    #[default]
    None,
    Low,
    High,
}

impl Confidence {
    /// Integer code used by stored results (0, 1, 2).
    pub fn code(self) -> u8 {
        match self {
            Confidence::None => 0,
            Confidence::Low => 1,
            Confidence::High => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::None => "NONE",
            Confidence::Low => "LOW",
            Confidence::High => "HIGH",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics of one feature-match attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStatistics {
    /// Putative matches handed to the robust fit.
    pub candidate_matches: usize,
    /// Matches consistent with the fitted transform.
    pub inliers: usize,
    /// Mean reprojection error of the inliers, in reference pixels.
    pub mean_residual_px: f64,
    /// 95th percentile reprojection error of the inliers.
    pub p95_residual_px: f64,
    /// Rotation between the two images estimated from match bearings.
    /// Diagnostic only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_rotation_deg: Option<f64>,
}

impl MatchStatistics {
    pub fn inlier_ratio(&self) -> f64 {
        if self.candidate_matches == 0 {
            0.0
        } else {
            self.inliers as f64 / self.candidate_matches as f64
        }
    }
}

/// Thresholds for [`classify`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceThresholds {
    /// Minimum inliers for LOW.
    pub low_min_inliers: usize,
    /// Minimum inliers for HIGH.
    pub high_min_inliers: usize,
    /// Maximum mean inlier residual (pixels) for HIGH.
    pub high_max_mean_residual_px: f64,
    /// Minimum inlier ratio for HIGH. `0.0` disables the check.
    pub high_min_inlier_ratio: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            low_min_inliers: 10,
            high_min_inliers: 20,
            high_max_mean_residual_px: 5.0,
            high_min_inlier_ratio: 0.0,
        }
    }
}

/// Classify match statistics.
///
/// Monotonic: more inliers or a lower residual never lowers the result.
/// A non-finite residual can reach LOW but never HIGH.
pub fn classify(stats: &MatchStatistics, thresholds: &ConfidenceThresholds) -> Confidence {
    let low_min = thresholds.low_min_inliers.max(4);
    if stats.inliers < low_min {
        return Confidence::None;
    }
    let residual_ok = stats.mean_residual_px.is_finite()
        && stats.mean_residual_px <= thresholds.high_max_mean_residual_px;
    let ratio_ok = stats.inlier_ratio() >= thresholds.high_min_inlier_ratio;
    if stats.inliers >= thresholds.high_min_inliers.max(low_min) && residual_ok && ratio_ok {
        Confidence::High
    } else {
        Confidence::Low
    }
}
