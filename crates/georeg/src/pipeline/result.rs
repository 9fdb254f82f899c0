use serde::{Deserialize, Serialize};

use super::state::{PipelineState, Stage};
use crate::confidence::{Confidence, MatchStatistics};
use crate::error::Error;
use crate::geo::LonLat;
use crate::homography::CorrespondenceSet;
use crate::transform::GeoTransform;
use crate::uncertainty::{UncertaintyModel, UncertaintyModeler};

/// Final output of registering one target image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResult {
    /// Target image dimensions [width, height].
    pub image_size: [u32; 2],
    /// Target pixel → longitude/latitude.
    pub image_to_geo: GeoTransform,
    /// Target pixel → web Mercator meters.
    pub image_to_projected: GeoTransform,
    pub confidence: Confidence,
    /// Target pixel → longitude/latitude tie points.
    pub inliers: CorrespondenceSet,
    /// Ground resolution of the reference, meters per pixel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_mpp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    /// Geographic position of the image centre; only for matched results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<LonLat>,
    /// Registered against a previously registered neighbour.
    #[serde(default)]
    pub chained: bool,
    /// RMS pixel residual of the reverse geographic → pixel fit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rms_error_px: Option<f64>,
    #[serde(default)]
    pub statistics: MatchStatistics,
    #[serde(default)]
    pub state: PipelineState,
}

impl RegistrationResult {
    /// Identity transforms, no inliers, `Confidence::None`.
    pub fn empty(image_size: (u32, u32)) -> Self {
        Self {
            image_size: [image_size.0, image_size.1],
            image_to_geo: GeoTransform::identity(),
            image_to_projected: GeoTransform::identity(),
            confidence: Confidence::None,
            inliers: CorrespondenceSet::new(),
            reference_mpp: None,
            reference_id: None,
            center: None,
            chained: false,
            rms_error_px: None,
            statistics: MatchStatistics::default(),
            state: PipelineState::default(),
        }
    }

    /// Empty result recording a failure at `stage`.
    pub fn failed(image_size: (u32, u32), stage: Stage, error: &Error) -> Self {
        let mut result = Self::empty(image_size);
        result.state = PipelineState::Running { stage };
        result.state.fail(error);
        result
    }

    /// Reset to an empty, failed result, keeping reference identity and
    /// match statistics for diagnostics.
    pub(crate) fn fail(&mut self, state: &mut PipelineState, error: &Error) {
        state.fail(error);
        tracing::warn!(kind = error.kind(), "registration failed: {}", error);
        self.image_to_geo = GeoTransform::identity();
        self.image_to_projected = GeoTransform::identity();
        self.confidence = Confidence::None;
        self.inliers = CorrespondenceSet::new();
        self.center = None;
        self.rms_error_px = None;
        self.state = state.clone();
    }

    /// Withdraw a completed registration that failed a later policy check.
    pub(crate) fn veto(&mut self, error: &Error) {
        let mut state = PipelineState::Running {
            stage: Stage::GeoComposed,
        };
        self.fail(&mut state, error);
    }

    pub fn is_registered(&self) -> bool {
        self.confidence > Confidence::None
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.state.failure().map(|f| f.reason.as_str())
    }

    /// Positional error floor in meters.
    pub fn error_floor_m(&self, modeler: &UncertaintyModeler) -> Option<f64> {
        self.reference_mpp
            .map(|mpp| modeler.floor_m(mpp, self.chained))
    }

    /// Uncertainty raster over the target image from the stored tie points.
    pub fn uncertainty(&self, modeler: &UncertaintyModeler) -> Result<UncertaintyModel, Error> {
        let floor = match self.error_floor_m(modeler) {
            Some(floor) if self.inliers.len() >= 2 => floor,
            _ => {
                return Err(Error::DegenerateCorrespondenceSet {
                    got: self.inliers.len(),
                })
            }
        };
        modeler.model(self.image_size[0], self.image_size[1], &self.inliers, floor)
    }
}
