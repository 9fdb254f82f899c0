//! Local chaining: registration against previously registered neighbours.

use serde::{Deserialize, Serialize};

use super::register::{tie_point_rms, ReferenceInput, Registrar, RegistrationRequest};
use super::result::RegistrationResult;
use super::state::Stage;
use crate::compose::ReferenceGeoModel;
use crate::confidence::Confidence;
use crate::error::Error;
use crate::geo::{degree_distance, lonlat_to_projected, within_degrees, GeoBounds, LonLat};
use crate::homography::CorrespondenceSet;
use crate::matcher::{FeatureMatcher, MatchStrategy};
use crate::store::{FrameId, ResultStore, StoredResult, TargetImageProvider};
use crate::transform::GeoTransform;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalChainConfig {
    /// Neighbours must be within this many frames of the target.
    pub max_frame_range: u32,
    /// Neighbour centres must be within this many degrees in both
    /// longitude and latitude.
    pub max_distance_deg: f64,
    /// Neighbours tried, nearest first.
    pub max_attempts: usize,
    /// Reject a HIGH match when none of the neighbour's own tie points
    /// lands inside the new image.
    pub require_anchor_tie_points: bool,
    pub strategy: MatchStrategy,
}

impl Default for LocalChainConfig {
    fn default() -> Self {
        Self {
            max_frame_range: 6,
            max_distance_deg: 0.4,
            max_attempts: 4,
            require_anchor_tie_points: true,
            strategy: MatchStrategy::Fast,
        }
    }
}

/// Usable neighbours of `frame`, nearest first.
pub(crate) fn rank_candidates(
    frame: &FrameId,
    center: LonLat,
    candidates: Vec<StoredResult>,
    config: &LocalChainConfig,
) -> Vec<StoredResult> {
    let mut ranked: Vec<(f64, u32, StoredResult)> = candidates
        .into_iter()
        .filter(|c| c.result.confidence == Confidence::High && c.frame != *frame)
        .filter_map(|c| {
            let frames = c.frame.frame_distance(frame)?;
            let neighbour = c.result.center?;
            (frames <= config.max_frame_range
                && within_degrees(neighbour, center, config.max_distance_deg))
            .then(|| (degree_distance(neighbour, center), frames, c))
        })
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    ranked
        .into_iter()
        .take(config.max_attempts)
        .map(|(_, _, c)| c)
        .collect()
}

/// Move the neighbour's tie points into the new image: longitude/latitude
/// → projected → new image pixel, keeping those inside `size`.
pub(crate) fn carry_tie_points(
    anchor: &CorrespondenceSet,
    image_to_projected: &GeoTransform,
    size: (u32, u32),
) -> CorrespondenceSet {
    let (w, h) = (size.0 as f64, size.1 as f64);
    CorrespondenceSet::from_pairs(anchor.iter().filter_map(|c| {
        let p = image_to_projected.try_reverse(lonlat_to_projected(c.target))?;
        (p[0] >= 0.0 && p[1] >= 0.0 && p[0] < w && p[1] < h).then_some((p, c.target))
    }))
}

impl<M: FeatureMatcher> Registrar<M> {
    /// Register `request` against stored HIGH-confidence neighbours of
    /// `frame`. Never fails: exhaustion yields a `Confidence::None` result.
    pub fn register_local(
        &self,
        frame: &FrameId,
        request: &RegistrationRequest<'_>,
        store: &dyn ResultStore,
        images: &dyn TargetImageProvider,
    ) -> RegistrationResult {
        let size = request.target.dimensions();
        let config = &self.local_chain;
        let found = self.retry.run("find_neighbours", || {
            store.high_confidence_results_near(request.center, &frame.mission, config.max_distance_deg)
        });
        let candidates = match found {
            Ok(found) => rank_candidates(frame, request.center, found, config),
            Err(e) => return RegistrationResult::failed(size, Stage::NotStarted, &e),
        };

        let mut last = None;
        for candidate in &candidates {
            tracing::debug!(neighbour = %candidate.frame, "trying local match");
            match self.try_neighbour(request, candidate, images) {
                Ok(result) => return result,
                Err(result) => last = Some(result),
            }
        }

        tracing::info!(candidates = candidates.len(), "no local match");
        match last {
            Some(result) => result,
            None => {
                let d = config.max_distance_deg;
                let c = request.center;
                let bounds = GeoBounds::new(c.lon - d, c.lon + d, c.lat - d, c.lat + d);
                RegistrationResult::failed(size, Stage::NotStarted, &Error::ReferenceUnavailable { bounds })
            }
        }
    }

    /// `Ok` with an accepted chained result, `Err` with the failed attempt.
    fn try_neighbour(
        &self,
        request: &RegistrationRequest<'_>,
        candidate: &StoredResult,
        images: &dyn TargetImageProvider,
    ) -> Result<RegistrationResult, RegistrationResult> {
        let size = request.target.dimensions();
        let neighbour = self
            .retry
            .run("source_image", || images.source_image(&candidate.frame))
            .map_err(|e| RegistrationResult::failed(size, Stage::NotStarted, &e))?;
        let (nw, nh) = neighbour.pixels.dimensions();
        let geo = ReferenceGeoModel::from_pixel_to_projected(
            &candidate.result.image_to_projected,
            nw,
            nh,
        )
        .map_err(|e| RegistrationResult::failed(size, Stage::NotStarted, &e))?;

        let neighbour_mpp = neighbour
            .meters_per_pixel
            .or(request.meters_per_pixel)
            .unwrap_or(self.fallback_mpp);
        let chained_request = RegistrationRequest {
            meters_per_pixel: request.meters_per_pixel.or(Some(neighbour_mpp)),
            strategy: self.local_chain.strategy,
            ..*request
        };
        let id = candidate.frame.to_string();
        let reference = ReferenceInput {
            id: &id,
            image: &neighbour.pixels,
            geo,
            meters_per_pixel: neighbour_mpp,
        };
        let mut result = self.register_with_reference(&chained_request, &reference);
        if result.confidence != Confidence::High {
            tracing::debug!(neighbour = %candidate.frame, confidence = %result.confidence, "local match not accepted");
            return Err(result);
        }

        let ties = carry_tie_points(&candidate.result.inliers, &result.image_to_projected, size);
        if ties.is_empty() {
            if self.local_chain.require_anchor_tie_points {
                tracing::info!(
                    neighbour = %candidate.frame,
                    inliers = result.statistics.inliers,
                    "neighbour tie points fall outside the new image, rejecting local match"
                );
                result.veto(&Error::MatchFailed {
                    reason: format!("no tie point of {} lands in the image", candidate.frame),
                });
                return Err(result);
            }
        } else {
            result.inliers = ties;
        }
        result.chained = true;
        result.rms_error_px = tie_point_rms(&result);
        tracing::info!(neighbour = %candidate.frame, tie_points = result.inliers.len(), "chained registration");
        Ok(result)
    }
}
