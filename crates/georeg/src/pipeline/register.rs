//! Single-image registration against one reference.

use chrono::NaiveDate;
use image::GrayImage;

use super::chain::LocalChainConfig;
use super::result::RegistrationResult;
use super::state::{PipelineState, Stage};
use crate::compose::{GeoComposer, ReferenceGeoModel};
use crate::config::RegistrationConfig;
use crate::error::Error;
use crate::geo::LonLat;
use crate::matcher::{FeatureMatcher, ImageMatcher, MatchStrategy, OrbFeatureMatcher};
use crate::reference::{ImagerySource, ReferenceConfig, ReferenceImage, ReferenceSelector};
use crate::retry::RetryPolicy;
use crate::uncertainty::reverse_fit_rms;

/// One target photograph to register.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationRequest<'a> {
    pub target: &'a GrayImage,
    /// Approximate geographic centre of the photograph.
    pub center: LonLat,
    /// Target ground resolution hint in meters per pixel.
    pub meters_per_pixel: Option<f64>,
    pub acquisition_date: NaiveDate,
    pub strategy: MatchStrategy,
}

/// A georeferenced reference raster.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceInput<'a> {
    pub id: &'a str,
    pub image: &'a GrayImage,
    pub geo: ReferenceGeoModel,
    pub meters_per_pixel: f64,
}

impl<'a> From<&'a ReferenceImage> for ReferenceInput<'a> {
    fn from(r: &'a ReferenceImage) -> Self {
        Self {
            id: &r.id,
            image: &r.pixels,
            geo: r.geo,
            meters_per_pixel: r.meters_per_pixel,
        }
    }
}

/// Matcher, composer and policies for registering single images.
pub struct Registrar<M = OrbFeatureMatcher> {
    pub(crate) matcher: ImageMatcher<M>,
    pub(crate) composer: GeoComposer,
    pub(crate) reference: ReferenceConfig,
    pub(crate) local_chain: LocalChainConfig,
    pub(crate) retry: RetryPolicy,
    /// Target resolution assumed when none is known.
    pub(crate) fallback_mpp: f64,
}

impl Registrar<OrbFeatureMatcher> {
    pub fn new(config: &RegistrationConfig) -> Self {
        let backend = OrbFeatureMatcher::new(&config.matcher);
        Self::with_backend(backend, config)
    }
}

impl<M: FeatureMatcher> Registrar<M> {
    pub fn with_backend(backend: M, config: &RegistrationConfig) -> Self {
        Self {
            matcher: ImageMatcher::with_backend(
                backend,
                config.matcher.clone(),
                config.confidence.clone(),
            ),
            composer: GeoComposer::new(config.compose.clone()),
            reference: config.reference.clone(),
            local_chain: config.local_chain.clone(),
            retry: config.retry.clone(),
            fallback_mpp: config.resolution.missing_focal_length_mpp,
        }
    }

    /// Register `request` against `reference` when given, otherwise against
    /// reference imagery selected from `imagery`.
    ///
    /// Never fails: every failure is recorded in the returned result.
    pub fn register_image(
        &self,
        request: &RegistrationRequest<'_>,
        reference: Option<ReferenceInput<'_>>,
        imagery: Option<&dyn ImagerySource>,
    ) -> RegistrationResult {
        match (reference, imagery) {
            (Some(reference), _) => self.register_with_reference(request, &reference),
            (None, Some(imagery)) => self.register_direct(request, imagery),
            (None, None) => {
                let mpp = request.meters_per_pixel.unwrap_or(self.fallback_mpp);
                let bounds = self.reference.search_bounds(request.center, mpp);
                RegistrationResult::failed(
                    request.target.dimensions(),
                    Stage::NotStarted,
                    &Error::ReferenceUnavailable { bounds },
                )
            }
        }
    }

    /// Direct-to-source: select and fetch a reference, then register.
    pub fn register_direct(
        &self,
        request: &RegistrationRequest<'_>,
        imagery: &dyn ImagerySource,
    ) -> RegistrationResult {
        let selector = ReferenceSelector::new(imagery, &self.reference, &self.retry);
        let mpp = request.meters_per_pixel.unwrap_or(self.fallback_mpp);
        let bounds = selector.search_bounds(request.center, mpp);
        let reference = selector
            .select_with_widening(&bounds, request.acquisition_date)
            .and_then(|selected| selector.fetch(&selected));
        match reference {
            Ok(reference) => self.register_with_reference(request, &ReferenceInput::from(&reference)),
            Err(e) => {
                let mut state = PipelineState::default();
                let mut result = RegistrationResult::empty(request.target.dimensions());
                result.fail(&mut state, &e);
                result
            }
        }
    }

    /// Match against `reference` and compose geographic transforms.
    pub fn register_with_reference(
        &self,
        request: &RegistrationRequest<'_>,
        reference: &ReferenceInput<'_>,
    ) -> RegistrationResult {
        let (w, h) = request.target.dimensions();
        let mut state = PipelineState::default();
        let mut result = RegistrationResult::empty((w, h));
        result.reference_id = Some(reference.id.to_string());
        result.reference_mpp = Some(reference.meters_per_pixel);
        state.advance();

        let scale = request
            .meters_per_pixel
            .filter(|_| reference.meters_per_pixel > 0.0)
            .map(|mpp| mpp / reference.meters_per_pixel);
        let outcome = self
            .matcher
            .match_images(request.target, reference.image, scale, request.strategy);
        result.statistics = outcome.statistics.clone();
        if !outcome.is_match() {
            let reason = outcome.failure.unwrap_or_else(|| "no match".to_string());
            result.fail(&mut state, &Error::MatchFailed { reason });
            return result;
        }
        state.advance();

        let composition = match self
            .composer
            .compose(&outcome.transform, (w, h), &reference.geo)
        {
            Ok(c) => c,
            Err(e) => {
                result.fail(&mut state, &e);
                return result;
            }
        };
        state.advance();

        result.inliers = outcome
            .inliers
            .map_targets(|r| composition.reference_pixel_to_geo.try_forward(r));
        result.image_to_geo = composition.image_to_geo;
        result.image_to_projected = composition.image_to_projected;
        result.confidence = outcome.confidence;
        result.center = composition
            .image_to_geo
            .try_forward([w as f64 / 2.0, h as f64 / 2.0])
            .map(LonLat::from_array);
        result.rms_error_px = tie_point_rms(&result);
        state.advance();
        result.state = state;

        tracing::info!(
            reference = reference.id,
            confidence = %result.confidence,
            inliers = result.inliers.len(),
            "registered image"
        );
        result
    }
}

/// Reverse-fit RMS of the result's tie points, when there are enough.
pub(crate) fn tie_point_rms(result: &RegistrationResult) -> Option<f64> {
    if result.inliers.len() < 2 {
        return None;
    }
    match reverse_fit_rms(&result.inliers) {
        Ok((rms, _)) => Some(rms),
        Err(e) => {
            tracing::warn!("reverse fit failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Confidence;
    use crate::geo::GeoBounds;
    use crate::pipeline::PipelineState;
    use crate::test_utils::{test_config, FailingMatcher, FakeImagery, SyntheticMatcher};
    use crate::transform::GeoTransform;
    use approx::assert_relative_eq;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2005, 6, 15).unwrap()
    }

    fn request(target: &GrayImage, mpp: Option<f64>) -> RegistrationRequest<'_> {
        RegistrationRequest {
            target,
            center: LonLat::new(-91.0, 33.0),
            meters_per_pixel: mpp,
            acquisition_date: date(),
            strategy: MatchStrategy::Thorough,
        }
    }

    #[test]
    fn direct_registration_maps_target_centre_to_reference_centre() {
        let imagery = FakeImagery::new()
            .with_images("A", 12, date())
            .with_reference_size(1000, 1000);
        // Target centre (400, 300) lands on the reference centre (500, 500).
        let truth = GeoTransform::scale_translate(1.0, 1.0, 100.0, 200.0).unwrap();
        let registrar = Registrar::with_backend(SyntheticMatcher::new(truth, 800, 600), &test_config(&["A"]));
        let target = GrayImage::new(800, 600);
        let result = registrar.register_image(&request(&target, Some(30.0)), None, Some(&imagery));

        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.state, PipelineState::Done);
        assert_eq!(result.reference_id.as_deref(), Some("composite:A:12"));
        assert_eq!(result.reference_mpp, Some(30.0));
        assert!(!result.chained);
        let center = result.center.unwrap();
        assert_relative_eq!(center.lon, -91.0, epsilon = 1e-7);
        assert_relative_eq!(center.lat, 33.0, epsilon = 1e-7);

        assert_eq!(result.inliers.len(), 20 * 15);
        for c in &result.inliers {
            let g = result.image_to_geo.forward(c.source);
            assert_relative_eq!(g[0], c.target[0], epsilon = 1e-7);
            assert_relative_eq!(g[1], c.target[1], epsilon = 1e-7);
        }
        assert!(result.rms_error_px.unwrap() < 1e-3);
    }

    #[test]
    fn explicit_reference_with_upscaled_target() {
        let bounds = GeoBounds::new(10.0, 10.3, 19.7, 20.0);
        let reference_img = GrayImage::new(1000, 1000);
        let reference = ReferenceInput {
            id: "ref",
            image: &reference_img,
            geo: ReferenceGeoModel::from_bounds(&bounds, 1000, 1000).unwrap(),
            meters_per_pixel: 30.0,
        };
        // 15 m target pixels: the matcher works at half size.
        let truth = GeoTransform::scale_translate(0.5, 0.5, 100.0, 200.0).unwrap();
        let registrar =
            Registrar::with_backend(SyntheticMatcher::new(truth, 1600, 1200), &test_config(&[]));
        let target = GrayImage::new(1600, 1200);
        let result = registrar.register_image(&request(&target, Some(15.0)), Some(reference), None);

        assert_eq!(result.confidence, Confidence::High);
        assert!(result.inliers.iter().any(|c| c.source[0] > 800.0));
        let expected = reference.geo.pixel_to_geo.forward(truth.forward([1200.0, 1000.0]));
        let got = result.image_to_geo.forward([1200.0, 1000.0]);
        assert_relative_eq!(got[0], expected[0], epsilon = 1e-7);
        assert_relative_eq!(got[1], expected[1], epsilon = 1e-7);
    }

    #[test]
    fn no_reference_source_is_reference_unavailable() {
        let registrar = Registrar::with_backend(FailingMatcher, &test_config(&["A"]));
        let target = GrayImage::new(64, 64);
        let result = registrar.register_image(&request(&target, None), None, None);
        assert_eq!(result.confidence, Confidence::None);
        assert_eq!(result.state.failure().unwrap().kind, "reference_unavailable");

        let empty = FakeImagery::new();
        let result = registrar.register_image(&request(&target, None), None, Some(&empty));
        assert_eq!(result.state.failure().unwrap().kind, "reference_unavailable");
        assert!(result.image_to_geo.is_identity());
    }

    #[test]
    fn match_and_composition_failures_are_distinct() {
        let bounds = GeoBounds::new(10.0, 10.3, 19.7, 20.0);
        let reference_img = GrayImage::new(1000, 1000);
        let reference = ReferenceInput {
            id: "ref",
            image: &reference_img,
            geo: ReferenceGeoModel::from_bounds(&bounds, 1000, 1000).unwrap(),
            meters_per_pixel: 30.0,
        };
        let target = GrayImage::new(800, 600);

        let failing = Registrar::with_backend(FailingMatcher, &test_config(&[]));
        let result = failing.register_with_reference(&request(&target, Some(30.0)), &reference);
        let failure = result.state.failure().unwrap();
        assert_eq!(failure.kind, "match_failed");
        assert_eq!(failure.stage, Stage::ReferenceAcquired);

        // Matches well, but the footprint misses the reference entirely.
        let truth = GeoTransform::scale_translate(1.0, 1.0, 5000.0, 5000.0).unwrap();
        let offset = Registrar::with_backend(SyntheticMatcher::new(truth, 800, 600), &test_config(&[]));
        let result = offset.register_with_reference(&request(&target, Some(30.0)), &reference);
        let failure = result.state.failure().unwrap();
        assert_eq!(failure.kind, "geo_composition_failed");
        assert_eq!(failure.stage, Stage::Matched);
        assert_eq!(result.confidence, Confidence::None);
        assert!(result.statistics.inliers >= 20);
        assert!(result.inliers.is_empty());
        assert!(result.image_to_geo.is_identity());
        assert!(result.center.is_none());
    }
}
