//! Synthetic images and fake collaborators for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::NaiveDate;
use image::{imageops, GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::compose::ReferenceGeoModel;
use crate::error::Error;
use crate::geo::GeoBounds;
use crate::homography::CorrespondenceSet;
use crate::matcher::{FeatureMatcher, MatchStrategy};
use crate::reference::{CloudFilter, DateRange, ImageHandle, ImagerySource, ReferenceImage};
use crate::transform::GeoTransform;

/// Mid-grey canvas covered with random blurred rectangles.
pub(crate) fn textured_canvas(w: u32, h: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::from_pixel(w, h, Luma([128]));
    for _ in 0..80 {
        let rw = rng.gen_range(10..60u32);
        let rh = rng.gen_range(10..60u32);
        let x0 = rng.gen_range(0..w.saturating_sub(rw).max(1));
        let y0 = rng.gen_range(0..h.saturating_sub(rh).max(1));
        let v: u8 = rng.gen();
        for y in y0..(y0 + rh).min(h) {
            for x in x0..(x0 + rw).min(w) {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    imageproc::filter::gaussian_blur_f32(&img, 1.0)
}

pub(crate) fn crop(img: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> GrayImage {
    imageops::crop_imm(img, x, y, w, h).to_image()
}

/// Backend that returns exact correspondences of a known transform.
///
/// `truth` maps original target pixels to reference pixels. Sources are a
/// 40 px grid of the original target, rescaled into the pixel space of the
/// image actually passed in.
pub(crate) struct SyntheticMatcher {
    truth: GeoTransform,
    width: u32,
    height: u32,
}

impl SyntheticMatcher {
    pub(crate) fn new(truth: GeoTransform, width: u32, height: u32) -> Self {
        Self {
            truth,
            width,
            height,
        }
    }
}

impl FeatureMatcher for SyntheticMatcher {
    fn correspondences(
        &self,
        target: &GrayImage,
        _reference: &GrayImage,
        _strategy: MatchStrategy,
    ) -> Result<CorrespondenceSet, Error> {
        let kx = target.width() as f64 / self.width as f64;
        let ky = target.height() as f64 / self.height as f64;
        let mut set = CorrespondenceSet::new();
        for x in (0..self.width).step_by(40) {
            for y in (0..self.height).step_by(40) {
                let s = [x as f64, y as f64];
                set.push([s[0] * kx, s[1] * ky], self.truth.forward(s));
            }
        }
        Ok(set)
    }
}

pub(crate) struct FailingMatcher;

impl FeatureMatcher for FailingMatcher {
    fn correspondences(
        &self,
        _target: &GrayImage,
        _reference: &GrayImage,
        _strategy: MatchStrategy,
    ) -> Result<CorrespondenceSet, Error> {
        Err(Error::MatchFailed {
            reason: "backend unavailable".into(),
        })
    }
}

/// Backend that panics on targets of the given width.
pub(crate) struct PanickingMatcher {
    pub(crate) inner: SyntheticMatcher,
    pub(crate) panic_width: u32,
}

impl FeatureMatcher for PanickingMatcher {
    fn correspondences(
        &self,
        target: &GrayImage,
        reference: &GrayImage,
        strategy: MatchStrategy,
    ) -> Result<CorrespondenceSet, Error> {
        if target.width() == self.panic_width {
            panic!("backend crashed");
        }
        self.inner.correspondences(target, reference, strategy)
    }
}

/// In-memory imagery source.
pub(crate) struct FakeImagery {
    images: Vec<ImageHandle>,
    required_extent: Option<GeoBounds>,
    failures_left: AtomicUsize,
    last_cloud: Mutex<Option<CloudFilter>>,
    reference_size: (u32, u32),
    next_id: usize,
}

impl FakeImagery {
    pub(crate) fn new() -> Self {
        Self {
            images: Vec::new(),
            required_extent: None,
            failures_left: AtomicUsize::new(0),
            last_cloud: Mutex::new(None),
            reference_size: (1000, 1000),
            next_id: 0,
        }
    }

    pub(crate) fn with_images(mut self, source: &str, count: usize, acquired: NaiveDate) -> Self {
        for _ in 0..count {
            self.images.push(ImageHandle {
                id: format!("{source}/{}", self.next_id),
                source: source.to_string(),
                acquired: Some(acquired),
            });
            self.next_id += 1;
        }
        self
    }

    /// Queries only see imagery when their box covers `extent`.
    pub(crate) fn covering(mut self, extent: GeoBounds) -> Self {
        self.required_extent = Some(extent);
        self
    }

    /// The first `n` queries fail with a transient error.
    pub(crate) fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_reference_size(mut self, w: u32, h: u32) -> Self {
        self.reference_size = (w, h);
        self
    }

    pub(crate) fn last_cloud_filter(&self) -> Option<CloudFilter> {
        self.last_cloud.lock().ok().and_then(|c| *c)
    }
}

impl ImagerySource for FakeImagery {
    fn query_images(
        &self,
        bounds: &GeoBounds,
        range: &DateRange,
        source: &str,
    ) -> Result<Vec<ImageHandle>, Error> {
        let pending = self.failures_left.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_left.store(pending - 1, Ordering::SeqCst);
            return Err(Error::transient("query_images", "service unavailable"));
        }
        if let Some(extent) = self.required_extent {
            let covers = bounds.min_lon <= extent.min_lon
                && bounds.max_lon >= extent.max_lon
                && bounds.min_lat <= extent.min_lat
                && bounds.max_lat >= extent.max_lat;
            if !covers {
                return Ok(Vec::new());
            }
        }
        Ok(self
            .images
            .iter()
            .filter(|h| h.source == source)
            .filter(|h| h.acquired.map_or(true, |d| range.contains(d)))
            .cloned()
            .collect())
    }

    fn build_composite(
        &self,
        images: &[ImageHandle],
        cloud: &CloudFilter,
    ) -> Result<ImageHandle, Error> {
        if let Ok(mut last) = self.last_cloud.lock() {
            *last = Some(*cloud);
        }
        let source = images.first().map(|h| h.source.clone()).unwrap_or_default();
        Ok(ImageHandle {
            id: format!("composite:{source}:{}", images.len()),
            source,
            acquired: None,
        })
    }

    fn fetch(
        &self,
        handle: &ImageHandle,
        bounds: &GeoBounds,
        meters_per_pixel: f64,
    ) -> Result<ReferenceImage, Error> {
        let (w, h) = self.reference_size;
        Ok(ReferenceImage {
            id: handle.id.clone(),
            pixels: GrayImage::new(w, h),
            geo: ReferenceGeoModel::from_bounds(bounds, w, h)?,
            meters_per_pixel,
        })
    }
}

/// Config with fast retries and the given reference sources at 30 m.
pub(crate) fn test_config(sources: &[&str]) -> crate::config::RegistrationConfig {
    let mut config = crate::config::RegistrationConfig::default();
    config.reference.sources = sources
        .iter()
        .map(|s| crate::reference::SourceSpec::new(*s, 30.0))
        .collect();
    config.retry = crate::retry::RetryPolicy {
        max_attempts: 2,
        delay_ms: 0,
    };
    config.batch.workers = 2;
    config
}

/// A registered 800×600 neighbour frame at 30 m/px whose image → projected
/// transform is north-up with its top-left corner at (-91°, 33°).
pub(crate) struct Neighbour {
    pub(crate) frame: crate::store::FrameId,
    pub(crate) result: crate::pipeline::RegistrationResult,
}

impl Neighbour {
    pub(crate) fn new(frame: u32, anchor_pixels: &[[f64; 2]]) -> Self {
        use crate::geo::{lonlat_to_projected, projected_to_lonlat, LonLat};

        let origin = lonlat_to_projected([-91.0, 33.0]);
        let to_projected =
            GeoTransform::scale_translate(30.0, -30.0, origin[0], origin[1]).expect("affine");
        let to_lonlat = |p: [f64; 2]| projected_to_lonlat(to_projected.forward(p));

        let mut result = crate::pipeline::RegistrationResult::empty((800, 600));
        result.confidence = crate::confidence::Confidence::High;
        result.image_to_projected = to_projected;
        result.center = Some(LonLat::from_array(to_lonlat([400.0, 300.0])));
        result.reference_mpp = Some(30.0);
        result.inliers =
            CorrespondenceSet::from_pairs(anchor_pixels.iter().map(|&p| (p, to_lonlat(p))));
        result.state = crate::pipeline::PipelineState::Done;
        Self {
            frame: crate::store::FrameId::new("ISS030", "E", frame),
            result,
        }
    }

    pub(crate) fn center(&self) -> crate::geo::LonLat {
        self.result.center.expect("neighbour centre")
    }

    pub(crate) fn source_image() -> crate::store::SourceImage {
        crate::store::SourceImage {
            pixels: GrayImage::new(800, 600),
            meters_per_pixel: Some(30.0),
        }
    }
}
