//! Propagation of an image-to-reference transform into geographic and
//! projected-meters coordinates.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::geo::{lonlat_to_projected, projected_to_lonlat, GeoBounds};
use crate::homography::{
    estimate_homography_dlt, fit_homography_robust, CorrespondenceSet, HomographyError,
    RansacHomographyConfig, RansacStats,
};
use crate::transform::GeoTransform;

/// Reference image pixel → longitude/latitude model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceGeoModel {
    pub width: u32,
    pub height: u32,
    pub pixel_to_geo: GeoTransform,
}

impl ReferenceGeoModel {
    pub fn new(width: u32, height: u32, pixel_to_geo: GeoTransform) -> Self {
        Self {
            width,
            height,
            pixel_to_geo,
        }
    }

    /// North-up image whose outer pixel edges are `bounds`.
    pub fn from_bounds(bounds: &GeoBounds, width: u32, height: u32) -> Result<Self, Error> {
        if width == 0 || height == 0 || !bounds.is_valid() {
            return Err(invalid_model(format!(
                "reference model needs a non-empty image and valid bounds, got {width}x{height}, {bounds}"
            )));
        }
        let x_scale = bounds.width_deg() / width as f64;
        let y_scale = bounds.height_deg() / height as f64;
        let pixel_to_geo =
            GeoTransform::scale_translate(x_scale, -y_scale, bounds.min_lon, bounds.max_lat)?;
        Ok(Self::new(width, height, pixel_to_geo))
    }

    /// Estimate the model from a pixel → projected-meters transform by
    /// sampling a grid over the image.
    pub fn from_pixel_to_projected(
        pixel_to_projected: &GeoTransform,
        width: u32,
        height: u32,
    ) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(invalid_model(format!(
                "reference model needs a non-empty image, got {width}x{height}"
            )));
        }
        let spacing = grid_spacing(width, height, 100);
        let mut set = CorrespondenceSet::new();
        for x in (0..width).step_by(spacing) {
            for y in (0..height).step_by(spacing) {
                let p = [x as f64, y as f64];
                if let Some(m) = pixel_to_projected.try_forward(p) {
                    set.push(p, projected_to_lonlat(m));
                }
            }
        }
        let (src, dst) = (set.sources(), set.targets());
        let h = estimate_homography_dlt(&src, &dst).map_err(|e| match e {
            HomographyError::TooFewPoints { got, .. } => {
                Error::DegenerateCorrespondenceSet { got }
            }
            other => Error::Homography(other),
        })?;
        Ok(Self::new(width, height, GeoTransform::from_matrix(h)?))
    }

    /// Whether `p` lies in `[0, width) × [0, height)`.
    pub fn contains_pixel(&self, p: [f64; 2]) -> bool {
        p[0] >= 0.0 && p[1] >= 0.0 && p[0] < self.width as f64 && p[1] < self.height as f64
    }

    /// Geographic bounding box of the image corners.
    pub fn bounds(&self) -> GeoBounds {
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]].map(|c| self.pixel_to_geo.forward(c));
        let mut b = GeoBounds::new(f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for c in corners {
            b.min_lon = b.min_lon.min(c[0]);
            b.max_lon = b.max_lon.max(c[0]);
            b.min_lat = b.min_lat.min(c[1]);
            b.max_lat = b.max_lat.max(c[1]);
        }
        b
    }

    /// Side of one pixel at the image center, in degrees and in projected
    /// meters.
    fn pixel_size(&self) -> (f64, f64) {
        let c = [self.width as f64 / 2.0, self.height as f64 / 2.0];
        let local_size = |f: &dyn Fn([f64; 2]) -> [f64; 2]| {
            let o = f(c);
            let dx = f([c[0] + 1.0, c[1]]);
            let dy = f([c[0], c[1] + 1.0]);
            let area = ((dx[0] - o[0]) * (dy[1] - o[1]) - (dx[1] - o[1]) * (dy[0] - o[0])).abs();
            area.sqrt()
        };
        let deg = local_size(&|p| self.pixel_to_geo.forward(p));
        let m = local_size(&|p| lonlat_to_projected(self.pixel_to_geo.forward(p)));
        (deg, m)
    }
}

/// Geo-transform composer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Approximate number of grid samples over the target image.
    pub target_grid_points: usize,
    /// Minimum number of in-bounds grid points (and fit inliers).
    pub min_valid_points: usize,
    /// Fit inlier threshold, in reference pixels.
    pub inlier_threshold_ref_px: f64,
    /// RANSAC iterations per output fit.
    pub ransac_iters: usize,
    pub seed: u64,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            target_grid_points: 100,
            min_valid_points: 10,
            inlier_threshold_ref_px: 2.0,
            ransac_iters: 500,
            seed: 0,
        }
    }
}

/// Output of [`GeoComposer::compose`].
#[derive(Debug, Clone)]
pub struct GeoComposition {
    pub image_to_geo: GeoTransform,
    pub image_to_projected: GeoTransform,
    /// Reference pixel → geographic, for mapping reference-side inliers.
    pub reference_pixel_to_geo: GeoTransform,
    /// Validated grid: target pixel → longitude/latitude.
    pub grid: CorrespondenceSet,
    pub geo_fit: RansacStats,
    pub projected_fit: RansacStats,
}

/// Builds image → geographic and image → projected transforms.
#[derive(Debug, Clone, Default)]
pub struct GeoComposer {
    config: ComposeConfig,
}

fn grid_spacing(width: u32, height: u32, points: usize) -> usize {
    let divisions = 2.0 * (points.max(1) as f64).sqrt();
    (((width as f64 + height as f64) / divisions) as usize).max(1)
}

impl GeoComposer {
    pub fn new(config: ComposeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    /// Evenly spaced target grid mapped into the reference, keeping only
    /// points inside the reference image. Targets are reference pixels.
    pub fn reference_grid(
        &self,
        image_to_reference: &GeoTransform,
        target_size: (u32, u32),
        reference: &ReferenceGeoModel,
    ) -> CorrespondenceSet {
        let (w, h) = target_size;
        let spacing = grid_spacing(w, h, self.config.target_grid_points);
        let mut set = CorrespondenceSet::with_capacity(self.config.target_grid_points * 2);
        for x in (0..w).step_by(spacing) {
            for y in (0..h).step_by(spacing) {
                let p = [x as f64, y as f64];
                match image_to_reference.try_forward(p) {
                    Some(r) if reference.contains_pixel(r) => set.push(p, r),
                    _ => {}
                }
            }
        }
        set
    }

    /// Compose `image_to_reference` with the reference geo model.
    pub fn compose(
        &self,
        image_to_reference: &GeoTransform,
        target_size: (u32, u32),
        reference: &ReferenceGeoModel,
    ) -> Result<GeoComposition, Error> {
        let required = self.config.min_valid_points.max(4);
        let ref_grid = self.reference_grid(image_to_reference, target_size, reference);
        let spacing = grid_spacing(target_size.0, target_size.1, self.config.target_grid_points);
        if ref_grid.len() < required || !has_planar_spread(&ref_grid.sources(), spacing as f64) {
            tracing::warn!(
                valid_points = ref_grid.len(),
                required,
                "too few usable grid points for geo composition"
            );
            return Err(Error::GeoCompositionFailed {
                valid_points: ref_grid.len(),
                required,
            });
        }

        let geo_grid = ref_grid.map_targets(|r| reference.pixel_to_geo.try_forward(r));
        let projected_grid = geo_grid.map_targets(|g| Some(lonlat_to_projected(g)));

        let (deg_per_px, m_per_px) = reference.pixel_size();
        let geo = self.fit(&geo_grid, deg_per_px, required)?;
        let projected = self.fit(&projected_grid, m_per_px, required)?;

        tracing::debug!(
            grid_points = geo_grid.len(),
            geo_inliers = geo.1.n_inliers,
            projected_inliers = projected.1.n_inliers,
            "composed geo transforms"
        );

        Ok(GeoComposition {
            image_to_geo: geo.0,
            image_to_projected: projected.0,
            reference_pixel_to_geo: reference.pixel_to_geo,
            grid: geo_grid,
            geo_fit: geo.1,
            projected_fit: projected.1,
        })
    }

    fn fit(
        &self,
        set: &CorrespondenceSet,
        units_per_ref_px: f64,
        required: usize,
    ) -> Result<(GeoTransform, RansacStats), Error> {
        let config = RansacHomographyConfig {
            max_iters: self.config.ransac_iters,
            inlier_threshold: self.config.inlier_threshold_ref_px * units_per_ref_px,
            min_inliers: required,
            seed: self.config.seed,
        };
        let (h, _, stats) = fit_homography_robust(set, &config).map_err(|e| {
            tracing::warn!("geo fit failed: {}", e);
            Error::GeoCompositionFailed {
                valid_points: set.len(),
                required,
            }
        })?;
        Ok((GeoTransform::from_matrix(h)?, stats))
    }
}

/// The points must spread in two directions: the smaller principal standard
/// deviation must reach half the grid spacing.
fn has_planar_spread(points: &[[f64; 2]], spacing: f64) -> bool {
    let n = points.len() as f64;
    if points.len() < 3 {
        return false;
    }
    let cx = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in points {
        let (dx, dy) = (p[0] - cx, p[1] - cy);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let (sxx, syy, sxy) = (sxx / n, syy / n, sxy / n);
    let half_trace = 0.5 * (sxx + syy);
    let disc = (0.25 * (sxx - syy).powi(2) + sxy * sxy).sqrt();
    let minor = (half_trace - disc).max(0.0);
    minor.sqrt() >= 0.5 * spacing
}

fn invalid_model(message: String) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, message))
}
