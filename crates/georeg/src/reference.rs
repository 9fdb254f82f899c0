//! Reference imagery selection.
//!
//! Sources are tried in rank order over a set of seasonal windows around
//! the acquisition date. The first source with enough images yields a
//! composite; otherwise the best-populated source is composited over an
//! unbounded date range with a looser cloud filter.

use std::collections::HashSet;

use chrono::{Months, NaiveDate};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::compose::ReferenceGeoModel;
use crate::error::Error;
use crate::geo::{GeoBounds, LonLat};
use crate::retry::RetryPolicy;

/// A ranked imagery source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    /// Nominal ground resolution in meters per pixel.
    pub meters_per_pixel: f64,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, meters_per_pixel: f64) -> Self {
        Self {
            name: name.into(),
            meters_per_pixel,
        }
    }
}

/// Inclusive date range; `None` ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Opaque handle to an image or composite held by an [`ImagerySource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageHandle {
    pub id: String,
    pub source: String,
    pub acquired: Option<NaiveDate>,
}

/// Cloud filtering applied when compositing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudFilter {
    /// Maximum accepted cloud score per pixel, in `[0, 1]`.
    pub max_cloud_score: f64,
}

/// Reference raster downloaded for a bounding box.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub id: String,
    pub pixels: GrayImage,
    pub geo: ReferenceGeoModel,
    pub meters_per_pixel: f64,
}

/// External provider of reference imagery.
pub trait ImagerySource: Send + Sync {
    fn query_images(
        &self,
        bounds: &GeoBounds,
        range: &DateRange,
        source: &str,
    ) -> Result<Vec<ImageHandle>, Error>;

    fn build_composite(
        &self,
        images: &[ImageHandle],
        cloud: &CloudFilter,
    ) -> Result<ImageHandle, Error>;

    /// Render `handle` over `bounds` at `meters_per_pixel`.
    fn fetch(
        &self,
        handle: &ImageHandle,
        bounds: &GeoBounds,
        meters_per_pixel: f64,
    ) -> Result<ReferenceImage, Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Sources in priority order.
    pub sources: Vec<SourceSpec>,
    /// A source with at least this many images is composited immediately.
    pub min_image_count: usize,
    /// Years searched before and after the acquisition year.
    pub year_radius: u32,
    /// Half-width of the seasonal window in each year, in months.
    pub window_half_months: u32,
    pub cloud_filter: CloudFilter,
    /// Cloud filter for the best-populated fallback composite.
    pub fallback_cloud_filter: CloudFilter,
    /// Reference edge length requested, in pixels.
    pub desired_image_px: u32,
    pub min_image_px: u32,
    pub max_image_px: u32,
    /// Buffer multiplier for the single widening retry.
    pub widen_factor: f64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceSpec::new("LT5_L1T", 30.0),
                SourceSpec::new("LE7_L1T", 30.0),
                SourceSpec::new("LC8_L1T", 30.0),
                SourceSpec::new("LM4_L1T", 60.0),
                SourceSpec::new("LM3_L1T", 60.0),
                SourceSpec::new("LM2_L1T", 60.0),
            ],
            min_image_count: 10,
            year_radius: 2,
            window_half_months: 3,
            cloud_filter: CloudFilter {
                max_cloud_score: 0.1,
            },
            fallback_cloud_filter: CloudFilter {
                max_cloud_score: 0.5,
            },
            desired_image_px: 2000,
            min_image_px: 500,
            max_image_px: 4000,
            widen_factor: 2.0,
        }
    }
}

impl ReferenceConfig {
    /// Bounding box around `center` sized for the desired reference edge
    /// length at `meters_per_pixel`.
    pub fn search_bounds(&self, center: LonLat, meters_per_pixel: f64) -> GeoBounds {
        let px = self
            .desired_image_px
            .clamp(self.min_image_px, self.max_image_px.max(self.min_image_px));
        GeoBounds::around(center, px as f64 / 2.0 * meters_per_pixel)
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedReference {
    pub source: SourceSpec,
    pub composite: ImageHandle,
    /// Images that went into the composite.
    pub image_count: usize,
    /// Whether the unbounded-date fallback produced this reference.
    pub wide_range: bool,
    /// Bounding box the composite covers.
    pub bounds: GeoBounds,
}

/// Seasonal windows `date ± window_half_months` in each year from
/// `-year_radius` to `+year_radius`.
pub fn seasonal_windows(date: NaiveDate, year_radius: u32, window_half_months: u32) -> Vec<DateRange> {
    let half = Months::new(window_half_months);
    let radius = year_radius as i64;
    (-radius..=radius)
        .filter_map(|offset| {
            let years = Months::new(12 * offset.unsigned_abs() as u32);
            let center = if offset < 0 {
                date.checked_sub_months(years)?
            } else {
                date.checked_add_months(years)?
            };
            Some(DateRange::new(
                center.checked_sub_months(half)?,
                center.checked_add_months(half)?,
            ))
        })
        .collect()
}

pub struct ReferenceSelector<'a, S: ImagerySource + ?Sized> {
    imagery: &'a S,
    config: &'a ReferenceConfig,
    retry: &'a RetryPolicy,
}

impl<'a, S: ImagerySource + ?Sized> ReferenceSelector<'a, S> {
    pub fn new(imagery: &'a S, config: &'a ReferenceConfig, retry: &'a RetryPolicy) -> Self {
        Self {
            imagery,
            config,
            retry,
        }
    }

    pub fn search_bounds(&self, center: LonLat, meters_per_pixel: f64) -> GeoBounds {
        self.config.search_bounds(center, meters_per_pixel)
    }

    /// Select a reference for `bounds`, widening once if nothing is found.
    pub fn select_with_widening(
        &self,
        bounds: &GeoBounds,
        date: NaiveDate,
    ) -> Result<SelectedReference, Error> {
        match self.select(bounds, date) {
            Err(Error::ReferenceUnavailable { .. }) => {
                let wider = bounds.scaled(self.config.widen_factor);
                tracing::info!(%bounds, %wider, "no reference imagery, retrying with a wider region");
                self.select(&wider, date)
            }
            other => other,
        }
    }

    /// Select a reference composite covering `bounds` near `date`.
    pub fn select(&self, bounds: &GeoBounds, date: NaiveDate) -> Result<SelectedReference, Error> {
        let windows = seasonal_windows(date, self.config.year_radius, self.config.window_half_months);
        let mut best: Option<(&SourceSpec, usize)> = None;

        for source in &self.config.sources {
            let images = self.query_windows(bounds, &windows, &source.name)?;
            tracing::debug!(source = %source.name, count = images.len(), "queried reference imagery");
            if images.len() > best.map_or(0, |(_, n)| n) {
                best = Some((source, images.len()));
            }
            if images.len() >= self.config.min_image_count {
                let composite = self.composite(&images, &self.config.cloud_filter)?;
                tracing::info!(source = %source.name, count = images.len(), "selected reference source");
                return Ok(SelectedReference {
                    source: source.clone(),
                    composite,
                    image_count: images.len(),
                    wide_range: false,
                    bounds: *bounds,
                });
            }
        }

        let Some((source, _)) = best else {
            return Err(Error::ReferenceUnavailable { bounds: *bounds });
        };
        let range = DateRange::unbounded();
        let images = self.retry.run("query_images", || {
            self.imagery.query_images(bounds, &range, &source.name)
        })?;
        if images.is_empty() {
            return Err(Error::ReferenceUnavailable { bounds: *bounds });
        }
        let composite = self.composite(&images, &self.config.fallback_cloud_filter)?;
        tracing::info!(
            source = %source.name,
            count = images.len(),
            "no source met the image threshold, using best-populated source over all dates"
        );
        Ok(SelectedReference {
            source: source.clone(),
            composite,
            image_count: images.len(),
            wide_range: true,
            bounds: *bounds,
        })
    }

    /// Download the selected composite.
    pub fn fetch(&self, selected: &SelectedReference) -> Result<ReferenceImage, Error> {
        self.retry.run("fetch_reference", || {
            self.imagery.fetch(
                &selected.composite,
                &selected.bounds,
                selected.source.meters_per_pixel,
            )
        })
    }

    fn query_windows(
        &self,
        bounds: &GeoBounds,
        windows: &[DateRange],
        source: &str,
    ) -> Result<Vec<ImageHandle>, Error> {
        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for window in windows {
            let found = self
                .retry
                .run("query_images", || self.imagery.query_images(bounds, window, source))?;
            images.extend(found.into_iter().filter(|h| seen.insert(h.id.clone())));
        }
        Ok(images)
    }

    fn composite(&self, images: &[ImageHandle], cloud: &CloudFilter) -> Result<ImageHandle, Error> {
        self.retry
            .run("build_composite", || self.imagery.build_composite(images, cloud))
    }
}
