//! georeg: georegistration of orbital photographs against reference
//! satellite imagery.
//!
//! The registration stages are:
//!
//! 1. **Reference** – choose reference imagery for a region and date, falling
//!    back across sources and time windows.
//! 2. **Matcher** – resolution-normalised feature matching and a robust
//!    target → reference homography.
//! 3. **Confidence** – NONE / LOW / HIGH from match statistics.
//! 4. **Compose** – target pixel → longitude/latitude and → projected
//!    meters transforms through the reference geo model.
//! 5. **Uncertainty** – distance-to-tie-point error raster and reverse-fit
//!    RMS.
//! 6. **Pipeline** – direct and local-chain strategies, batch processing.
//!
//! # Public API
//! - [`Registrar`] for single images and [`Pipeline`] for batches
//! - [`RegistrationConfig`] for tuning
//! - collaborator traits ([`ImagerySource`], [`ResultStore`],
//!   [`TargetImageProvider`], [`RasterIo`], [`FeatureMatcher`],
//!   [`GroundResolutionEstimator`]) and the result types

mod compose;
mod config;
mod confidence;
mod error;
mod features;
mod geo;
mod homography;
mod matcher;
mod pipeline;
mod raster;
mod reference;
mod resolution;
mod retry;
mod store;
mod transform;
mod uncertainty;

#[cfg(test)]
pub(crate) mod test_utils;

pub use compose::{ComposeConfig, GeoComposer, GeoComposition, ReferenceGeoModel};
pub use config::RegistrationConfig;
pub use confidence::{classify, Confidence, ConfidenceThresholds, MatchStatistics};
pub use error::{Error, Result};
pub use features::FeatureConfig;
pub use geo::{lonlat_to_projected, meters_per_degree, projected_to_lonlat, GeoBounds, LonLat};
pub use homography::{
    Correspondence, CorrespondenceSet, HomographyError, RansacHomographyConfig, RansacStats,
};
pub use matcher::{
    FeatureMatcher, ImageMatcher, MatchOutcome, MatchStrategy, MatcherConfig, OrbFeatureMatcher,
};
pub use pipeline::{
    BatchConfig, BatchReport, CancellationToken, Failure, FrameOutcome, FrameStatus,
    LocalChainConfig, OutcomeCounts, Pipeline, PipelineState, ReferenceInput, Registrar,
    RegistrationJob, RegistrationRequest, RegistrationResult, Stage, Strategy,
};
pub use raster::{geo_sidecar_path, write_geo_bounds, FileRasterIo, RasterIo};
pub use reference::{
    seasonal_windows, CloudFilter, DateRange, ImageHandle, ImagerySource, ReferenceConfig,
    ReferenceImage, ReferenceSelector, SelectedReference, SourceSpec,
};
pub use resolution::{
    CaptureGeometry, FirstOf, FocalLengthTable, GroundResolutionEstimator, PinholeGeometry,
};
pub use retry::RetryPolicy;
pub use store::{
    FrameId, InMemoryImageProvider, InMemoryResultStore, ResultStore, SourceImage, StoredResult,
    TargetImageProvider,
};
pub use transform::{GeoTransform, TransformError, TransformKind};
pub use uncertainty::{
    reverse_fit_rms, FloatRaster, ReverseFitModel, UncertaintyConfig, UncertaintyModel,
    UncertaintyModeler,
};
