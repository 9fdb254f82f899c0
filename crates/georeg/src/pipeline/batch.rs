//! Batch registration over a fixed-size worker pool.

use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::register::{Registrar, RegistrationRequest};
use super::result::RegistrationResult;
use super::state::Stage;
use crate::config::RegistrationConfig;
use crate::confidence::Confidence;
use crate::error::Error;
use crate::geo::LonLat;
use crate::matcher::{FeatureMatcher, MatchStrategy, OrbFeatureMatcher};
use crate::raster::{FileRasterIo, RasterIo};
use crate::reference::ImagerySource;
use crate::resolution::{CaptureGeometry, GroundResolutionEstimator};
use crate::retry::RetryPolicy;
use crate::store::{FrameId, ResultStore, TargetImageProvider};
use crate::uncertainty::UncertaintyModeler;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker threads; 0 lets rayon decide.
    pub workers: usize,
    /// When set, uncertainty rasters of registered frames are written here.
    pub output_dir: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            output_dir: None,
        }
    }
}

/// Which registration path a job takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Match against reference imagery.
    #[default]
    Direct,
    /// Match against registered neighbours only.
    LocalChain,
    /// Reference imagery first, neighbours when that finds no match.
    DirectThenLocal,
}

/// One queued target frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationJob {
    pub frame: FrameId,
    pub center: LonLat,
    pub acquisition_date: NaiveDate,
    #[serde(default)]
    pub capture: Option<CaptureGeometry>,
    #[serde(default)]
    pub strategy: Strategy,
}

/// Shared flag that stops queued jobs from starting.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameStatus {
    Registered {
        confidence: Confidence,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Set when the result was stored but its output files were not
        /// written.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_error: Option<String>,
    },
    Failed {
        kind: String,
        reason: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameOutcome {
    pub frame: FrameId,
    #[serde(flatten)]
    pub status: FrameStatus,
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub high: usize,
    pub low: usize,
    pub none: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    fn add(&mut self, status: &FrameStatus) {
        match status {
            FrameStatus::Registered { confidence, .. } => match confidence {
                Confidence::High => self.high += 1,
                Confidence::Low => self.low += 1,
                Confidence::None => self.none += 1,
            },
            FrameStatus::Failed { .. } => self.failed += 1,
            FrameStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Frames that ran to completion or failure.
    pub fn processed(&self) -> usize {
        self.high + self.low + self.none + self.failed
    }

    /// HIGH results as a fraction of processed frames.
    pub fn high_fraction(&self) -> f64 {
        match self.processed() {
            0 => 0.0,
            n => self.high as f64 / n as f64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<FrameOutcome>,
}

impl BatchReport {
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for o in &self.outcomes {
            counts.add(&o.status);
        }
        counts
    }

    pub fn by_mission(&self) -> BTreeMap<String, OutcomeCounts> {
        let mut map: BTreeMap<String, OutcomeCounts> = BTreeMap::new();
        for o in &self.outcomes {
            map.entry(o.frame.mission.clone()).or_default().add(&o.status);
        }
        map
    }
}

/// Registration pipeline wired to its collaborators.
pub struct Pipeline<M = OrbFeatureMatcher> {
    registrar: Registrar<M>,
    imagery: Arc<dyn ImagerySource>,
    store: Arc<dyn ResultStore>,
    images: Arc<dyn TargetImageProvider>,
    raster_io: Arc<dyn RasterIo>,
    estimator: Box<dyn GroundResolutionEstimator>,
    modeler: UncertaintyModeler,
    retry: RetryPolicy,
    batch: BatchConfig,
}

impl Pipeline<OrbFeatureMatcher> {
    pub fn new(
        config: &RegistrationConfig,
        imagery: Arc<dyn ImagerySource>,
        store: Arc<dyn ResultStore>,
        images: Arc<dyn TargetImageProvider>,
    ) -> Self {
        Self::from_registrar(Registrar::new(config), config, imagery, store, images)
    }
}

impl<M: FeatureMatcher> Pipeline<M> {
    pub fn with_backend(
        backend: M,
        config: &RegistrationConfig,
        imagery: Arc<dyn ImagerySource>,
        store: Arc<dyn ResultStore>,
        images: Arc<dyn TargetImageProvider>,
    ) -> Self {
        Self::from_registrar(Registrar::with_backend(backend, config), config, imagery, store, images)
    }

    fn from_registrar(
        registrar: Registrar<M>,
        config: &RegistrationConfig,
        imagery: Arc<dyn ImagerySource>,
        store: Arc<dyn ResultStore>,
        images: Arc<dyn TargetImageProvider>,
    ) -> Self {
        Self {
            registrar,
            imagery,
            store,
            images,
            raster_io: Arc::new(FileRasterIo),
            estimator: Box::new(config.resolution.clone()),
            modeler: UncertaintyModeler::new(config.uncertainty.clone()),
            retry: config.retry.clone(),
            batch: config.batch.clone(),
        }
    }

    pub fn with_raster_io(mut self, raster_io: Arc<dyn RasterIo>) -> Self {
        self.raster_io = raster_io;
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn GroundResolutionEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn registrar(&self) -> &Registrar<M> {
        &self.registrar
    }

    /// Register one frame, store its result and write its outputs.
    ///
    /// Output failures are logged and leave the stored result in place.
    pub fn process(&self, job: &RegistrationJob) -> Result<RegistrationResult, Error> {
        self.process_frame(job).map(|(result, _)| result)
    }

    /// The stored result, plus the output error when writing outputs failed.
    fn process_frame(
        &self,
        job: &RegistrationJob,
    ) -> Result<(RegistrationResult, Option<Error>), Error> {
        let source = self
            .retry
            .run("source_image", || self.images.source_image(&job.frame))?;
        let meters_per_pixel = source.meters_per_pixel.or_else(|| {
            job.capture
                .as_ref()
                .and_then(|c| self.estimator.estimate(c))
        });
        let request = RegistrationRequest {
            target: &source.pixels,
            center: job.center,
            meters_per_pixel,
            acquisition_date: job.acquisition_date,
            strategy: MatchStrategy::Thorough,
        };

        let result = match job.strategy {
            Strategy::Direct => self.registrar.register_direct(&request, self.imagery.as_ref()),
            Strategy::LocalChain => self.registrar.register_local(
                &job.frame,
                &request,
                self.store.as_ref(),
                self.images.as_ref(),
            ),
            Strategy::DirectThenLocal => {
                let direct = self.registrar.register_direct(&request, self.imagery.as_ref());
                if direct.is_registered() {
                    direct
                } else {
                    let local = self.registrar.register_local(
                        &job.frame,
                        &request,
                        self.store.as_ref(),
                        self.images.as_ref(),
                    );
                    if local.is_registered() {
                        local
                    } else {
                        direct
                    }
                }
            }
        };

        self.retry
            .run("store_result", || self.store.store(&job.frame, &result))?;
        let output_error = if result.is_registered() {
            self.write_outputs(&job.frame, &result).err()
        } else {
            None
        };
        if let Some(e) = &output_error {
            tracing::warn!(kind = e.kind(), "result stored but outputs not written: {}", e);
        }
        Ok((result, output_error))
    }

    fn write_outputs(&self, frame: &FrameId, result: &RegistrationResult) -> Result<(), Error> {
        let Some(dir) = &self.batch.output_dir else {
            return Ok(());
        };
        let model = result.uncertainty(&self.modeler)?;
        let path = dir.join(format!("{frame}-uncertainty.tif"));
        self.retry
            .run("write_raster", || self.raster_io.write_float_raster(&path, &model.raster))?;
        self.retry.run("mark_written", || self.store.mark_written(frame))?;
        tracing::debug!(path = %path.display(), rms_error_px = model.rms_error_px, "wrote outputs");
        Ok(())
    }

    /// Process `jobs` on the worker pool. Jobs not yet started when
    /// `cancel` fires are reported as cancelled; running jobs finish.
    pub fn run_batch(
        &self,
        jobs: &[RegistrationJob],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.batch.workers)
            .build()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        tracing::info!(jobs = jobs.len(), workers = pool.current_num_threads(), "starting batch");
        let outcomes = pool.install(|| {
            jobs.par_iter()
                .map(|job| self.run_job(job, cancel))
                .collect::<Vec<_>>()
        });
        let report = BatchReport { outcomes };
        let counts = report.counts();
        tracing::info!(
            high = counts.high,
            low = counts.low,
            none = counts.none,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "batch finished"
        );
        Ok(report)
    }

    fn run_job(&self, job: &RegistrationJob, cancel: &CancellationToken) -> FrameOutcome {
        if cancel.is_cancelled() {
            return FrameOutcome {
                frame: job.frame.clone(),
                status: FrameStatus::Cancelled,
            };
        }
        let span = tracing::info_span!(
            "frame",
            mission = %job.frame.mission,
            roll = %job.frame.roll,
            frame = job.frame.frame
        );
        let _enter = span.enter();

        let status = match panic::catch_unwind(AssertUnwindSafe(|| self.process_frame(job))) {
            Ok(Ok((result, output_error))) => {
                tracing::info!(confidence = %result.confidence, "finished frame");
                FrameStatus::Registered {
                    confidence: result.confidence,
                    reason: result.failure_reason().map(str::to_string),
                    output_error: output_error.map(|e| e.to_string()),
                }
            }
            Ok(Err(e)) => {
                tracing::error!(kind = e.kind(), "frame failed: {}", e);
                self.record_failure(job, &e);
                FrameStatus::Failed {
                    kind: e.kind().to_string(),
                    reason: e.to_string(),
                }
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("frame panicked: {}", reason);
                self.record_failure(
                    job,
                    &Error::MatchFailed {
                        reason: format!("panic: {reason}"),
                    },
                );
                FrameStatus::Failed {
                    kind: "panic".to_string(),
                    reason,
                }
            }
        };
        FrameOutcome {
            frame: job.frame.clone(),
            status,
        }
    }

    /// Store an empty result so every attempted frame has a row. Only called
    /// when the frame's own result was never stored.
    fn record_failure(&self, job: &RegistrationJob, error: &Error) {
        let result = RegistrationResult::failed((0, 0), Stage::NotStarted, error);
        if let Err(e) = self.store.store(&job.frame, &result) {
            tracing::error!("could not record failed frame: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryImageProvider, InMemoryResultStore, SourceImage};
    use crate::test_utils::{test_config, FakeImagery, Neighbour, PanickingMatcher, SyntheticMatcher};
    use crate::transform::GeoTransform;
    use image::GrayImage;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2005, 6, 15).unwrap()
    }

    fn frame(n: u32) -> FrameId {
        FrameId::new("ISS030", "E", n)
    }

    fn job(frame: FrameId, center: LonLat, strategy: Strategy) -> RegistrationJob {
        RegistrationJob {
            frame,
            center,
            acquisition_date: date(),
            capture: None,
            strategy,
        }
    }

    fn image(w: u32, h: u32) -> SourceImage {
        SourceImage {
            pixels: GrayImage::new(w, h),
            meters_per_pixel: Some(30.0),
        }
    }

    fn matcher() -> SyntheticMatcher {
        let truth = GeoTransform::scale_translate(1.0, 1.0, 100.0, 200.0).unwrap();
        SyntheticMatcher::new(truth, 800, 600)
    }

    fn imagery() -> Arc<FakeImagery> {
        Arc::new(FakeImagery::new().with_images("A", 12, date()))
    }

    #[test]
    fn batch_reports_each_frame_and_records_failures() {
        let store = Arc::new(InMemoryResultStore::new());
        let images = InMemoryImageProvider::new()
            .with(frame(1), image(800, 600))
            .with(frame(2), image(800, 600));
        let pipeline = Pipeline::with_backend(
            matcher(),
            &test_config(&["A"]),
            imagery(),
            store.clone(),
            Arc::new(images),
        );
        let center = LonLat::new(-91.0, 33.0);
        let jobs: Vec<_> = (1..=3).map(|n| job(frame(n), center, Strategy::Direct)).collect();

        let report = pipeline.run_batch(&jobs, &CancellationToken::new()).unwrap();
        assert_eq!(report.outcomes.len(), 3);
        let counts = report.counts();
        assert_eq!(counts.high, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.processed(), 3);

        let missing = report.outcomes.iter().find(|o| o.frame == frame(3)).unwrap();
        assert!(matches!(&missing.status, FrameStatus::Failed { kind, .. } if kind == "io"));
        let row = store.get(&frame(3)).unwrap();
        assert_eq!(row.confidence, Confidence::None);
        assert!(row.failure_reason().is_some());
        assert!(store.get(&frame(1)).unwrap().is_registered());
    }

    #[test]
    fn registered_frames_get_an_uncertainty_raster() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&["A"]);
        config.batch.output_dir = Some(dir.path().to_path_buf());
        let store = Arc::new(InMemoryResultStore::new());
        let images = InMemoryImageProvider::new().with(frame(1), image(800, 600));
        let pipeline =
            Pipeline::with_backend(matcher(), &config, imagery(), store.clone(), Arc::new(images));

        let result = pipeline
            .process(&job(frame(1), LonLat::new(-91.0, 33.0), Strategy::Direct))
            .unwrap();
        assert!(result.is_registered());
        assert!(dir.path().join("ISS030-E-1-uncertainty.tif").exists());
        assert!(store.is_written(&frame(1)));
    }

    #[test]
    fn cancelled_batch_starts_nothing() {
        let store = Arc::new(InMemoryResultStore::new());
        let images = InMemoryImageProvider::new().with(frame(1), image(800, 600));
        let pipeline = Pipeline::with_backend(
            matcher(),
            &test_config(&["A"]),
            imagery(),
            store.clone(),
            Arc::new(images),
        );
        let jobs: Vec<_> = (1..=4)
            .map(|n| job(frame(n), LonLat::new(-91.0, 33.0), Strategy::Direct))
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = pipeline.run_batch(&jobs, &cancel).unwrap();
        assert_eq!(report.counts().cancelled, 4);
        assert_eq!(report.counts().processed(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn panicking_frame_does_not_stop_the_batch() {
        let store = Arc::new(InMemoryResultStore::new());
        let images = InMemoryImageProvider::new()
            .with(frame(1), image(800, 600))
            .with(frame(2), image(640, 480))
            .with(frame(3), image(800, 600));
        let backend = PanickingMatcher {
            inner: matcher(),
            panic_width: 640,
        };
        let pipeline = Pipeline::with_backend(
            backend,
            &test_config(&["A"]),
            imagery(),
            store.clone(),
            Arc::new(images),
        );
        let jobs: Vec<_> = (1..=3)
            .map(|n| job(frame(n), LonLat::new(-91.0, 33.0), Strategy::Direct))
            .collect();

        let report = pipeline.run_batch(&jobs, &CancellationToken::new()).unwrap();
        let counts = report.counts();
        assert_eq!(counts.high, 2);
        assert_eq!(counts.failed, 1);
        let crashed = report.outcomes.iter().find(|o| o.frame == frame(2)).unwrap();
        match &crashed.status {
            FrameStatus::Failed { kind, reason } => {
                assert_eq!(kind, "panic");
                assert!(reason.contains("backend crashed"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(store.get(&frame(2)).unwrap().confidence, Confidence::None);
    }

    #[test]
    fn direct_then_local_falls_back_to_neighbours() {
        let neighbour = Neighbour::new(100, &[[400.0, 300.0], [600.0, 400.0]]);
        let store = Arc::new(InMemoryResultStore::new());
        store.store(&neighbour.frame, &neighbour.result).unwrap();
        let images = InMemoryImageProvider::new()
            .with(neighbour.frame.clone(), Neighbour::source_image())
            .with(frame(102), image(800, 600));
        let truth = GeoTransform::scale_translate(1.0, 1.0, 50.0, 30.0).unwrap();
        let pipeline = Pipeline::with_backend(
            SyntheticMatcher::new(truth, 800, 600),
            &test_config(&["A"]),
            Arc::new(FakeImagery::new()),
            store.clone(),
            Arc::new(images),
        );

        let result = pipeline
            .process(&job(frame(102), neighbour.center(), Strategy::DirectThenLocal))
            .unwrap();
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.chained);
        assert_eq!(result.inliers.len(), 2);
        assert!(store.get(&frame(102)).unwrap().chained);
    }

    #[test]
    fn output_failure_keeps_the_stored_result() {
        // One anchor tie point: a valid chained HIGH match, but too few
        // points for an uncertainty raster.
        let neighbour = Neighbour::new(100, &[[400.0, 300.0]]);
        let store = Arc::new(InMemoryResultStore::new());
        store.store(&neighbour.frame, &neighbour.result).unwrap();
        let images = InMemoryImageProvider::new()
            .with(neighbour.frame.clone(), Neighbour::source_image())
            .with(frame(102), image(800, 600));
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&["A"]);
        config.batch.output_dir = Some(dir.path().to_path_buf());
        let truth = GeoTransform::scale_translate(1.0, 1.0, 50.0, 30.0).unwrap();
        let pipeline = Pipeline::with_backend(
            SyntheticMatcher::new(truth, 800, 600),
            &config,
            Arc::new(FakeImagery::new()),
            store.clone(),
            Arc::new(images),
        );
        let jobs = [job(frame(102), neighbour.center(), Strategy::LocalChain)];

        let report = pipeline.run_batch(&jobs, &CancellationToken::new()).unwrap();
        match &report.outcomes[0].status {
            FrameStatus::Registered {
                confidence,
                output_error,
                ..
            } => {
                assert_eq!(*confidence, Confidence::High);
                assert!(output_error.as_deref().unwrap().contains("degenerate"));
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(report.counts().high, 1);
        assert_eq!(report.counts().failed, 0);

        let stored = store.get(&frame(102)).unwrap();
        assert_eq!(stored.confidence, Confidence::High);
        assert_eq!(stored.image_size, [800, 600]);
        assert_eq!(stored.inliers.len(), 1);
        assert!(!store.is_written(&frame(102)));
        assert!(!dir.path().join("ISS030-E-102-uncertainty.tif").exists());
    }

    #[test]
    fn report_counts_per_mission() {
        let outcome = |mission: &str, status: FrameStatus| FrameOutcome {
            frame: FrameId::new(mission, "E", 1),
            status,
        };
        let high = || FrameStatus::Registered {
            confidence: Confidence::High,
            reason: None,
            output_error: None,
        };
        let report = BatchReport {
            outcomes: vec![
                outcome("ISS030", high()),
                outcome("ISS030", FrameStatus::Cancelled),
                outcome("ISS031", high()),
                outcome(
                    "ISS031",
                    FrameStatus::Registered {
                        confidence: Confidence::None,
                        reason: Some("no match".into()),
                        output_error: None,
                    },
                ),
            ],
        };
        let by_mission = report.by_mission();
        assert_eq!(by_mission.len(), 2);
        assert_eq!(by_mission["ISS030"].high, 1);
        assert_eq!(by_mission["ISS030"].cancelled, 1);
        assert_eq!(by_mission["ISS031"].processed(), 2);
        assert!((report.counts().high_fraction() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn frame_outcome_json_is_flat() {
        let outcome = FrameOutcome {
            frame: frame(7),
            status: FrameStatus::Failed {
                kind: "io".into(),
                reason: "missing".into(),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "io");
        assert_eq!(json["frame"]["frame"], 7);
    }
}
