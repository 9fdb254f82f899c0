//! Registration orchestration.
//!
//! A target image moves through `NotStarted → ReferenceAcquired → Matched →
//! GeoComposed → Done`, or into `Failed` from any of the running stages.
//! Expected failures never surface as errors: they come back as a
//! [`RegistrationResult`] with `Confidence::None`, identity transforms and
//! no tie points, so storage always records the attempt.
//!
//! Entry points:
//! - [`Registrar::register_image`]: pure single-image registration, with an
//!   explicit reference or one selected from an imagery source
//! - [`Registrar::register_local`]: local chaining against registered
//!   neighbours
//! - [`Pipeline::run_batch`]: per-frame jobs on a worker pool with
//!   cooperative cancellation

mod batch;
mod chain;
mod register;
mod result;
mod state;

pub use batch::{
    BatchConfig, BatchReport, CancellationToken, FrameOutcome, FrameStatus, OutcomeCounts,
    Pipeline, RegistrationJob, Strategy,
};
pub use chain::LocalChainConfig;
pub use register::{ReferenceInput, Registrar, RegistrationRequest};
pub use result::RegistrationResult;
pub use state::{Failure, PipelineState, Stage};
