//! Aggregate registration configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compose::ComposeConfig;
use crate::confidence::ConfidenceThresholds;
use crate::error::Error;
use crate::matcher::MatcherConfig;
use crate::pipeline::{BatchConfig, LocalChainConfig};
use crate::reference::ReferenceConfig;
use crate::resolution::FocalLengthTable;
use crate::retry::RetryPolicy;
use crate::uncertainty::UncertaintyConfig;

/// Every tunable of the pipeline. Missing JSON fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Feature matching and robust fit, including RANSAC.
    pub matcher: MatcherConfig,
    pub confidence: ConfidenceThresholds,
    pub compose: ComposeConfig,
    pub uncertainty: UncertaintyConfig,
    pub reference: ReferenceConfig,
    pub local_chain: LocalChainConfig,
    pub retry: RetryPolicy,
    pub batch: BatchConfig,
    /// Focal-length table used when a frame has no resolution.
    pub resolution: FocalLengthTable,
}

impl RegistrationConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
