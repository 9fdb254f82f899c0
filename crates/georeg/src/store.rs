//! Persistence and target-image collaborators, with in-memory versions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::RwLock;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;
use crate::error::Error;
use crate::geo::{within_degrees, LonLat};
use crate::pipeline::RegistrationResult;

/// Mission / roll / frame identity of a target photograph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId {
    pub mission: String,
    pub roll: String,
    pub frame: u32,
}

impl FrameId {
    pub fn new(mission: impl Into<String>, roll: impl Into<String>, frame: u32) -> Self {
        Self {
            mission: mission.into(),
            roll: roll.into(),
            frame,
        }
    }

    /// Absolute frame-number distance, `None` across missions or rolls.
    pub fn frame_distance(&self, other: &FrameId) -> Option<u32> {
        (self.mission == other.mission && self.roll == other.roll)
            .then(|| self.frame.abs_diff(other.frame))
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.mission, self.roll, self.frame)
    }
}

/// Raw target photograph plus its ground resolution, when known.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: GrayImage,
    pub meters_per_pixel: Option<f64>,
}

pub trait TargetImageProvider: Send + Sync {
    fn source_image(&self, frame: &FrameId) -> Result<SourceImage, Error>;
}

/// A stored result together with the frame it belongs to.
#[derive(Debug, Clone)]
pub struct StoredResult {
    pub frame: FrameId,
    pub result: RegistrationResult,
}

pub trait ResultStore: Send + Sync {
    /// HIGH-confidence results of `mission` whose centre lies within
    /// `max_distance_deg` of `center` in both longitude and latitude.
    fn high_confidence_results_near(
        &self,
        center: LonLat,
        mission: &str,
        max_distance_deg: f64,
    ) -> Result<Vec<StoredResult>, Error>;

    /// Replace any previous result for `frame`.
    fn store(&self, frame: &FrameId, result: &RegistrationResult) -> Result<(), Error>;

    /// Record that output products for `frame` were written.
    fn mark_written(&self, frame: &FrameId) -> Result<(), Error>;
}

fn poisoned() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, "result store lock poisoned"))
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<FrameId, RegistrationResult>>,
    written: RwLock<HashSet<FrameId>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, frame: &FrameId) -> Option<RegistrationResult> {
        self.results.read().ok()?.get(frame).cloned()
    }

    pub fn len(&self) -> usize {
        self.results.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_written(&self, frame: &FrameId) -> bool {
        self.written
            .read()
            .map(|w| w.contains(frame))
            .unwrap_or(false)
    }
}

impl ResultStore for InMemoryResultStore {
    fn high_confidence_results_near(
        &self,
        center: LonLat,
        mission: &str,
        max_distance_deg: f64,
    ) -> Result<Vec<StoredResult>, Error> {
        let results = self.results.read().map_err(|_| poisoned())?;
        let mut out: Vec<StoredResult> = results
            .iter()
            .filter(|(frame, r)| frame.mission == mission && r.confidence == Confidence::High)
            .filter(|(_, r)| {
                r.center
                    .is_some_and(|c| within_degrees(c, center, max_distance_deg))
            })
            .map(|(frame, r)| StoredResult {
                frame: frame.clone(),
                result: r.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.frame.cmp(&b.frame));
        Ok(out)
    }

    fn store(&self, frame: &FrameId, result: &RegistrationResult) -> Result<(), Error> {
        self.results
            .write()
            .map_err(|_| poisoned())?
            .insert(frame.clone(), result.clone());
        self.written.write().map_err(|_| poisoned())?.remove(frame);
        Ok(())
    }

    fn mark_written(&self, frame: &FrameId) -> Result<(), Error> {
        self.written
            .write()
            .map_err(|_| poisoned())?
            .insert(frame.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryImageProvider {
    images: HashMap<FrameId, SourceImage>,
}

impl InMemoryImageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame: FrameId, image: SourceImage) {
        self.images.insert(frame, image);
    }

    pub fn with(mut self, frame: FrameId, image: SourceImage) -> Self {
        self.insert(frame, image);
        self
    }
}

impl TargetImageProvider for InMemoryImageProvider {
    fn source_image(&self, frame: &FrameId) -> Result<SourceImage, Error> {
        self.images.get(frame).cloned().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no source image for frame {frame}"),
            ))
        })
    }
}
