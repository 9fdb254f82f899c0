use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Non-terminal stages of one registration attempt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    ReferenceAcquired,
    Matched,
    GeoComposed,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::NotStarted => Some(Stage::ReferenceAcquired),
            Stage::ReferenceAcquired => Some(Stage::Matched),
            Stage::Matched => Some(Stage::GeoComposed),
            Stage::GeoComposed => None,
        }
    }
}

/// Why an attempt ended in [`PipelineState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Last stage reached before the failure.
    pub stage: Stage,
    /// Stable error label, see [`Error::kind`].
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Running { stage: Stage },
    Done,
    Failed(Failure),
}

impl Default for PipelineState {
    fn default() -> Self {
        PipelineState::Running {
            stage: Stage::NotStarted,
        }
    }
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineState::Running { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, PipelineState::Done)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            PipelineState::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// Move to the next stage, or to `Done` after `GeoComposed`.
    /// Terminal states do not move.
    pub fn advance(&mut self) {
        if let PipelineState::Running { stage } = *self {
            *self = match stage.next() {
                Some(next) => PipelineState::Running { stage: next },
                None => PipelineState::Done,
            };
            tracing::trace!(state = ?self, "pipeline state");
        }
    }

    /// Enter `Failed` from any non-terminal state.
    pub fn fail(&mut self, error: &Error) {
        if let PipelineState::Running { stage } = *self {
            *self = PipelineState::Failed(Failure {
                stage,
                kind: error.kind().to_string(),
                reason: error.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_through_every_stage_to_done() {
        let mut s = PipelineState::default();
        let mut seen = vec![s.clone()];
        while !s.is_terminal() {
            s.advance();
            seen.push(s.clone());
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(
            seen[3],
            PipelineState::Running {
                stage: Stage::GeoComposed
            }
        );
        assert!(s.is_done());
        s.fail(&Error::Cancelled);
        assert!(s.is_done());
    }

    #[test]
    fn failure_records_stage_and_kind() {
        let mut s = PipelineState::default();
        s.advance();
        s.advance();
        s.fail(&Error::GeoCompositionFailed {
            valid_points: 3,
            required: 10,
        });
        let f = s.failure().unwrap();
        assert_eq!(f.stage, Stage::Matched);
        assert_eq!(f.kind, "geo_composition_failed");
        s.advance();
        assert!(s.failure().is_some());
    }

    #[test]
    fn serializes_with_state_tag() {
        let json = serde_json::to_string(&PipelineState::Done).unwrap();
        assert_eq!(json, r#"{"state":"done"}"#);
    }
}
