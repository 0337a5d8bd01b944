//! Error types for `wavelink-core`.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{matcher::Stage, model::SourceRef, review::Verdict};

#[derive(Debug, Error)]
pub enum Error {
  /// Malformed input, rejected before scoring.
  #[error("validation error: {0}")]
  Validation(String),

  /// Two or more right candidates tied at the same stage and score.
  #[error("ambiguous match for {left}: {tied} candidates tied at {stage} with score {score:.2}")]
  AmbiguousMatch {
    left:  SourceRef,
    tied:  usize,
    stage: Stage,
    score: f64,
  },

  /// Both sides of an accepted match already belong to different athletes.
  #[error("identity conflict: {left} is unified as {left_id} but {right} is unified as {right_id}")]
  IdentityConflict {
    left:     SourceRef,
    left_id:  Uuid,
    right:    SourceRef,
    right_id: Uuid,
  },

  /// The target athlete already holds a different link in the same source.
  #[error("identity conflict: athlete {unified_id} already links {existing}, refusing {incoming}")]
  SourceSlotTaken {
    unified_id: Uuid,
    existing:   SourceRef,
    incoming:   SourceRef,
  },

  #[error("persistence error: {0}")]
  Persistence(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("merge already in progress (run {holder} since {since})")]
  ConcurrentRun { holder: Uuid, since: DateTime<Utc> },

  #[error("review decision not found: {0}")]
  DecisionNotFound(Uuid),

  #[error("review decision {decision_id} is already resolved as {verdict}")]
  AlreadyResolved { decision_id: Uuid, verdict: Verdict },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Wrap a backend error as a persistence failure.
  pub fn persistence<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Persistence(Box::new(err))
  }

  /// Whether this is an identity conflict, including one raised by a backend
  /// re-check and wrapped as a persistence error.
  pub fn is_conflict(&self) -> bool {
    match self {
      Self::IdentityConflict { .. } | Self::SourceSlotTaken { .. } => true,
      Self::Persistence(inner) => {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(inner.as_ref());
        while let Some(err) = cause {
          if let Some(core) = err.downcast_ref::<Error>() {
            return core.is_conflict();
          }
          cause = err.source();
        }
        false
      }
      _ => false,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
