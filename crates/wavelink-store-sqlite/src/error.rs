//! Error type for `wavelink-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] wavelink_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored discriminant (stage, verdict, score type) is not recognised.
  #[error("unknown {kind}: {value:?}")]
  UnknownValue { kind: &'static str, value: String },

  #[error("athlete not found: {0}")]
  AthleteNotFound(uuid::Uuid),
}

impl Error {
  /// The core error this wraps, if any.
  pub fn as_core(&self) -> Option<&wavelink_core::Error> {
    match self {
      Self::Core(err) => Some(err),
      _ => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
