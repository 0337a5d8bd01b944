//! The `MergeStore` trait: persistence seam of the merge engine.
//!
//! The trait is implemented by storage backends (e.g.
//! `wavelink-store-sqlite`). Every write is a natural-key upsert scoped to
//! one logical unit (one identity plan, one world event's facet set) and
//! committed atomically; a failing unit leaves no partial rows behind.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::{
  event::{EventFacetUnit, FacetUpsertReport},
  identity::IdentityPlan,
  model::{
    HeatRecord, ResultRecord, ScoreRecord, SourceEventRecord, SourceRef, UnifiedAthlete,
    WorldEvent,
  },
};

/// Result of trying to take the exclusive run lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
  Acquired,
  /// Another run holds the lock.
  Held { holder: Uuid, since: DateTime<Utc> },
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a wavelink persistence backend.
///
/// All methods return `Send` futures so the trait can be driven from a
/// multi-threaded runtime.
pub trait MergeStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Run lock ──────────────────────────────────────────────────────────

  /// Take the store-wide run lock for `run_id`. Never blocks; reports the
  /// current holder instead.
  fn acquire_run_lock(
    &self,
    run_id: Uuid,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<LockOutcome, Self::Error>> + Send + '_;

  /// Release the lock if `run_id` holds it.
  fn release_run_lock(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Clear the lock whoever holds it. Returns the former holder.
  fn force_unlock(&self) -> impl Future<Output = Result<Option<Uuid>, Self::Error>> + Send + '_;

  // ── Identities ────────────────────────────────────────────────────────

  /// The athlete that `source_ref` is linked to, with all its links.
  fn athlete_for(
    &self,
    source_ref: SourceRef,
  ) -> impl Future<Output = Result<Option<UnifiedAthlete>, Self::Error>> + Send + '_;

  fn get_athlete(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<UnifiedAthlete>, Self::Error>> + Send + '_;

  /// All athletes, ordered by creation time then id.
  fn list_athletes(
    &self,
  ) -> impl Future<Output = Result<Vec<UnifiedAthlete>, Self::Error>> + Send + '_;

  /// Apply one identity plan in a single transaction and return the athlete
  /// id it concerns. Link uniqueness is re-checked inside the transaction.
  fn apply_identity(
    &self,
    plan: IdentityPlan,
  ) -> impl Future<Output = Result<Uuid, Self::Error>> + Send + '_;

  // ── Events ────────────────────────────────────────────────────────────

  /// The world event a source event is linked to.
  fn world_event_for(
    &self,
    source_ref: SourceRef,
  ) -> impl Future<Output = Result<Option<WorldEvent>, Self::Error>> + Send + '_;

  fn get_world_event(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<WorldEvent>, Self::Error>> + Send + '_;

  fn list_world_events(
    &self,
  ) -> impl Future<Output = Result<Vec<WorldEvent>, Self::Error>> + Send + '_;

  /// World events whose date range intersects `start..=end`, ordered by
  /// start date then id.
  fn world_events_overlapping(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> impl Future<Output = Result<Vec<WorldEvent>, Self::Error>> + Send + '_;

  /// Source events linked to a world event, ordered by source then id.
  fn source_events_for(
    &self,
    world_event_id: Uuid,
  ) -> impl Future<Output = Result<Vec<SourceEventRecord>, Self::Error>> + Send + '_;

  /// Write one world event's facet set in a single transaction: the world
  /// event row, member links and every facet row, followed by re-election
  /// of the primary source over all stored facets of the event.
  fn apply_event_unit(
    &self,
    unit: EventFacetUnit,
  ) -> impl Future<Output = Result<FacetUpsertReport, Self::Error>> + Send + '_;

  // ── Serving reads ─────────────────────────────────────────────────────

  /// Results of every source joined to a world event.
  fn results_for_world_event(
    &self,
    world_event_id: Uuid,
  ) -> impl Future<Output = Result<Vec<ResultRecord>, Self::Error>> + Send + '_;

  fn heats_for_world_event(
    &self,
    world_event_id: Uuid,
  ) -> impl Future<Output = Result<Vec<HeatRecord>, Self::Error>> + Send + '_;

  fn scores_for_world_event(
    &self,
    world_event_id: Uuid,
  ) -> impl Future<Output = Result<Vec<ScoreRecord>, Self::Error>> + Send + '_;

  /// Results of an athlete across sources, joined through its source links.
  fn results_for_athlete(
    &self,
    athlete_id: Uuid,
  ) -> impl Future<Output = Result<Vec<ResultRecord>, Self::Error>> + Send + '_;

  fn scores_for_athlete(
    &self,
    athlete_id: Uuid,
  ) -> impl Future<Output = Result<Vec<ScoreRecord>, Self::Error>> + Send + '_;
}
