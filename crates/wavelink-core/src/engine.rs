//! The merge orchestrator.
//!
//! One [`MergeEngine::run`] takes the store's run lock, resolves athlete
//! identities (matcher, review queue, identity planner) and then merges
//! event facets. Per-record and per-unit failures are collected in the
//! [`RunReport`]; only a held lock or an unreachable store aborts the run.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Days, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  config::MergeConfig,
  country::{CountryMapping, CountryTable},
  event::{EventFacetUnit, EventMatcher, UpsertCounts},
  identity::{IdentityPlanner, MatchEvidence, PlanKind},
  matcher::{CandidatePool, MatchDecision, Matcher, Outcome},
  model::{
    CandidateIdentity, ExtractionBatch, HeatRecord, ResultRecord, ScoreRecord,
    SourceEventRecord, SourceRef, WorldEvent,
  },
  review::{NewReview, ReviewQueue, Verdict},
  score::PreparedCandidate,
  store::{LockOutcome, MergeStore},
};

// ─── Report ──────────────────────────────────────────────────────────────────

/// One record or unit that could not be merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
  /// What failed: a source ref, a candidate pair or a world event.
  pub subject: String,
  pub error:   String,
}

/// Summary of one merge run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
  pub run_id:       Uuid,
  pub started_at:   DateTime<Utc>,
  pub finished_at:  DateTime<Utc>,
  /// Matches applied (automatic and adjudicated).
  pub accepted:     usize,
  /// Pairs waiting in the review queue after this run.
  pub reviewed:     usize,
  pub conflicted:   usize,
  pub failed:       usize,
  /// Tie reports; the tied pairs are counted in `reviewed`.
  pub ambiguous:    usize,
  pub created:      usize,
  pub attached:     usize,
  pub enriched:     usize,
  pub unchanged:    usize,
  /// Source-only candidates.
  pub unmatched:    usize,
  pub world_events: usize,
  pub results:      UpsertCounts,
  pub heats:        UpsertCounts,
  pub scores:       UpsertCounts,
  pub failures:     Vec<RunFailure>,
}

impl RunReport {
  fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
    Self {
      run_id,
      started_at,
      finished_at: started_at,
      accepted: 0,
      reviewed: 0,
      conflicted: 0,
      failed: 0,
      ambiguous: 0,
      created: 0,
      attached: 0,
      enriched: 0,
      unchanged: 0,
      unmatched: 0,
      world_events: 0,
      results: UpsertCounts::default(),
      heats: UpsertCounts::default(),
      scores: UpsertCounts::default(),
      failures: Vec::new(),
    }
  }

  fn fail(&mut self, subject: impl ToString, error: &Error) {
    warn!(subject = %subject.to_string(), %error, "merge unit failed");
    if error.is_conflict() {
      self.conflicted += 1;
    } else {
      self.failed += 1;
    }
    self.failures.push(RunFailure { subject: subject.to_string(), error: error.to_string() });
  }

  fn count_plan(&mut self, kind: PlanKind) {
    match kind {
      PlanKind::Create => self.created += 1,
      PlanKind::Attach => self.attached += 1,
      PlanKind::Enrich => self.enriched += 1,
      PlanKind::NoOp => self.unchanged += 1,
    }
  }
}

// ─── Facet bundles ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FacetBundle {
  results: Vec<ResultRecord>,
  heats:   Vec<HeatRecord>,
  scores:  Vec<ScoreRecord>,
}

impl FacetBundle {
  fn len(&self) -> usize { self.results.len() + self.heats.len() + self.scores.len() }

  fn extend(&mut self, other: FacetBundle) {
    self.results.extend(other.results);
    self.heats.extend(other.heats);
    self.scores.extend(other.scores);
  }
}

fn index_facets(
  results: Vec<ResultRecord>,
  heats: Vec<HeatRecord>,
  scores: Vec<ScoreRecord>,
) -> BTreeMap<SourceRef, FacetBundle> {
  let mut facets: BTreeMap<SourceRef, FacetBundle> = BTreeMap::new();
  for r in results {
    let key = SourceRef::new(r.source.clone(), r.source_event_id.clone());
    facets.entry(key).or_default().results.push(r);
  }
  for h in heats {
    let key = SourceRef::new(h.source.clone(), h.source_event_id.clone());
    facets.entry(key).or_default().heats.push(h);
  }
  for s in scores {
    let key = SourceRef::new(s.source.clone(), s.source_event_id.clone());
    facets.entry(key).or_default().scores.push(s);
  }
  facets
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct MergeEngine<S> {
  store:     S,
  config:    MergeConfig,
  countries: Option<CountryTable>,
}

impl<S> MergeEngine<S>
where
  S: MergeStore + ReviewQueue,
{
  /// Validate `config` and build an engine over `store`.
  pub fn new(store: S, config: MergeConfig) -> Result<Self> {
    config.validate()?;
    let countries = config
      .countries
      .as_ref()
      .map(CountryTable::from_config)
      .filter(|t| !t.is_empty());
    if countries.is_none() {
      info!("no country mapping configured; nationality stage disabled");
    }
    Ok(Self { store, config, countries })
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn config(&self) -> &MergeConfig { &self.config }

  fn countries(&self) -> Option<&dyn CountryMapping> {
    self.countries.as_ref().map(|t| t as &dyn CountryMapping)
  }

  /// Run one merge over `batch`.
  ///
  /// Fails fast with [`Error::ConcurrentRun`] when another run holds the
  /// lock; nothing is written in that case.
  pub async fn run(&self, batch: ExtractionBatch) -> Result<RunReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    match self.store.acquire_run_lock(run_id, started_at).await.map_err(Error::persistence)? {
      LockOutcome::Acquired => {}
      LockOutcome::Held { holder, since } => {
        warn!(%holder, %since, "merge already in progress");
        return Err(Error::ConcurrentRun { holder, since });
      }
    }

    info!(
      %run_id,
      candidates = batch.candidates.len(),
      events = batch.events.len(),
      results = batch.results.len(),
      heats = batch.heats.len(),
      scores = batch.scores.len(),
      "merge run started"
    );

    let outcome = self.run_locked(run_id, started_at, batch).await;

    if let Err(err) = self.store.release_run_lock(run_id).await {
      warn!(%run_id, error = %err, "failed to release run lock");
    }

    match &outcome {
      Ok(report) => info!(
        %run_id,
        accepted = report.accepted,
        reviewed = report.reviewed,
        conflicted = report.conflicted,
        failed = report.failed,
        "merge run finished"
      ),
      Err(err) => warn!(%run_id, error = %err, "merge run aborted"),
    }
    outcome
  }

  async fn run_locked(
    &self,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    batch: ExtractionBatch,
  ) -> Result<RunReport> {
    let mut report = RunReport::new(run_id, started_at);
    let ExtractionBatch { candidates, events, results, heats, scores } = batch;

    self.merge_identities(candidates, &mut report).await?;

    let scores = scores
      .into_iter()
      .filter(|s| match validate_score(s) {
        Ok(()) => true,
        Err(err) => {
          let subject = format!(
            "{}/{}/{}",
            SourceRef::new(s.source.clone(), s.source_event_id.clone()),
            s.heat_id,
            s.athlete_source_id
          );
          report.fail(subject, &err);
          false
        }
      })
      .collect();
    self
      .merge_events(events, index_facets(results, heats, scores), &mut report)
      .await?;

    report.finished_at = Utc::now();
    Ok(report)
  }

  // ── Identities ────────────────────────────────────────────────────────

  async fn merge_identities(
    &self,
    candidates: Vec<CandidateIdentity>,
    report: &mut RunReport,
  ) -> Result<()> {
    let config = &self.config;
    let mut lefts: BTreeMap<SourceRef, PreparedCandidate> = BTreeMap::new();
    let mut rights: BTreeMap<SourceRef, PreparedCandidate> = BTreeMap::new();
    let mut others: BTreeMap<SourceRef, PreparedCandidate> = BTreeMap::new();

    for candidate in candidates {
      let key = candidate.source_ref();
      let prepared = match PreparedCandidate::prepare(candidate, config, self.countries()) {
        Ok(p) => p,
        Err(err) => {
          report.fail(&key, &err);
          continue;
        }
      };
      let side = if prepared.identity.source == config.left_source {
        &mut lefts
      } else if prepared.identity.source == config.right_source {
        &mut rights
      } else {
        &mut others
      };
      if side.contains_key(&key) {
        debug!(candidate = %key, "duplicate candidate in batch; keeping the first");
        continue;
      }
      side.insert(key, prepared);
    }

    // Adjudicated verdicts: accepted pairs bypass the matcher, rejected
    // pairs are never proposed again.
    let mut accepted: Vec<MatchDecision> = Vec::new();
    let mut excluded = BTreeSet::new();
    let resolved = self.store.resolved_reviews().await.map_err(Error::persistence)?;
    for item in resolved {
      let (left_ref, right_ref) = item.pair_key();
      match item.verdict {
        Some(Verdict::Reject) => {
          excluded.insert((left_ref, right_ref));
        }
        Some(Verdict::Accept) => {
          let left = lefts.remove(&left_ref).map_or(item.left, |p| p.identity);
          let right = rights.remove(&right_ref).map_or(item.right, |p| p.identity);
          accepted.push(MatchDecision {
            left,
            right,
            stage: item.stage,
            score: item.score,
            matched_signals: Vec::new(),
            outcome: Outcome::Accept,
            tied: item.tied,
          });
        }
        None => {}
      }
    }
    debug!(adjudicated = accepted.len(), rejected = excluded.len(), "verdicts loaded");

    let out = Matcher::new(config).run(
      lefts.into_values().collect(),
      CandidatePool::new(rights.into_values()),
      &excluded,
    );

    for ambiguity in &out.ambiguities {
      warn!(error = %ambiguity, "tie routed to review");
      report.ambiguous += 1;
    }

    // Pending pairs stay provisionally unmatched: no identity for either side.
    for decision in &out.review {
      match self.store.enqueue(NewReview::from(decision)).await {
        Ok(item) => {
          debug!(decision_id = %item.decision_id, score = item.score, "queued for review");
          report.reviewed += 1;
        }
        Err(err) => {
          let (l, r) = decision.pair_key();
          report.fail(format!("{l} ~ {r}"), &Error::persistence(err));
        }
      }
    }

    accepted.extend(out.accepted);
    let planner = IdentityPlanner::new(&config.preferences, self.countries());

    for decision in &accepted {
      match self.apply_match(&planner, decision).await {
        Ok(kind) => {
          report.accepted += 1;
          report.count_plan(kind);
        }
        Err(err) => {
          let (l, r) = decision.pair_key();
          report.fail(format!("{l} ~ {r}"), &err);
        }
      }
    }

    let singles = out
      .left_only
      .into_iter()
      .chain(out.right_only)
      .chain(others.into_values().map(|p| p.identity));
    for candidate in singles {
      report.unmatched += 1;
      match self.apply_single(&planner, &candidate).await {
        Ok(kind) => report.count_plan(kind),
        Err(err) => report.fail(candidate.source_ref(), &err),
      }
    }

    Ok(())
  }

  async fn apply_match(
    &self,
    planner: &IdentityPlanner<'_>,
    decision: &MatchDecision,
  ) -> Result<PlanKind> {
    let left_owner = self
      .store
      .athlete_for(decision.left.source_ref())
      .await
      .map_err(Error::persistence)?;
    let right_owner = self
      .store
      .athlete_for(decision.right.source_ref())
      .await
      .map_err(Error::persistence)?;

    let plan = planner.plan_match(
      &decision.left,
      left_owner.as_ref(),
      &decision.right,
      right_owner.as_ref(),
      MatchEvidence { stage: decision.stage, score: decision.score },
      Utc::now(),
    )?;
    let kind = plan.kind();
    self.store.apply_identity(plan).await.map_err(Error::persistence)?;
    Ok(kind)
  }

  async fn apply_single(
    &self,
    planner: &IdentityPlanner<'_>,
    candidate: &CandidateIdentity,
  ) -> Result<PlanKind> {
    let owner = self
      .store
      .athlete_for(candidate.source_ref())
      .await
      .map_err(Error::persistence)?;
    let plan = planner.plan_single(candidate, owner.as_ref(), Utc::now());
    let kind = plan.kind();
    self.store.apply_identity(plan).await.map_err(Error::persistence)?;
    Ok(kind)
  }

  // ── Events ────────────────────────────────────────────────────────────

  async fn merge_events(
    &self,
    events: Vec<SourceEventRecord>,
    mut facets: BTreeMap<SourceRef, FacetBundle>,
    report: &mut RunReport,
  ) -> Result<()> {
    let matcher = EventMatcher::new(&self.config.events, self.countries());
    let mut lefts: BTreeMap<SourceRef, SourceEventRecord> = BTreeMap::new();
    let mut rights: BTreeMap<SourceRef, SourceEventRecord> = BTreeMap::new();

    for event in events {
      let key = event.source_ref();
      if let Err(err) = validate_event(&event) {
        report.fail(&key, &err);
        continue;
      }
      let side = if event.source == self.config.left_source { &mut lefts } else { &mut rights };
      side.entry(key).or_insert(event);
    }

    let clusters = matcher.cluster(lefts.into_values().collect(), rights.into_values().collect());
    debug!(clusters = clusters.len(), "source events clustered");

    for cluster in clusters {
      let groups = match self.place_cluster(&matcher, cluster.members).await {
        Ok(groups) => groups,
        Err(err) => {
          report.fail("event cluster", &err);
          continue;
        }
      };

      for (world_event, members) in groups {
        let mut bundle = FacetBundle::default();
        for m in &members {
          if let Some(b) = facets.remove(&m.source_ref()) {
            bundle.extend(b);
          }
        }
        self.apply_unit(world_event, members, bundle, report).await;
      }
    }

    // Facets whose source event is not in this batch join the world event
    // the store already links it to.
    for (key, bundle) in facets {
      match self.store.world_event_for(key.clone()).await.map_err(Error::persistence) {
        Ok(Some(world_event)) => self.apply_unit(world_event, Vec::new(), bundle, report).await,
        Ok(None) => {
          let err = Error::Validation(format!(
            "{} facet records reference unknown source event {key}",
            bundle.len()
          ));
          report.fail(&key, &err);
        }
        Err(err) => report.fail(&key, &err),
      }
    }

    Ok(())
  }

  /// Decide which world event(s) a cluster writes to. An existing link
  /// always wins so world-event ids never change; members already linked
  /// to different world events are kept apart. An unlinked cluster joins a
  /// stored world event it matches before a new one is created.
  async fn place_cluster(
    &self,
    matcher: &EventMatcher<'_>,
    members: Vec<SourceEventRecord>,
  ) -> Result<Vec<(WorldEvent, Vec<SourceEventRecord>)>> {
    let mut existing: Vec<Option<WorldEvent>> = Vec::with_capacity(members.len());
    for m in &members {
      existing.push(self.store.world_event_for(m.source_ref()).await.map_err(Error::persistence)?);
    }
    let ids: BTreeSet<Uuid> = existing.iter().flatten().map(|w| w.id).collect();

    if ids.len() <= 1 {
      let world_event = match existing.into_iter().flatten().next() {
        Some(stored) => stored,
        None => match self.stored_match(matcher, &members).await? {
          Some(stored) => {
            debug!(world_event = %stored.id, key = %stored.key, "cluster joins stored world event");
            stored
          }
          None => matcher
            .new_world_event(&members)
            .ok_or_else(|| Error::Validation("empty event cluster".into()))?,
        },
      };
      return Ok(vec![(world_event, members)]);
    }

    warn!(
      members = ?members.iter().map(|m| m.source_ref().to_string()).collect::<Vec<_>>(),
      "matched source events already belong to different world events; keeping them apart"
    );
    let mut groups = Vec::with_capacity(members.len());
    for (m, stored) in members.into_iter().zip(existing) {
      let single = vec![m];
      let world_event = match stored {
        Some(stored) => stored,
        None => matcher
          .new_world_event(&single)
          .ok_or_else(|| Error::Validation("empty event cluster".into()))?,
      };
      groups.push((world_event, single));
    }
    Ok(groups)
  }

  /// The stored world event an unlinked cluster matches, searched among
  /// world events within the date tolerance of the cluster's window.
  async fn stored_match(
    &self,
    matcher: &EventMatcher<'_>,
    members: &[SourceEventRecord],
  ) -> Result<Option<WorldEvent>> {
    let (Some(start), Some(end)) = (
      members.iter().map(|m| m.start_date).min(),
      members.iter().map(|m| m.end_date).max(),
    ) else {
      return Ok(None);
    };
    let tol = Days::new(u64::from(self.config.events.date_tolerance_days));
    let from = start.checked_sub_days(tol).unwrap_or(start);
    let to = end.checked_add_days(tol).unwrap_or(end);

    let nearby = self.store.world_events_overlapping(from, to).await.map_err(Error::persistence)?;
    let mut candidates = Vec::with_capacity(nearby.len());
    for world_event in nearby {
      let stored = self.store.source_events_for(world_event.id).await.map_err(Error::persistence)?;
      candidates.push((world_event, stored));
    }
    Ok(matcher.join_stored(members, candidates).map(|mut world_event| {
      world_event.location =
        world_event.location.or_else(|| members.iter().find_map(|m| m.location.clone()));
      world_event.country =
        world_event.country.or_else(|| members.iter().find_map(|m| matcher.country_code(m)));
      world_event.level = world_event.level.or_else(|| members.iter().filter_map(|m| m.level).max());
      world_event
    }))
  }

  async fn apply_unit(
    &self,
    world_event: WorldEvent,
    members: Vec<SourceEventRecord>,
    bundle: FacetBundle,
    report: &mut RunReport,
  ) {
    let id = world_event.id;
    let unit = EventFacetUnit {
      world_event,
      members,
      results: bundle.results,
      heats: bundle.heats,
      scores: bundle.scores,
      weights: self.config.facets.clone(),
    };
    match self.store.apply_event_unit(unit).await {
      Ok(upserted) => {
        debug!(
          world_event = %id,
          primary = ?upserted.primary_source,
          results = ?upserted.results,
          heats = ?upserted.heats,
          scores = ?upserted.scores,
          "event unit applied"
        );
        report.world_events += 1;
        report.results.add(upserted.results);
        report.heats.add(upserted.heats);
        report.scores.add(upserted.scores);
      }
      Err(err) => report.fail(format!("world event {id}"), &Error::persistence(err)),
    }
  }
}

fn validate_event(event: &SourceEventRecord) -> Result<()> {
  if event.source.trim().is_empty() || event.source_event_id.trim().is_empty() {
    return Err(Error::Validation(format!(
      "event {:?} has an empty source or source_event_id",
      event.name
    )));
  }
  if event.end_date < event.start_date {
    return Err(Error::Validation(format!(
      "event {} ends ({}) before it starts ({})",
      event.source_ref(),
      event.end_date,
      event.start_date
    )));
  }
  Ok(())
}

/// Scores are stored in hundredths; NaN or infinite values have no
/// representation there.
fn validate_score(score: &ScoreRecord) -> Result<()> {
  if !score.score.is_finite() || score.total_points.is_some_and(|t| !t.is_finite()) {
    return Err(Error::Validation(format!(
      "score of {} in heat {} is not a finite number",
      score.athlete_source_id, score.heat_id
    )));
  }
  Ok(())
}
