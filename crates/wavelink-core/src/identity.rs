//! Identity merger: turns accepted matches and source-only candidates into
//! write plans against the unified-athlete graph.
//!
//! Planning is pure. The caller looks up the athletes currently owning each
//! side, asks for a plan, and hands the plan to
//! [`MergeStore::apply_identity`](crate::store::MergeStore::apply_identity),
//! which applies it as one transaction. Established identities are never
//! merged retroactively; that case is refused with
//! [`Error::IdentityConflict`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  config::AttributePreferences,
  country::CountryMapping,
  matcher::Stage,
  model::{CandidateIdentity, SourceLink, UnifiedAthlete},
};

// ─── Attributes ──────────────────────────────────────────────────────────────

/// The reconciled, mutable fields of a unified athlete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AthleteAttributes {
  pub display_name: String,
  pub birth_year:   Option<i32>,
  pub nationality:  Option<String>,
  pub sail_number:  Option<String>,
}

impl UnifiedAthlete {
  pub fn attributes(&self) -> AthleteAttributes {
    AthleteAttributes {
      display_name: self.display_name.clone(),
      birth_year:   self.birth_year,
      nationality:  self.nationality.clone(),
      sail_number:  self.sail_number.clone(),
    }
  }
}

// ─── Plans ───────────────────────────────────────────────────────────────────

/// One transactional unit against the identity tables.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityPlan {
  /// Insert a new athlete together with its links.
  Create(UnifiedAthlete),
  /// Add `link` to an existing athlete and update its attributes.
  Attach {
    athlete_id: Uuid,
    link:       SourceLink,
    attributes: AthleteAttributes,
  },
  /// Update attributes of an athlete whose links are already in place.
  Enrich {
    athlete_id: Uuid,
    attributes: AthleteAttributes,
  },
  /// Nothing to write.
  NoOp { athlete_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
  Create,
  Attach,
  Enrich,
  NoOp,
}

impl IdentityPlan {
  pub fn kind(&self) -> PlanKind {
    match self {
      Self::Create(_) => PlanKind::Create,
      Self::Attach { .. } => PlanKind::Attach,
      Self::Enrich { .. } => PlanKind::Enrich,
      Self::NoOp { .. } => PlanKind::NoOp,
    }
  }

  pub fn athlete_id(&self) -> Uuid {
    match self {
      Self::Create(athlete) => athlete.id,
      Self::Attach { athlete_id, .. }
      | Self::Enrich { athlete_id, .. }
      | Self::NoOp { athlete_id } => *athlete_id,
    }
  }
}

/// How a pair was matched, recorded on the links it produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchEvidence {
  pub stage: Stage,
  pub score: f64,
}

// ─── Planner ─────────────────────────────────────────────────────────────────

pub struct IdentityPlanner<'a> {
  preferences: &'a AttributePreferences,
  countries:   Option<&'a dyn CountryMapping>,
}

impl<'a> IdentityPlanner<'a> {
  pub fn new(
    preferences: &'a AttributePreferences,
    countries: Option<&'a dyn CountryMapping>,
  ) -> Self {
    Self { preferences, countries }
  }

  /// Plan an accepted match. `left_owner` / `right_owner` are the athletes
  /// each side is already linked to, if any.
  pub fn plan_match(
    &self,
    left: &CandidateIdentity,
    left_owner: Option<&UnifiedAthlete>,
    right: &CandidateIdentity,
    right_owner: Option<&UnifiedAthlete>,
    evidence: MatchEvidence,
    now: DateTime<Utc>,
  ) -> Result<IdentityPlan> {
    match (left_owner, right_owner) {
      (None, None) => Ok(self.create(&[left, right], Some(evidence), now)),
      (Some(owner), None) => self.attach(owner, left, right, evidence),
      (None, Some(owner)) => self.attach(owner, right, left, evidence),
      (Some(a), Some(b)) if a.id == b.id => Ok(self.enrich(a, &[left, right])),
      (Some(a), Some(b)) => Err(Error::IdentityConflict {
        left:     left.source_ref(),
        left_id:  a.id,
        right:    right.source_ref(),
        right_id: b.id,
      }),
    }
  }

  /// Plan a source-only candidate: a fresh athlete, or enrichment of the one
  /// it already belongs to.
  pub fn plan_single(
    &self,
    candidate: &CandidateIdentity,
    owner: Option<&UnifiedAthlete>,
    now: DateTime<Utc>,
  ) -> IdentityPlan {
    match owner {
      Some(owner) => self.enrich(owner, &[candidate]),
      None => self.create(&[candidate], None, now),
    }
  }

  fn create(
    &self,
    candidates: &[&CandidateIdentity],
    evidence: Option<MatchEvidence>,
    now: DateTime<Utc>,
  ) -> IdentityPlan {
    let id = Uuid::new_v4();
    let attrs = self.reconcile(None, candidates);
    IdentityPlan::Create(UnifiedAthlete {
      id,
      display_name: attrs.display_name,
      birth_year: attrs.birth_year,
      nationality: attrs.nationality,
      sail_number: attrs.sail_number,
      source_links: candidates.iter().map(|c| link(id, c, evidence)).collect(),
      created_at: now,
    })
  }

  fn attach(
    &self,
    owner: &UnifiedAthlete,
    linked: &CandidateIdentity,
    incoming: &CandidateIdentity,
    evidence: MatchEvidence,
  ) -> Result<IdentityPlan> {
    if let Some(existing) = owner.link_in(&incoming.source) {
      return Err(Error::SourceSlotTaken {
        unified_id: owner.id,
        existing:   existing.source_ref(),
        incoming:   incoming.source_ref(),
      });
    }
    Ok(IdentityPlan::Attach {
      athlete_id: owner.id,
      link:       link(owner.id, incoming, Some(evidence)),
      attributes: self.reconcile(Some(owner), &[linked, incoming]),
    })
  }

  fn enrich(&self, owner: &UnifiedAthlete, candidates: &[&CandidateIdentity]) -> IdentityPlan {
    let attributes = self.reconcile(Some(owner), candidates);
    if attributes == owner.attributes() {
      IdentityPlan::NoOp { athlete_id: owner.id }
    } else {
      IdentityPlan::Enrich { athlete_id: owner.id, attributes }
    }
  }

  /// Field-by-field reconciliation. A value from the field's preferred
  /// source wins; otherwise the existing value is kept, and a missing one is
  /// filled from the first candidate that has it. Never yields `None` where
  /// the existing athlete had a value.
  pub fn reconcile(
    &self,
    existing: Option<&UnifiedAthlete>,
    candidates: &[&CandidateIdentity],
  ) -> AthleteAttributes {
    let prefs = self.preferences;

    let display_name = pick(
      prefs.display_name.as_deref(),
      existing.map(|a| a.display_name.clone()),
      candidates,
      |c| Some(c.name.trim().to_owned()).filter(|n| !n.is_empty()),
    )
    .or_else(|| candidates.first().map(|c| c.name.clone()))
    .unwrap_or_default();

    AthleteAttributes {
      display_name,
      birth_year: pick(
        prefs.birth_year.as_deref(),
        existing.and_then(|a| a.birth_year),
        candidates,
        |c| c.birth_year,
      ),
      nationality: pick(
        prefs.nationality.as_deref(),
        existing.and_then(|a| a.nationality.clone()),
        candidates,
        |c| self.nationality(c),
      ),
      sail_number: pick(
        prefs.sail_number.as_deref(),
        existing.and_then(|a| a.sail_number.clone()),
        candidates,
        |c| c.sail_number.clone().filter(|s| !s.trim().is_empty()),
      ),
    }
  }

  /// Canonical code when the mapping knows the raw string, else the raw
  /// string.
  fn nationality(&self, c: &CandidateIdentity) -> Option<String> {
    let raw = c.nationality.as_deref()?.trim();
    if raw.is_empty() {
      return None;
    }
    self
      .countries
      .and_then(|m| m.canonical(&c.source, raw))
      .or_else(|| Some(raw.to_owned()))
  }
}

fn pick<T>(
  preferred: Option<&str>,
  existing: Option<T>,
  candidates: &[&CandidateIdentity],
  value: impl Fn(&CandidateIdentity) -> Option<T>,
) -> Option<T> {
  if let Some(source) = preferred
    && let Some(v) = candidates.iter().filter(|c| c.source == source).find_map(|c| value(c))
  {
    return Some(v);
  }
  existing.or_else(|| candidates.iter().find_map(|c| value(c)))
}

fn link(unified_id: Uuid, c: &CandidateIdentity, evidence: Option<MatchEvidence>) -> SourceLink {
  SourceLink {
    unified_id,
    source: c.source.clone(),
    source_id: c.source_id.clone(),
    match_stage: evidence.map(|e| e.stage),
    match_score: evidence.map(|e| e.score),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn candidate(source: &str, id: &str, name: &str, birth_year: Option<i32>) -> CandidateIdentity {
    CandidateIdentity {
      source: source.into(),
      source_id: id.into(),
      name: name.into(),
      birth_year,
      nationality: None,
      sail_number: None,
    }
  }

  fn evidence() -> MatchEvidence { MatchEvidence { stage: Stage::ExactName, score: 100.0 } }

  fn owned(plan: IdentityPlan) -> UnifiedAthlete {
    match plan {
      IdentityPlan::Create(athlete) => athlete,
      other => panic!("expected Create, got {other:?}"),
    }
  }

  #[test]
  fn unresolved_pair_creates_athlete_with_both_links() {
    let prefs = AttributePreferences::default();
    let planner = IdentityPlanner::new(&prefs, None);
    let l = candidate("liveheats", "1", "Adam Warchol", None);
    let r = candidate("pwa", "9", "Adam Warchol", Some(1990));

    let athlete = owned(planner.plan_match(&l, None, &r, None, evidence(), Utc::now()).unwrap());
    assert_eq!(athlete.source_links.len(), 2);
    assert!(athlete.source_links.iter().all(|link| link.unified_id == athlete.id));
    assert_eq!(athlete.birth_year, Some(1990));
    assert_eq!(athlete.source_links[0].match_stage, Some(Stage::ExactName));
  }

  #[test]
  fn one_resolved_side_attaches_the_other() {
    let prefs = AttributePreferences::default();
    let planner = IdentityPlanner::new(&prefs, None);
    let l = candidate("liveheats", "1", "Adam Warchol", Some(1990));
    let owner = owned(planner.plan_single(&l, None, Utc::now()));
    let r = candidate("pwa", "9", "Adam Warchol", None);

    let plan = planner.plan_match(&l, Some(&owner), &r, None, evidence(), Utc::now()).unwrap();
    let IdentityPlan::Attach { athlete_id, link, attributes } = plan else {
      panic!("expected Attach");
    };
    assert_eq!(athlete_id, owner.id);
    assert_eq!(link.source, "pwa");
    assert_eq!(attributes.birth_year, Some(1990));
  }

  #[test]
  fn attaching_into_a_taken_source_slot_is_refused() {
    let prefs = AttributePreferences::default();
    let planner = IdentityPlanner::new(&prefs, None);
    let first = candidate("pwa", "9", "Adam Warchol", None);
    let owner = owned(planner.plan_single(&first, None, Utc::now()));

    let other = candidate("pwa", "10", "Adam Warchol", None);
    let l = candidate("liveheats", "1", "Adam Warchol", None);
    let err = planner.plan_match(&other, None, &l, Some(&owner), evidence(), Utc::now());
    // `other` would land in the "pwa" slot, which `first` holds.
    assert!(matches!(err, Err(Error::SourceSlotTaken { .. })));
  }

  #[test]
  fn two_distinct_owners_conflict() {
    let prefs = AttributePreferences::default();
    let planner = IdentityPlanner::new(&prefs, None);
    let l = candidate("liveheats", "1", "Adam Warchol", None);
    let r = candidate("pwa", "9", "Adam Warchol", None);
    let a = owned(planner.plan_single(&l, None, Utc::now()));
    let b = owned(planner.plan_single(&r, None, Utc::now()));

    let err = planner.plan_match(&l, Some(&a), &r, Some(&b), evidence(), Utc::now()).unwrap_err();
    assert!(err.is_conflict());
    match err {
      Error::IdentityConflict { left_id, right_id, .. } => {
        assert_eq!(left_id, a.id);
        assert_eq!(right_id, b.id);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn same_owner_is_noop() {
    let prefs = AttributePreferences::default();
    let planner = IdentityPlanner::new(&prefs, None);
    let l = candidate("liveheats", "1", "Adam Warchol", Some(1990));
    let r = candidate("pwa", "9", "Adam Warchol", Some(1990));
    let athlete = owned(planner.plan_match(&l, None, &r, None, evidence(), Utc::now()).unwrap());

    let plan = planner
      .plan_match(&l, Some(&athlete), &r, Some(&athlete), evidence(), Utc::now())
      .unwrap();
    assert_eq!(plan, IdentityPlan::NoOp { athlete_id: athlete.id });
  }

  #[test]
  fn null_never_overwrites_a_value() {
    let prefs = AttributePreferences { birth_year: Some("pwa".into()), ..Default::default() };
    let planner = IdentityPlanner::new(&prefs, None);
    let l = candidate("liveheats", "1", "Adam Warchol", Some(1990));
    let owner = owned(planner.plan_single(&l, None, Utc::now()));

    let r = candidate("pwa", "9", "Adam Warchol", None);
    let attrs = planner.reconcile(Some(&owner), &[&l, &r]);
    assert_eq!(attrs.birth_year, Some(1990));
  }

  #[test]
  fn preferred_source_wins_when_present() {
    let prefs = AttributePreferences {
      display_name: Some("pwa".into()),
      ..Default::default()
    };
    let planner = IdentityPlanner::new(&prefs, None);
    let l = candidate("liveheats", "1", "Adam Warchoł", None);
    let r = candidate("pwa", "9", "Adam Warchol", None);

    let attrs = planner.reconcile(None, &[&l, &r]);
    assert_eq!(attrs.display_name, "Adam Warchol");

    let unpreferred = AttributePreferences::default();
    let attrs = IdentityPlanner::new(&unpreferred, None).reconcile(None, &[&l, &r]);
    assert_eq!(attrs.display_name, "Adam Warchoł");
  }
}
