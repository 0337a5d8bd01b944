//! Multi-stage athlete matcher.
//!
//! Stages run as ordered passes. In each pass every still-unresolved left
//! candidate (in [`SourceRef`] order) is scored against every right candidate
//! still in the [`CandidatePool`]; the best qualifying right candidate is
//! popped from the pool. A left candidate resolved by an earlier stage never
//! reaches a later one, so stage priority dominates raw score.

use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  Error,
  config::{MergeConfig, StageRule, StageThresholds},
  model::{CandidateIdentity, SourceRef},
  score::{PreparedCandidate, Scorer, Signal, Similarity},
};

// ─── Stages ──────────────────────────────────────────────────────────────────

/// One tier of the threshold/attribute ladder, in priority order.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  /// Identical normalized name tokens.
  ExactName,
  /// Both birth years known and within tolerance.
  BirthYear,
  /// Both nationalities map to the same canonical code.
  Nationality,
}

impl Stage {
  pub const ALL: [Stage; 3] = [Stage::ExactName, Stage::BirthYear, Stage::Nationality];

  pub fn number(&self) -> u8 {
    match self {
      Self::ExactName => 1,
      Self::BirthYear => 2,
      Self::Nationality => 3,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ExactName => "exact_name",
      Self::BirthYear => "birth_year",
      Self::Nationality => "nationality",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|stage| stage.as_str() == s)
  }

  fn rule(&self, thresholds: &StageThresholds) -> StageRule {
    match self {
      Self::ExactName => thresholds.exact_name,
      Self::BirthYear => thresholds.birth_year,
      Self::Nationality => thresholds.nationality,
    }
  }

  /// Whether the attribute precondition of this stage holds.
  fn precondition(&self, sim: &Similarity) -> bool {
    match self {
      Self::ExactName => sim.has(Signal::ExactName),
      Self::BirthYear => sim.birth_year_agrees == Some(true),
      // Only ever `Some` when a country mapping is configured.
      Self::Nationality => sim.nationality_agrees == Some(true),
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "stage {} ({})", self.number(), self.as_str())
  }
}

// ─── Decisions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  Accept,
  Review,
}

/// A proposed link between one left and one right candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
  pub left:            CandidateIdentity,
  pub right:           CandidateIdentity,
  pub stage:           Stage,
  pub score:           f64,
  pub matched_signals: Vec<Signal>,
  pub outcome:         Outcome,
  /// Routed to review because another right candidate tied exactly.
  pub tied:            bool,
}

impl MatchDecision {
  pub fn pair_key(&self) -> PairKey { (self.left.source_ref(), self.right.source_ref()) }
}

/// `(left, right)` natural key of a candidate pair.
pub type PairKey = (SourceRef, SourceRef);

#[derive(Debug, Default)]
pub struct MatchOutput {
  pub accepted:    Vec<MatchDecision>,
  pub review:      Vec<MatchDecision>,
  /// Non-fatal tie reports; the tied pairs are also in `review`.
  pub ambiguities: Vec<Error>,
  pub left_only:   Vec<CandidateIdentity>,
  pub right_only:  Vec<CandidateIdentity>,
}

// ─── Pool ────────────────────────────────────────────────────────────────────

/// Right-side candidates not yet consumed. Iteration is ordered by
/// [`SourceRef`]; taking a candidate removes it for the rest of the run.
#[derive(Debug, Default)]
pub struct CandidatePool {
  entries: BTreeMap<SourceRef, PreparedCandidate>,
}

impl CandidatePool {
  pub fn new(candidates: impl IntoIterator<Item = PreparedCandidate>) -> Self {
    Self {
      entries: candidates.into_iter().map(|c| (c.source_ref.clone(), c)).collect(),
    }
  }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn iter(&self) -> impl Iterator<Item = &PreparedCandidate> { self.entries.values() }

  /// Consume a candidate; `None` if it was already taken.
  pub fn take(&mut self, key: &SourceRef) -> Option<PreparedCandidate> {
    self.entries.remove(key)
  }

  fn into_remaining(self) -> Vec<CandidateIdentity> {
    self.entries.into_values().map(|c| c.identity).collect()
  }
}

// ─── Matcher ─────────────────────────────────────────────────────────────────

pub struct Matcher {
  scorer: Scorer,
  stages: StageThresholds,
}

impl Matcher {
  pub fn new(config: &MergeConfig) -> Self {
    Self {
      scorer: Scorer::new(config.scorer.clone()),
      stages: config.stages.clone(),
    }
  }

  /// Match `left` against `pool`, consuming the pool.
  ///
  /// Pairs listed in `excluded` (typically adjudicated rejections) are never
  /// proposed.
  pub fn run(
    &self,
    left: Vec<PreparedCandidate>,
    mut pool: CandidatePool,
    excluded: &BTreeSet<PairKey>,
  ) -> MatchOutput {
    let lefts: BTreeMap<SourceRef, PreparedCandidate> =
      left.into_iter().map(|c| (c.source_ref.clone(), c)).collect();
    let mut resolved: BTreeSet<SourceRef> = BTreeSet::new();
    let mut out = MatchOutput::default();

    for stage in Stage::ALL {
      let rule = stage.rule(&self.stages);

      for (left_ref, l) in &lefts {
        if resolved.contains(left_ref) {
          continue;
        }

        let mut qualifying: Vec<(SourceRef, Similarity)> = pool
          .iter()
          .filter(|r| !excluded.contains(&(left_ref.clone(), r.source_ref.clone())))
          .filter_map(|r| {
            let sim = self.scorer.score(l, r);
            (stage.precondition(&sim) && sim.score >= rule.min_score)
              .then(|| (r.source_ref.clone(), sim))
          })
          .collect();
        if qualifying.is_empty() {
          continue;
        }

        // Highest score first; equal scores keep SourceRef order.
        qualifying.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.cmp(&b.0)));
        let top = qualifying[0].1.score;
        let tied_count = qualifying.iter().take_while(|(_, s)| s.score == top).count();
        resolved.insert(left_ref.clone());

        if tied_count > 1 {
          debug!(left = %left_ref, %stage, score = top, tied_count, "ambiguous match routed to review");
          out.ambiguities.push(Error::AmbiguousMatch {
            left: left_ref.clone(),
            tied: tied_count,
            stage,
            score: top,
          });
          for (right_ref, sim) in qualifying.into_iter().take(tied_count) {
            if let Some(r) = pool.take(&right_ref) {
              out.review.push(decision(l, r, stage, sim, Outcome::Review, true));
            }
          }
          continue;
        }

        let (right_ref, sim) = qualifying.swap_remove(0);
        let outcome = match stage {
          // Exact-name agreement has no review band.
          Stage::ExactName => Outcome::Accept,
          _ if sim.score >= rule.accept_score => Outcome::Accept,
          _ => Outcome::Review,
        };
        if let Some(r) = pool.take(&right_ref) {
          debug!(left = %left_ref, right = %right_ref, %stage, score = sim.score, ?outcome, "matched");
          let d = decision(l, r, stage, sim, outcome, false);
          match outcome {
            Outcome::Accept => out.accepted.push(d),
            Outcome::Review => out.review.push(d),
          }
        }
      }
    }

    out.left_only = lefts
      .into_iter()
      .filter(|(k, _)| !resolved.contains(k))
      .map(|(_, c)| c.identity)
      .collect();
    out.right_only = pool.into_remaining();
    out
  }
}

fn decision(
  l: &PreparedCandidate,
  r: PreparedCandidate,
  stage: Stage,
  sim: Similarity,
  outcome: Outcome,
  tied: bool,
) -> MatchDecision {
  MatchDecision {
    left: l.identity.clone(),
    right: r.identity,
    stage,
    score: sim.score,
    matched_signals: sim.matched_signals,
    outcome,
    tied,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::StageRule,
    country::{CountryConfig, CountryTable},
  };

  fn candidate(
    source: &str,
    id: &str,
    name: &str,
    birth_year: Option<i32>,
    nationality: Option<&str>,
  ) -> CandidateIdentity {
    CandidateIdentity {
      source:      source.into(),
      source_id:   id.into(),
      name:        name.into(),
      birth_year,
      nationality: nationality.map(str::to_owned),
      sail_number: None,
    }
  }

  fn run_with(
    config: &MergeConfig,
    countries: Option<&CountryTable>,
    left: Vec<CandidateIdentity>,
    right: Vec<CandidateIdentity>,
  ) -> MatchOutput {
    let prep = |c: CandidateIdentity| {
      PreparedCandidate::prepare(c, config, countries.map(|t| t as &dyn crate::country::CountryMapping))
        .unwrap()
    };
    let left = left.into_iter().map(prep).collect();
    let pool = CandidatePool::new(right.into_iter().map(prep));
    Matcher::new(config).run(left, pool, &BTreeSet::new())
  }

  fn run(left: Vec<CandidateIdentity>, right: Vec<CandidateIdentity>) -> MatchOutput {
    run_with(&MergeConfig::default(), None, left, right)
  }

  #[test]
  fn exact_name_accepts_at_stage_one() {
    let out = run(
      vec![candidate("lh", "a", "Adam Warchol", Some(1990), None)],
      vec![candidate("pwa", "x", "Adam Warchol", Some(1990), None)],
    );
    assert_eq!(out.accepted.len(), 1);
    let d = &out.accepted[0];
    assert_eq!(d.stage, Stage::ExactName);
    assert!(d.score >= 91.0);
    assert!(out.review.is_empty());
    assert!(out.left_only.is_empty() && out.right_only.is_empty());
  }

  #[test]
  fn borderline_birth_year_match_goes_to_review() {
    let out = run(
      vec![candidate("lh", "a", "Alex Levy", Some(1988), None)],
      vec![candidate("pwa", "x", "Adrian Levy", Some(1988), None)],
    );
    assert!(out.accepted.is_empty());
    assert_eq!(out.review.len(), 1);
    let d = &out.review[0];
    assert_eq!(d.stage, Stage::BirthYear);
    assert!((80.0..90.0).contains(&d.score));
    assert!(!d.tied);
  }

  #[test]
  fn stage_priority_beats_higher_score() {
    let mut config = MergeConfig::default();
    config.stages.exact_name = StageRule { min_score: 60.0, accept_score: 60.0 };

    let out = run_with(
      &config,
      None,
      vec![candidate("lh", "a", "Adam Warchol", Some(1990), None)],
      vec![
        // Exact name, conflicting birth year: stage 1 at 77.78.
        candidate("pwa", "x", "Adam Warchol", Some(1995), None),
        // Near name, same birth year: stage 2 at 94.44.
        candidate("pwa", "y", "Adam Warchal", Some(1990), None),
      ],
    );
    assert_eq!(out.accepted.len(), 1);
    assert_eq!(out.accepted[0].right.source_id, "x");
    assert_eq!(out.accepted[0].stage, Stage::ExactName);
    assert_eq!(out.right_only.len(), 1);
    assert_eq!(out.right_only[0].source_id, "y");
  }

  #[test]
  fn right_candidate_is_consumed_once() {
    let out = run(
      vec![
        candidate("lh", "a", "Sarah Hauser", None, None),
        candidate("lh", "b", "Sarah Hauser", None, None),
      ],
      vec![candidate("pwa", "x", "Sarah Hauser", None, None)],
    );
    assert_eq!(out.accepted.len(), 1);
    assert_eq!(out.accepted[0].left.source_id, "a");
    assert_eq!(out.left_only.len(), 1);
    assert_eq!(out.left_only[0].source_id, "b");
    assert!(out.right_only.is_empty());
  }

  #[test]
  fn exact_ties_are_never_auto_resolved() {
    let out = run(
      vec![candidate("lh", "a", "Adam Warchol", Some(1990), None)],
      vec![
        candidate("pwa", "y", "Adam Warchol", Some(1990), None),
        candidate("pwa", "x", "Adam Warchol", Some(1990), None),
      ],
    );
    assert!(out.accepted.is_empty());
    assert_eq!(out.review.len(), 2);
    assert!(out.review.iter().all(|d| d.tied));
    assert_eq!(out.ambiguities.len(), 1);
    assert!(matches!(out.ambiguities[0], Error::AmbiguousMatch { tied: 2, .. }));
  }

  #[test]
  fn decisions_do_not_depend_on_input_order() {
    let left = vec![
      candidate("lh", "a", "Sarah Hauser", None, None),
      candidate("lh", "b", "Sarah Hauser", None, None),
      candidate("lh", "c", "Alex Levy", Some(1988), None),
      candidate("lh", "d", "Ricardo Campello", Some(1985), None),
    ];
    let right = vec![
      candidate("pwa", "x", "Sarah Hauser", None, None),
      candidate("pwa", "y", "Adrian Levy", Some(1988), None),
      candidate("pwa", "z", "Ricardo Campelo", Some(1986), None),
    ];
    let summary = |out: &MatchOutput| {
      let mut pairs: Vec<(String, String, Outcome)> = out
        .accepted
        .iter()
        .chain(&out.review)
        .map(|d| (d.left.source_id.clone(), d.right.source_id.clone(), d.outcome))
        .collect();
      pairs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
      pairs
    };

    let forward = run(left.clone(), right.clone());
    let mut l_rev = left;
    l_rev.reverse();
    let mut r_rev = right;
    r_rev.reverse();
    let backward = run(l_rev, r_rev);

    assert_eq!(summary(&forward), summary(&backward));
    assert_eq!(forward.left_only, backward.left_only);
  }

  #[test]
  fn excluded_pairs_are_skipped() {
    let config = MergeConfig::default();
    let prep = |c| PreparedCandidate::prepare(c, &config, None).unwrap();
    let l = candidate("lh", "a", "Alex Levy", Some(1988), None);
    let r = candidate("pwa", "x", "Adrian Levy", Some(1988), None);
    let excluded: BTreeSet<PairKey> = [(l.source_ref(), r.source_ref())].into();

    let out = Matcher::new(&config).run(
      vec![prep(l)],
      CandidatePool::new([prep(r)]),
      &excluded,
    );
    assert!(out.review.is_empty());
    assert_eq!(out.left_only.len(), 1);
    assert_eq!(out.right_only.len(), 1);
  }

  #[test]
  fn nationality_stage_needs_country_mapping() {
    let left = vec![candidate("lh", "a", "Philip Koster", None, Some("Germany"))];
    let right = vec![candidate("pwa", "x", "Philip Koester", None, Some("German"))];

    let out = run(left.clone(), right.clone());
    assert!(out.accepted.is_empty() && out.review.is_empty());

    let mut countries = CountryConfig::default();
    countries.shared.insert("germany".into(), "DEU".into());
    countries.shared.insert("german".into(), "DEU".into());
    let table = CountryTable::from_config(&countries);
    let out = run_with(&MergeConfig::default(), Some(&table), left, right);
    assert_eq!(out.accepted.len(), 1);
    assert_eq!(out.accepted[0].stage, Stage::Nationality);
  }

  #[test]
  fn stage_names_round_trip() {
    for stage in Stage::ALL {
      assert_eq!(Stage::parse(stage.as_str()), Some(stage));
    }
    assert_eq!(Stage::parse("fuzzy"), None);
  }
}
