//! Weighted similarity between two candidate identities.
//!
//! The score is a weighted average in `[0, 100]` over the signals both sides
//! actually carry: name similarity (dominant), birth-year agreement and
//! nationality equivalence. A signal missing on either side is excluded from
//! the average rather than counted as disagreement.

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  config::{MergeConfig, ScorerWeights},
  country::CountryMapping,
  model::{CandidateIdentity, SourceRef},
  normalize::{NormalizedName, normalize_name},
};

/// Credit given to two tokens that share their first letter ("alex" /
/// "adrian"); such pairs land in the review band instead of being dropped.
const INITIAL_CREDIT: f64 = 0.5;
/// Credit given when one token is a prefix of the other ("alex" /
/// "alexander", "j" / "john").
const PREFIX_CREDIT: f64 = 0.9;

// ─── Prepared candidates ─────────────────────────────────────────────────────

/// A validated candidate with its normalized name and canonical country.
#[derive(Debug, Clone)]
pub struct PreparedCandidate {
  pub identity:   CandidateIdentity,
  pub source_ref: SourceRef,
  pub name:       NormalizedName,
  /// Canonical country code, when a mapping knows the raw nationality.
  pub country:    Option<String>,
}

impl PreparedCandidate {
  /// Validate and normalize a raw candidate.
  pub fn prepare(
    identity: CandidateIdentity,
    config: &MergeConfig,
    countries: Option<&dyn CountryMapping>,
  ) -> Result<Self> {
    if identity.source.trim().is_empty() || identity.source_id.trim().is_empty() {
      return Err(Error::Validation(format!(
        "candidate {:?} has an empty source or source_id",
        identity.name
      )));
    }
    if let Some(year) = identity.birth_year
      && !(1900..=2100).contains(&year)
    {
      return Err(Error::Validation(format!(
        "candidate {} has implausible birth year {year}",
        identity.source_ref()
      )));
    }

    let name = normalize_name(config.corrected_name(&identity.name))?;
    let country = match (countries, identity.nationality.as_deref()) {
      (Some(map), Some(raw)) => map.canonical(&identity.source, raw),
      _ => None,
    };

    Ok(Self { source_ref: identity.source_ref(), identity, name, country })
  }
}

// ─── Output ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
  /// Normalized token multisets are identical.
  ExactName,
  BirthYear,
  Nationality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
  /// Weighted score in `[0, 100]`, rounded to two decimals.
  pub score:              f64,
  pub matched_signals:    Vec<Signal>,
  /// Token-level name similarity in `[0, 1]`.
  pub name_similarity:    f64,
  /// `None` when either side lacks a birth year.
  pub birth_year_agrees:  Option<bool>,
  /// `None` when either side lacks a mapped nationality.
  pub nationality_agrees: Option<bool>,
}

impl Similarity {
  pub fn has(&self, signal: Signal) -> bool { self.matched_signals.contains(&signal) }
}

// ─── Scorer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Scorer {
  weights: ScorerWeights,
}

impl Scorer {
  pub fn new(weights: ScorerWeights) -> Self { Self { weights } }

  pub fn score(&self, a: &PreparedCandidate, b: &PreparedCandidate) -> Similarity {
    let w = &self.weights;
    let mut matched_signals = Vec::new();

    let exact = a.name.same_tokens(&b.name);
    if exact {
      matched_signals.push(Signal::ExactName);
    }
    let name_similarity = if exact { 1.0 } else { name_similarity(&a.name, &b.name) };

    let mut total = w.name * name_similarity;
    let mut weight = w.name;

    let birth_year_agrees = match (a.identity.birth_year, b.identity.birth_year) {
      (Some(x), Some(y)) => Some((x - y).abs() <= w.birth_year_tolerance),
      _ => None,
    };
    if let Some(agrees) = birth_year_agrees {
      weight += w.birth_year;
      if agrees {
        total += w.birth_year;
        matched_signals.push(Signal::BirthYear);
      }
    }

    let nationality_agrees = match (&a.country, &b.country) {
      (Some(x), Some(y)) => Some(x == y),
      _ => None,
    };
    if let Some(agrees) = nationality_agrees {
      weight += w.nationality;
      if agrees {
        total += w.nationality;
        matched_signals.push(Signal::Nationality);
      }
    }

    let raw = if weight > 0.0 { total / weight * 100.0 } else { 0.0 };
    Similarity {
      score: round2(raw),
      matched_signals,
      name_similarity,
      birth_year_agrees,
      nationality_agrees,
    }
  }
}

fn round2(x: f64) -> f64 { (x * 100.0).round() / 100.0 }

// ─── Name similarity ─────────────────────────────────────────────────────────

/// Similarity of two single tokens in `[0, 1]`.
pub fn token_similarity(x: &str, y: &str) -> f64 {
  if x == y {
    return 1.0;
  }
  let mut sim = strsim::normalized_levenshtein(x, y);
  if x.starts_with(y) || y.starts_with(x) {
    sim = sim.max(PREFIX_CREDIT);
  }
  if x.chars().next() == y.chars().next() {
    sim = sim.max(INITIAL_CREDIT);
  }
  sim
}

/// Token-level similarity of two names in `[0, 1]`.
///
/// Tokens are paired greedily, best pair first; unpaired tokens of the longer
/// name count as zero.
pub fn name_similarity(a: &NormalizedName, b: &NormalizedName) -> f64 {
  let (ta, tb) = (a.tokens(), b.tokens());
  let longest = ta.len().max(tb.len());
  if longest == 0 {
    return 0.0;
  }

  let mut pairs: Vec<(f64, usize, usize)> = Vec::with_capacity(ta.len() * tb.len());
  for (i, x) in ta.iter().enumerate() {
    for (j, y) in tb.iter().enumerate() {
      pairs.push((token_similarity(x, y), i, j));
    }
  }
  pairs.sort_by(|p, q| {
    q.0.total_cmp(&p.0).then(p.1.cmp(&q.1)).then(p.2.cmp(&q.2))
  });

  let mut used_a = vec![false; ta.len()];
  let mut used_b = vec![false; tb.len()];
  let mut sum = 0.0;
  for (sim, i, j) in pairs {
    if used_a[i] || used_b[j] {
      continue;
    }
    used_a[i] = true;
    used_b[j] = true;
    sum += sim;
  }
  sum / longest as f64
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::country::{CountryConfig, CountryTable};

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

  fn prepared(c: CandidateIdentity) -> PreparedCandidate {
    PreparedCandidate::prepare(c, &MergeConfig::default(), None).unwrap()
  }

  fn scorer() -> Scorer { Scorer::new(ScorerWeights::default()) }

  #[test]
  fn identical_name_and_year_scores_100() {
    let a = prepared(candidate("lh", "1", "Adam Warchol", Some(1990), None));
    let b = prepared(candidate("pwa", "9", "Adam Warchol", Some(1990), None));
    let sim = scorer().score(&a, &b);
    assert_eq!(sim.score, 100.0);
    assert!(sim.has(Signal::ExactName));
    assert!(sim.has(Signal::BirthYear));
    assert_eq!(sim.nationality_agrees, None);
  }

  #[test]
  fn shared_surname_with_same_initial_lands_in_review_band() {
    let a = prepared(candidate("lh", "1", "Alex Levy", Some(1988), None));
    let b = prepared(candidate("pwa", "2", "Adrian Levy", Some(1988), None));
    let sim = scorer().score(&a, &b);
    assert!((sim.name_similarity - 0.75).abs() < 1e-9);
    assert_eq!(sim.score, 80.56);
    assert_eq!(sim.birth_year_agrees, Some(true));
  }

  #[test]
  fn absent_attributes_contribute_no_weight() {
    let a = prepared(candidate("lh", "1", "Sarah Hauser", None, Some("French")));
    let b = prepared(candidate("pwa", "2", "Sarah Hauser", None, None));
    let sim = scorer().score(&a, &b);
    assert_eq!(sim.score, 100.0);
    assert_eq!(sim.birth_year_agrees, None);
  }

  #[test]
  fn birth_year_disagreement_lowers_score() {
    let a = prepared(candidate("lh", "1", "Adam Warchol", Some(1990), None));
    let b = prepared(candidate("pwa", "2", "Adam Warchol", Some(1995), None));
    let sim = scorer().score(&a, &b);
    assert_eq!(sim.birth_year_agrees, Some(false));
    assert_eq!(sim.score, 77.78);
  }

  #[test]
  fn birth_year_within_one_agrees() {
    let a = prepared(candidate("lh", "1", "Adam Warchol", Some(1990), None));
    let b = prepared(candidate("pwa", "2", "Adam Warchol", Some(1991), None));
    assert_eq!(scorer().score(&a, &b).birth_year_agrees, Some(true));
  }

  #[test]
  fn nationality_requires_mapping() {
    let mut config = CountryConfig::default();
    config.shared.insert("german".into(), "DEU".into());
    config.shared.insert("germany".into(), "DEU".into());
    let table = CountryTable::from_config(&config);
    let cfg = MergeConfig::default();

    let a = PreparedCandidate::prepare(
      candidate("lh", "1", "Philip Koster", None, Some("Germany")),
      &cfg,
      Some(&table),
    )
    .unwrap();
    let b = PreparedCandidate::prepare(
      candidate("pwa", "2", "Philip Koester", None, Some("German")),
      &cfg,
      Some(&table),
    )
    .unwrap();
    let sim = scorer().score(&a, &b);
    assert_eq!(sim.nationality_agrees, Some(true));
    assert!(sim.has(Signal::Nationality));

    let a = prepared(candidate("lh", "1", "Philip Koster", None, Some("Germany")));
    let b = prepared(candidate("pwa", "2", "Philip Koester", None, Some("German")));
    assert_eq!(scorer().score(&a, &b).nationality_agrees, None);
  }

  #[test]
  fn prepare_applies_name_overrides() {
    let mut cfg = MergeConfig::default();
    cfg.name_overrides.insert("Coraline Foveau".into(), "Coco Foveau".into());
    let p = PreparedCandidate::prepare(
      candidate("pwa", "3", "Coraline Foveau", None, None),
      &cfg,
      None,
    )
    .unwrap();
    assert_eq!(p.name.canonical(), "coco foveau");
    assert_eq!(p.identity.name, "Coraline Foveau");
  }

  #[test]
  fn prepare_rejects_malformed_candidates() {
    let cfg = MergeConfig::default();
    let blank = PreparedCandidate::prepare(candidate("pwa", "3", "  ", None, None), &cfg, None);
    assert!(matches!(blank, Err(Error::Validation(_))));

    let no_id = PreparedCandidate::prepare(candidate("pwa", "", "Ana", None, None), &cfg, None);
    assert!(matches!(no_id, Err(Error::Validation(_))));

    let year = PreparedCandidate::prepare(candidate("pwa", "4", "Ana", Some(19), None), &cfg, None);
    assert!(matches!(year, Err(Error::Validation(_))));
  }

  #[test]
  fn token_similarity_credits() {
    assert_eq!(token_similarity("levy", "levy"), 1.0);
    assert_eq!(token_similarity("alex", "alexander"), PREFIX_CREDIT);
    assert_eq!(token_similarity("alex", "adrian"), INITIAL_CREDIT);
    assert!(token_similarity("koster", "koester") > 0.8);
  }
}
