//! Merge configuration: thresholds, weights and source preferences.
//!
//! Every field has a default, so an empty config file is valid. The binary
//! layers a TOML file and `WAVELINK_*` environment variables on top.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{Error, Result, country::CountryConfig};

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
  /// The source whose candidates drive the matcher loop.
  pub left_source:    String,
  /// The source whose candidates form the consumable pool.
  pub right_source:   String,
  pub scorer:         ScorerWeights,
  pub stages:         StageThresholds,
  pub events:         EventMatchConfig,
  pub facets:         FacetWeights,
  pub preferences:    AttributePreferences,
  /// Exact raw-name corrections applied before normalization.
  pub name_overrides: BTreeMap<String, String>,
  /// `None` disables the nationality signal and Stage 3.
  pub countries:      Option<CountryConfig>,
}

impl Default for MergeConfig {
  fn default() -> Self {
    Self {
      left_source:    "liveheats".into(),
      right_source:   "pwa".into(),
      scorer:         ScorerWeights::default(),
      stages:         StageThresholds::default(),
      events:         EventMatchConfig::default(),
      facets:         FacetWeights::default(),
      preferences:    AttributePreferences::default(),
      name_overrides: BTreeMap::new(),
      countries:      None,
    }
  }
}

// ─── Scorer ──────────────────────────────────────────────────────────────────

/// Relative weights of the similarity signals. Absent signals drop out of the
/// weighted average.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScorerWeights {
  pub name:                 f64,
  pub birth_year:           f64,
  pub nationality:          f64,
  /// Maximum |Δyear| still counted as agreement.
  pub birth_year_tolerance: i32,
}

impl Default for ScorerWeights {
  fn default() -> Self {
    Self { name: 0.7, birth_year: 0.2, nationality: 0.1, birth_year_tolerance: 1 }
  }
}

// ─── Stages ──────────────────────────────────────────────────────────────────

/// Minimum score to qualify for a stage, and the score from which a
/// qualifying pair is accepted without review.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StageRule {
  pub min_score:    f64,
  pub accept_score: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageThresholds {
  pub exact_name:  StageRule,
  pub birth_year:  StageRule,
  pub nationality: StageRule,
}

impl Default for StageThresholds {
  fn default() -> Self {
    Self {
      exact_name:  StageRule { min_score: 91.0, accept_score: 91.0 },
      birth_year:  StageRule { min_score: 80.0, accept_score: 90.0 },
      nationality: StageRule { min_score: 90.0, accept_score: 90.0 },
    }
  }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventMatchConfig {
  /// Date ranges overlap if they do after widening by this many days.
  pub date_tolerance_days: u32,
  /// Name similarity in `[0, 1]` needed for the name signal.
  pub name_threshold:      f64,
  /// Signals (of three) that must hold; never below two.
  pub min_signals:         u8,
  /// Location groups: canonical location → keywords found in names or
  /// location strings.
  pub location_aliases:    BTreeMap<String, Vec<String>>,
}

impl Default for EventMatchConfig {
  fn default() -> Self {
    let aliases: &[(&str, &[&str])] = &[
      ("chile", &["chile", "topocalma", "pichilemu"]),
      ("sylt", &["sylt", "westerland"]),
      ("maui", &["maui", "aloha", "hookipa", "kanaha", "hawaii"]),
      ("gran_canaria", &["gran canaria", "pozo", "canary"]),
      ("tenerife", &["tenerife", "el medano"]),
      ("denmark", &["denmark", "klitmoller", "cold hawaii"]),
      ("peru", &["peru", "pacasmayo"]),
      ("japan", &["japan", "omaezaki", "yokosuka"]),
      ("puerto_rico", &["puerto rico", "la pared"]),
      ("fiji", &["fiji", "cloudbreak"]),
    ];
    Self {
      date_tolerance_days: 1,
      name_threshold:      0.8,
      min_signals:         2,
      location_aliases:    aliases
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.iter().map(|s| (*s).to_owned()).collect()))
        .collect(),
    }
  }
}

// ─── Facets ──────────────────────────────────────────────────────────────────

/// Per-record weight of each facet when electing an event's primary source.
/// Granular facets outweigh the summary facet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FacetWeights {
  pub results: f64,
  pub heats:   f64,
  pub scores:  f64,
}

impl Default for FacetWeights {
  fn default() -> Self { Self { results: 1.0, heats: 25.0, scores: 10.0 } }
}

// ─── Attribute preferences ───────────────────────────────────────────────────

/// Preferred source per unified-athlete field. `None` means first non-null.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AttributePreferences {
  pub display_name: Option<String>,
  pub birth_year:   Option<String>,
  pub nationality:  Option<String>,
  pub sail_number:  Option<String>,
}

// ─── Validation ──────────────────────────────────────────────────────────────

impl MergeConfig {
  pub fn validate(&self) -> Result<()> {
    if self.left_source.trim().is_empty() || self.right_source.trim().is_empty() {
      return Err(Error::Validation("left_source and right_source must be set".into()));
    }
    if self.left_source == self.right_source {
      return Err(Error::Validation(format!(
        "left_source and right_source must differ (both {:?})",
        self.left_source
      )));
    }

    let w = &self.scorer;
    if w.name <= 0.0 || w.birth_year < 0.0 || w.nationality < 0.0 {
      return Err(Error::Validation("scorer weights must be non-negative, name positive".into()));
    }
    if w.name < w.birth_year || w.name < w.nationality {
      return Err(Error::Validation("the name weight must dominate the scorer".into()));
    }

    for (label, rule) in [
      ("exact_name", self.stages.exact_name),
      ("birth_year", self.stages.birth_year),
      ("nationality", self.stages.nationality),
    ] {
      if !(0.0..=100.0).contains(&rule.min_score)
        || !(0.0..=100.0).contains(&rule.accept_score)
        || rule.accept_score < rule.min_score
      {
        return Err(Error::Validation(format!(
          "stage {label}: need 0 <= min_score <= accept_score <= 100"
        )));
      }
    }

    if self.events.min_signals < 2 || self.events.min_signals > 3 {
      return Err(Error::Validation("events.min_signals must be 2 or 3".into()));
    }
    if !(0.0..=1.0).contains(&self.events.name_threshold) {
      return Err(Error::Validation("events.name_threshold must be within [0, 1]".into()));
    }

    let f = &self.facets;
    if f.results < 0.0 || f.heats < 0.0 || f.scores < 0.0 {
      return Err(Error::Validation("facet weights must be non-negative".into()));
    }

    Ok(())
  }

  /// Apply a configured name correction, if any.
  pub fn corrected_name<'a>(&'a self, raw: &'a str) -> &'a str {
    self.name_overrides.get(raw).map(String::as_str).unwrap_or(raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let config = MergeConfig::default();
    config.validate().unwrap();
    assert_eq!(config.stages.birth_year.min_score, 80.0);
    assert_eq!(config.events.date_tolerance_days, 1);
    assert!(config.countries.is_none());
  }

  #[test]
  fn partial_document_keeps_defaults() {
    let config: MergeConfig = serde_json::from_value(serde_json::json!({
      "right_source": "iwt",
      "facets": { "heats": 40.0 },
      "name_overrides": { "Coraline Foveau": "Coco Foveau" },
    }))
    .unwrap();
    assert_eq!(config.left_source, "liveheats");
    assert_eq!(config.right_source, "iwt");
    assert_eq!(config.facets.heats, 40.0);
    assert_eq!(config.facets.scores, 10.0);
    assert_eq!(config.corrected_name("Coraline Foveau"), "Coco Foveau");
    assert_eq!(config.corrected_name("Sarah Hauser"), "Sarah Hauser");
  }

  #[test]
  fn facet_weights_compare_by_value() {
    let weights: FacetWeights =
      serde_json::from_value(serde_json::json!({ "results": 1.0 })).unwrap();
    assert_eq!(weights, FacetWeights::default());
    assert_ne!(weights, FacetWeights { heats: 40.0, ..FacetWeights::default() });
  }

  #[test]
  fn rejects_single_signal_event_matching() {
    let mut config = MergeConfig::default();
    config.events.min_signals = 1;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("min_signals"));
  }

  #[test]
  fn rejects_inverted_stage_rule() {
    let mut config = MergeConfig::default();
    config.stages.birth_year = StageRule { min_score: 95.0, accept_score: 90.0 };
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_identical_sources() {
    let mut config = MergeConfig::default();
    config.right_source = config.left_source.clone();
    assert!(config.validate().is_err());
  }
}
