//! Country/nationality mapping collaborator.
//!
//! Providers describe nationality differently (one uses demonyms such as
//! "German", the other ISO names or codes). A [`CountryMapping`] turns a
//! source-specific string into a canonical code. When no mapping is
//! configured the nationality signal is absent and Stage 3 never fires.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::normalize::fold;

/// Lookup from a source-specific country string to a canonical code.
pub trait CountryMapping {
  /// The canonical code for `raw` as written by `source`, if known.
  fn canonical(&self, source: &str, raw: &str) -> Option<String>;
}

/// Raw mapping tables as written in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CountryConfig {
  /// Entries valid for every source, e.g. `"german" = "DEU"`.
  #[serde(default)]
  pub shared:  BTreeMap<String, String>,
  /// Per-source entries; consulted before `shared`.
  #[serde(default)]
  pub sources: BTreeMap<String, BTreeMap<String, String>>,
}

/// A [`CountryMapping`] backed by in-memory tables with folded keys.
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
  shared:  HashMap<String, String>,
  sources: HashMap<String, HashMap<String, String>>,
}

impl CountryTable {
  pub fn from_config(config: &CountryConfig) -> Self {
    let fold_map = |m: &BTreeMap<String, String>| -> HashMap<String, String> {
      m.iter()
        .map(|(k, v)| (fold(k), v.trim().to_uppercase()))
        .collect()
    };
    Self {
      shared:  fold_map(&config.shared),
      sources: config
        .sources
        .iter()
        .map(|(source, m)| (source.clone(), fold_map(m)))
        .collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.shared.is_empty() && self.sources.values().all(HashMap::is_empty)
  }

  fn is_known_code(&self, code: &str) -> bool {
    self.shared.values().any(|v| v == code)
      || self.sources.values().any(|m| m.values().any(|v| v == code))
  }
}

impl CountryMapping for CountryTable {
  fn canonical(&self, source: &str, raw: &str) -> Option<String> {
    let key = fold(raw);
    if key.is_empty() {
      return None;
    }
    if let Some(code) = self.sources.get(source).and_then(|m| m.get(&key)) {
      return Some(code.clone());
    }
    if let Some(code) = self.shared.get(&key) {
      return Some(code.clone());
    }
    // A provider that already writes canonical codes needs no entry.
    let upper = key.to_uppercase();
    self.is_known_code(&upper).then_some(upper)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> CountryTable {
    let mut config = CountryConfig::default();
    config.shared.insert("German".into(), "deu".into());
    config.shared.insert("Spain".into(), "ESP".into());
    config
      .sources
      .entry("pwa".into())
      .or_default()
      .insert("Spanish".into(), "ESP".into());
    CountryTable::from_config(&config)
  }

  #[test]
  fn shared_and_source_entries_resolve() {
    let t = table();
    assert_eq!(t.canonical("lh", "german").as_deref(), Some("DEU"));
    assert_eq!(t.canonical("pwa", "Spanish").as_deref(), Some("ESP"));
    assert_eq!(t.canonical("lh", "Spanish"), None);
  }

  #[test]
  fn canonical_codes_pass_through() {
    let t = table();
    assert_eq!(t.canonical("lh", "esp").as_deref(), Some("ESP"));
    assert_eq!(t.canonical("lh", "FRA"), None);
  }

  #[test]
  fn empty_table_is_empty() {
    assert!(CountryTable::default().is_empty());
    assert!(!table().is_empty());
  }
}
