//! Data model shared by the matcher, the merge engine and storage backends.
//!
//! Every per-source record carries its provenance (`source` plus a
//! source-local id). Canonical identifiers (`UnifiedAthlete::id`,
//! `WorldEvent::id`) are assigned by the engine and never derived from which
//! source happened to be extracted last.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::matcher::Stage;

// ─── Provenance ──────────────────────────────────────────────────────────────

/// The natural key of a per-source identity: provider name plus the id the
/// provider uses for it.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SourceRef {
  pub source:    String,
  pub source_id: String,
}

impl SourceRef {
  pub fn new(source: impl Into<String>, source_id: impl Into<String>) -> Self {
    Self { source: source.into(), source_id: source_id.into() }
  }
}

impl fmt::Display for SourceRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.source, self.source_id)
  }
}

// ─── Identities ──────────────────────────────────────────────────────────────

/// A raw, pre-resolution description of a person from one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateIdentity {
  pub source:      String,
  pub source_id:   String,
  pub name:        String,
  #[serde(default)]
  pub birth_year:  Option<i32>,
  /// Provider-specific country string (demonym, ISO code, flag name...).
  #[serde(default)]
  pub nationality: Option<String>,
  #[serde(default)]
  pub sail_number: Option<String>,
}

impl CandidateIdentity {
  pub fn source_ref(&self) -> SourceRef {
    SourceRef::new(self.source.clone(), self.source_id.clone())
  }
}

/// The canonical, deduplicated identity spanning providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedAthlete {
  pub id:           Uuid,
  pub display_name: String,
  pub birth_year:   Option<i32>,
  pub nationality:  Option<String>,
  pub sail_number:  Option<String>,
  pub source_links: Vec<SourceLink>,
  pub created_at:   DateTime<Utc>,
}

impl UnifiedAthlete {
  /// The link this athlete holds in `source`, if any.
  pub fn link_in(&self, source: &str) -> Option<&SourceLink> {
    self.source_links.iter().find(|l| l.source == source)
  }
}

/// Ties one source identity to exactly one unified athlete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLink {
  pub unified_id:  Uuid,
  pub source:      String,
  pub source_id:   String,
  /// The matcher stage that produced the link; `None` for source-only
  /// athletes.
  pub match_stage: Option<Stage>,
  pub match_score: Option<f64>,
}

impl SourceLink {
  pub fn source_ref(&self) -> SourceRef {
    SourceRef::new(self.source.clone(), self.source_id.clone())
  }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// One provider's record of a competition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEventRecord {
  pub source:          String,
  pub source_event_id: String,
  pub name:            String,
  pub start_date:      NaiveDate,
  pub end_date:        NaiveDate,
  #[serde(default)]
  pub location:        Option<String>,
  #[serde(default)]
  pub country:         Option<String>,
  /// Competition level (e.g. star rating).
  #[serde(default)]
  pub level:           Option<u8>,
}

impl SourceEventRecord {
  pub fn source_ref(&self) -> SourceRef {
    SourceRef::new(self.source.clone(), self.source_event_id.clone())
  }

  /// Fraction of optional attributes present, in `[0, 1]`.
  pub fn completeness_score(&self) -> f64 {
    let present = [
      self.location.is_some(),
      self.country.is_some(),
      self.level.is_some(),
      self.end_date != self.start_date,
    ]
    .iter()
    .filter(|p| **p)
    .count();
    present as f64 / 4.0
  }
}

/// The real-world competition instance, independent of which provider
/// recorded it. `id` is fixed at first assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
  pub id:             Uuid,
  /// Canonical key: date window, location and competition level.
  pub key:            String,
  pub name:           String,
  pub start_date:     NaiveDate,
  pub end_date:       NaiveDate,
  pub location:       Option<String>,
  pub country:        Option<String>,
  pub level:          Option<u8>,
  /// Provenance label only; never used as a join key.
  pub primary_source: Option<String>,
}

// ─── Facets ──────────────────────────────────────────────────────────────────

/// A final placing (summary facet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
  pub source:            String,
  pub source_event_id:   String,
  pub division:          String,
  pub athlete_source_id: String,
  pub place:             u32,
  #[serde(default)]
  pub athlete_name:      Option<String>,
  #[serde(default)]
  pub sail_number:       Option<String>,
}

/// One heat in the competition ladder (heat-structure facet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatRecord {
  pub source:          String,
  pub source_event_id: String,
  pub heat_id:         String,
  #[serde(default)]
  pub division:        Option<String>,
  #[serde(default)]
  pub round_name:      Option<String>,
  #[serde(default)]
  pub round_order:     Option<u32>,
  #[serde(default)]
  pub heat_order:      Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreType {
  Wave,
  Jump,
  Other,
}

impl ScoreType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Wave => "wave",
      Self::Jump => "jump",
      Self::Other => "other",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "wave" => Some(Self::Wave),
      "jump" => Some(Self::Jump),
      "other" => Some(Self::Other),
      _ => None,
    }
  }
}

/// A single judged ride inside a heat (individual-score facet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
  pub source:            String,
  pub source_event_id:   String,
  pub heat_id:           String,
  pub athlete_source_id: String,
  pub score:             f64,
  pub score_type:        ScoreType,
  pub counting:          bool,
  #[serde(default)]
  pub athlete_name:      Option<String>,
  #[serde(default)]
  pub total_points:      Option<f64>,
  #[serde(default)]
  pub modifier:          Option<String>,
}

impl ScoreRecord {
  /// The score in hundredths; scores are compared at two-decimal precision.
  pub fn score_hundredths(&self) -> i64 { (self.score * 100.0).round() as i64 }
}

// ─── Extraction input ────────────────────────────────────────────────────────

/// One item of the ordered sequence supplied by the extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedRecord {
  Candidate(CandidateIdentity),
  Event(SourceEventRecord),
  Result(ResultRecord),
  Heat(HeatRecord),
  Score(ScoreRecord),
}

/// All records of one extraction run, split by kind. Input order within each
/// kind is preserved but never relied upon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionBatch {
  pub candidates: Vec<CandidateIdentity>,
  pub events:     Vec<SourceEventRecord>,
  pub results:    Vec<ResultRecord>,
  pub heats:      Vec<HeatRecord>,
  pub scores:     Vec<ScoreRecord>,
}

impl ExtractionBatch {
  pub fn push(&mut self, record: ExtractedRecord) {
    match record {
      ExtractedRecord::Candidate(c) => self.candidates.push(c),
      ExtractedRecord::Event(e) => self.events.push(e),
      ExtractedRecord::Result(r) => self.results.push(r),
      ExtractedRecord::Heat(h) => self.heats.push(h),
      ExtractedRecord::Score(s) => self.scores.push(s),
    }
  }
}

impl FromIterator<ExtractedRecord> for ExtractionBatch {
  fn from_iter<I: IntoIterator<Item = ExtractedRecord>>(iter: I) -> Self {
    let mut batch = Self::default();
    for record in iter {
      batch.push(record);
    }
    batch
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extracted_record_is_tagged_by_kind() {
    let line = r#"{"kind":"candidate","source":"pwa","source_id":"17","name":"Adam Warchol","birth_year":1990}"#;
    let record: ExtractedRecord = serde_json::from_str(line).unwrap();
    let ExtractedRecord::Candidate(c) = record else {
      panic!("expected a candidate");
    };
    assert_eq!(c.source_ref(), SourceRef::new("pwa", "17"));
    assert_eq!(c.birth_year, Some(1990));
    assert!(c.nationality.is_none());
  }

  #[test]
  fn batch_splits_records_by_kind() {
    let batch: ExtractionBatch = vec![
      ExtractedRecord::Heat(HeatRecord {
        source:          "lh".into(),
        source_event_id: "e1".into(),
        heat_id:         "h1".into(),
        division:        None,
        round_name:      None,
        round_order:     None,
        heat_order:      None,
      }),
      ExtractedRecord::Candidate(CandidateIdentity {
        source:      "lh".into(),
        source_id:   "a1".into(),
        name:        "Sarah Hauser".into(),
        birth_year:  None,
        nationality: None,
        sail_number: None,
      }),
    ]
    .into_iter()
    .collect();
    assert_eq!(batch.heats.len(), 1);
    assert_eq!(batch.candidates.len(), 1);
    assert!(batch.events.is_empty());
  }

  #[test]
  fn score_key_uses_two_decimals() {
    let mut s = ScoreRecord {
      source:            "lh".into(),
      source_event_id:   "e1".into(),
      heat_id:           "h1".into(),
      athlete_source_id: "a1".into(),
      score:             7.125,
      score_type:        ScoreType::Wave,
      counting:          true,
      athlete_name:      None,
      total_points:      None,
      modifier:          None,
    };
    assert_eq!(s.score_hundredths(), 713);
    s.score = 7.1;
    assert_eq!(s.score_hundredths(), 710);
  }
}
