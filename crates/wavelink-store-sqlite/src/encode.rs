//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, calendar dates ISO 8601 (`YYYY-MM-DD`).
//! Raw review candidates are stored as compact JSON. UUIDs are stored as
//! hyphenated lowercase strings, so their text order matches their numeric
//! order.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;
use wavelink_core::{
  matcher::Stage,
  model::{CandidateIdentity, ScoreRecord, ScoreType, SourceEventRecord, SourceLink, UnifiedAthlete, WorldEvent},
  review::{ReviewItem, Verdict},
};

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── Dates ───────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Discriminants ───────────────────────────────────────────────────────────

pub fn decode_stage(s: &str) -> Result<Stage> {
  Stage::parse(s).ok_or_else(|| Error::UnknownValue { kind: "stage", value: s.to_owned() })
}

pub fn decode_verdict(s: &str) -> Result<Verdict> {
  Verdict::parse(s).ok_or_else(|| Error::UnknownValue { kind: "verdict", value: s.to_owned() })
}

pub fn decode_score_type(s: &str) -> Result<ScoreType> {
  ScoreType::parse(s).ok_or_else(|| Error::UnknownValue { kind: "score type", value: s.to_owned() })
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw strings read from a `source_links` row.
pub struct RawLink {
  pub athlete_id:  String,
  pub source:      String,
  pub source_id:   String,
  pub match_stage: Option<String>,
  pub match_score: Option<f64>,
}

impl RawLink {
  pub fn into_link(self) -> Result<SourceLink> {
    Ok(SourceLink {
      unified_id:  decode_uuid(&self.athlete_id)?,
      source:      self.source,
      source_id:   self.source_id,
      match_stage: self.match_stage.as_deref().map(decode_stage).transpose()?,
      match_score: self.match_score,
    })
  }
}

/// Raw strings read from an `athletes` row plus its links.
pub struct RawAthlete {
  pub athlete_id:   String,
  pub display_name: String,
  pub birth_year:   Option<i32>,
  pub nationality:  Option<String>,
  pub sail_number:  Option<String>,
  pub created_at:   String,
  pub links:        Vec<RawLink>,
}

impl RawAthlete {
  pub fn into_athlete(self) -> Result<UnifiedAthlete> {
    Ok(UnifiedAthlete {
      id:           decode_uuid(&self.athlete_id)?,
      display_name: self.display_name,
      birth_year:   self.birth_year,
      nationality:  self.nationality,
      sail_number:  self.sail_number,
      source_links: self.links.into_iter().map(RawLink::into_link).collect::<Result<_>>()?,
      created_at:   decode_dt(&self.created_at)?,
    })
  }
}

/// Raw strings read from a `review_decisions` row.
pub struct RawReview {
  pub decision_id: String,
  pub left_json:   String,
  pub right_json:  String,
  pub score:       f64,
  pub stage:       String,
  pub tied:        bool,
  pub verdict:     Option<String>,
  pub created_at:  String,
  pub resolved_at: Option<String>,
}

impl RawReview {
  pub fn into_item(self) -> Result<ReviewItem> {
    let left: CandidateIdentity = serde_json::from_str(&self.left_json)?;
    let right: CandidateIdentity = serde_json::from_str(&self.right_json)?;
    Ok(ReviewItem {
      decision_id: decode_uuid(&self.decision_id)?,
      left,
      right,
      score: self.score,
      stage: decode_stage(&self.stage)?,
      tied: self.tied,
      verdict: self.verdict.as_deref().map(decode_verdict).transpose()?,
      created_at: decode_dt(&self.created_at)?,
      resolved_at: self.resolved_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

/// Raw strings read from a `world_events` row.
pub struct RawWorldEvent {
  pub world_event_id: String,
  pub event_key:      String,
  pub name:           String,
  pub start_date:     String,
  pub end_date:       String,
  pub location:       Option<String>,
  pub country:        Option<String>,
  pub level:          Option<u8>,
  pub primary_source: Option<String>,
}

impl RawWorldEvent {
  pub fn into_world_event(self) -> Result<WorldEvent> {
    Ok(WorldEvent {
      id:             decode_uuid(&self.world_event_id)?,
      key:            self.event_key,
      name:           self.name,
      start_date:     decode_date(&self.start_date)?,
      end_date:       decode_date(&self.end_date)?,
      location:       self.location,
      country:        self.country,
      level:          self.level,
      primary_source: self.primary_source,
    })
  }
}

/// Raw strings read from a `source_events` row.
pub struct RawSourceEvent {
  pub source:          String,
  pub source_event_id: String,
  pub name:            String,
  pub start_date:      String,
  pub end_date:        String,
  pub location:        Option<String>,
  pub country:         Option<String>,
  pub level:           Option<u8>,
}

impl RawSourceEvent {
  pub fn into_record(self) -> Result<SourceEventRecord> {
    Ok(SourceEventRecord {
      source:          self.source,
      source_event_id: self.source_event_id,
      name:            self.name,
      start_date:      decode_date(&self.start_date)?,
      end_date:        decode_date(&self.end_date)?,
      location:        self.location,
      country:         self.country,
      level:           self.level,
    })
  }
}

/// Raw values read from a `scores` row.
pub struct RawScore {
  pub source:            String,
  pub source_event_id:   String,
  pub heat_id:           String,
  pub athlete_source_id: String,
  pub score_hundredths:  i64,
  pub score_type:        String,
  pub counting:          bool,
  pub athlete_name:      Option<String>,
  pub total_points:      Option<f64>,
  pub modifier:          Option<String>,
}

impl RawScore {
  pub fn into_record(self) -> Result<ScoreRecord> {
    Ok(ScoreRecord {
      source:            self.source,
      source_event_id:   self.source_event_id,
      heat_id:           self.heat_id,
      athlete_source_id: self.athlete_source_id,
      score:             self.score_hundredths as f64 / 100.0,
      score_type:        decode_score_type(&self.score_type)?,
      counting:          self.counting,
      athlete_name:      self.athlete_name,
      total_points:      self.total_points,
      modifier:          self.modifier,
    })
  }
}
