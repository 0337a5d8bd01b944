//! World-event matching and per-event primary-source election.
//!
//! Two source events describe the same competition when at least two of
//! three signals hold: overlapping dates, the same location, similar names.
//! Matching consumes the right-hand pool exactly like the athlete matcher.
//!
//! The primary source of a world event is a provenance label only. Facet rows
//! join to their world event through `world_event_id` whatever source they
//! came from.

use std::{
  cmp::Ordering,
  collections::{BTreeMap, BTreeSet},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  config::{EventMatchConfig, FacetWeights},
  country::CountryMapping,
  model::{HeatRecord, ResultRecord, ScoreRecord, SourceEventRecord, SourceRef, WorldEvent},
  normalize::{fold, normalize_name},
  score::name_similarity,
};

/// Namespace for world-event ids.
const WORLD_EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x0b7e_52c4_1d6a_4f39_8e20_93ad_f4c1_6b58);

/// The id a world event with `key` receives on first assignment.
pub fn world_event_id(key: &str) -> Uuid { Uuid::new_v5(&WORLD_EVENT_NAMESPACE, key.as_bytes()) }

// ─── Signals ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EventSignals {
  pub dates_overlap:   bool,
  /// Absolute distance between start dates, in days.
  pub date_distance:   i64,
  pub same_location:   bool,
  pub name_similarity: f64,
  pub similar_name:    bool,
}

impl EventSignals {
  pub fn count(&self) -> u8 {
    [self.dates_overlap, self.same_location, self.similar_name]
      .into_iter()
      .filter(|s| *s)
      .count() as u8
  }
}

/// A group of source events recognised as one competition. The first member
/// is the left-source record when there is one.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCluster {
  pub members: Vec<SourceEventRecord>,
}

impl EventCluster {
  pub fn refs(&self) -> BTreeSet<SourceRef> { self.members.iter().map(|m| m.source_ref()).collect() }
}

// ─── Matcher ─────────────────────────────────────────────────────────────────

pub struct EventMatcher<'a> {
  config:    &'a EventMatchConfig,
  countries: Option<&'a dyn CountryMapping>,
  /// Location group → folded keywords.
  aliases:   Vec<(String, Vec<String>)>,
}

impl<'a> EventMatcher<'a> {
  pub fn new(config: &'a EventMatchConfig, countries: Option<&'a dyn CountryMapping>) -> Self {
    let aliases = config
      .location_aliases
      .iter()
      .map(|(group, words)| {
        (group.clone(), words.iter().map(|w| fold(w)).filter(|w| !w.is_empty()).collect())
      })
      .collect();
    Self { config, countries, aliases }
  }

  /// The configured location group whose keywords appear in the event's
  /// location or name.
  pub fn location_group(&self, event: &SourceEventRecord) -> Option<&str> {
    let haystack = format!(
      " {} {} ",
      fold(event.location.as_deref().unwrap_or_default()),
      fold(&event.name)
    );
    self
      .aliases
      .iter()
      .find(|(_, words)| words.iter().any(|w| haystack.contains(&format!(" {w} "))))
      .map(|(group, _)| group.as_str())
  }

  /// Canonical country code of the event, if any.
  pub fn country_code(&self, event: &SourceEventRecord) -> Option<String> {
    let raw = event.country.as_deref()?;
    let mapped = self.countries.and_then(|m| m.canonical(&event.source, raw));
    mapped.or_else(|| Some(fold(raw).to_uppercase()).filter(|c| !c.is_empty()))
  }

  pub fn signals(&self, a: &SourceEventRecord, b: &SourceEventRecord) -> EventSignals {
    let tol = i64::from(self.config.date_tolerance_days);
    let days = |x: chrono::NaiveDate, y: chrono::NaiveDate| (x - y).num_days();
    let dates_overlap = days(a.start_date, b.end_date) <= tol && days(b.start_date, a.end_date) <= tol;
    let date_distance = days(a.start_date, b.start_date).abs();

    let same_group = match (self.location_group(a), self.location_group(b)) {
      (Some(x), Some(y)) => x == y,
      _ => false,
    };
    let same_country = match (self.country_code(a), self.country_code(b)) {
      (Some(x), Some(y)) => x == y,
      _ => false,
    };

    let name_similarity = match (normalize_name(&a.name), normalize_name(&b.name)) {
      (Ok(x), Ok(y)) => name_similarity(&x, &y),
      _ => 0.0,
    };

    EventSignals {
      dates_overlap,
      date_distance,
      same_location: same_group || same_country,
      name_similarity,
      similar_name: name_similarity >= self.config.name_threshold,
    }
  }

  /// Pair every left event with at most one right event.
  ///
  /// Lefts are visited in [`SourceRef`] order. Qualifying rights rank by
  /// signal count, then name similarity, then date distance, then
  /// `source_event_id`. Unpaired events of either side form single-member
  /// clusters.
  pub fn cluster(
    &self,
    left: Vec<SourceEventRecord>,
    right: Vec<SourceEventRecord>,
  ) -> Vec<EventCluster> {
    let lefts: BTreeMap<SourceRef, SourceEventRecord> =
      left.into_iter().map(|e| (e.source_ref(), e)).collect();
    let mut pool: BTreeMap<SourceRef, SourceEventRecord> =
      right.into_iter().map(|e| (e.source_ref(), e)).collect();
    let mut clusters = Vec::with_capacity(lefts.len() + pool.len());

    for (_, l) in lefts {
      let best = pool
        .iter()
        .map(|(key, r)| (key, self.signals(&l, r)))
        .filter(|(_, s)| s.count() >= self.config.min_signals)
        .min_by(|(ka, sa), (kb, sb)| {
          rank(sa, sb)
            .then_with(|| ka.source_id.cmp(&kb.source_id))
            .then_with(|| ka.cmp(kb))
        })
        .map(|(key, _)| key.clone());

      let mut members = vec![l];
      if let Some(r) = best.and_then(|key| pool.remove(&key)) {
        members.push(r);
      }
      clusters.push(EventCluster { members });
    }

    clusters.extend(pool.into_values().map(|r| EventCluster { members: vec![r] }));
    clusters
  }

  /// The stored world event an unlinked cluster belongs to, if any.
  ///
  /// `candidates` pairs each stored world event with its member source
  /// events. A candidate qualifies when some stored member shares at least
  /// `min_signals` signals with some incoming member and none of its members
  /// comes from a source already in `members`. Ties rank like
  /// [`cluster`](Self::cluster), then by world-event id.
  pub fn join_stored(
    &self,
    members: &[SourceEventRecord],
    candidates: Vec<(WorldEvent, Vec<SourceEventRecord>)>,
  ) -> Option<WorldEvent> {
    let sources: BTreeSet<&str> = members.iter().map(|m| m.source.as_str()).collect();
    candidates
      .into_iter()
      .filter(|(_, stored)| stored.iter().all(|s| !sources.contains(s.source.as_str())))
      .filter_map(|(world_event, stored)| {
        let best = members
          .iter()
          .flat_map(|m| stored.iter().map(move |s| self.signals(m, s)))
          .filter(|s| s.count() >= self.config.min_signals)
          .min_by(rank)?;
        Some((world_event, best))
      })
      .min_by(|(wa, sa), (wb, sb)| rank(sa, sb).then_with(|| wa.id.cmp(&wb.id)))
      .map(|(world_event, _)| world_event)
  }

  /// Canonical key of a cluster: date window, location and level.
  pub fn world_event_key(&self, members: &[SourceEventRecord]) -> String {
    let start = members.iter().map(|m| m.start_date).min();
    let end = members.iter().map(|m| m.end_date).max();
    let location = members
      .iter()
      .find_map(|m| self.location_group(m).map(str::to_owned))
      .or_else(|| members.iter().find_map(|m| self.country_code(m)))
      .or_else(|| {
        members
          .iter()
          .find_map(|m| m.location.as_deref().map(fold).filter(|l| !l.is_empty()))
      })
      .unwrap_or_else(|| "unknown".into());
    let level = members
      .iter()
      .filter_map(|m| m.level)
      .max()
      .map_or_else(|| "-".to_owned(), |l| l.to_string());

    match (start, end) {
      (Some(s), Some(e)) => format!("{s}/{e}/{location}/{level}"),
      _ => format!("-/-/{location}/{level}"),
    }
  }

  /// A fresh world event for `members`, before primary-source election.
  pub fn new_world_event(&self, members: &[SourceEventRecord]) -> Option<WorldEvent> {
    let first = members.first()?;
    let key = self.world_event_key(members);
    Some(WorldEvent {
      id:             world_event_id(&key),
      key,
      name:           first.name.clone(),
      start_date:     members.iter().map(|m| m.start_date).min()?,
      end_date:       members.iter().map(|m| m.end_date).max()?,
      location:       members.iter().find_map(|m| m.location.clone()),
      country:        members.iter().find_map(|m| self.country_code(m)),
      level:          members.iter().filter_map(|m| m.level).max(),
      primary_source: None,
    })
  }
}

/// `Less` means `a` is the better candidate.
fn rank(a: &EventSignals, b: &EventSignals) -> Ordering {
  b.count()
    .cmp(&a.count())
    .then_with(|| b.name_similarity.total_cmp(&a.name_similarity))
    .then_with(|| a.date_distance.cmp(&b.date_distance))
}

// ─── Facet weighting ─────────────────────────────────────────────────────────

/// Record counts of one source's facets for one world event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCounts {
  pub results: usize,
  pub heats:   usize,
  pub scores:  usize,
}

impl FacetCounts {
  pub fn weight(&self, w: &FacetWeights) -> f64 {
    self.results as f64 * w.results + self.heats as f64 * w.heats + self.scores as f64 * w.scores
  }
}

/// Elect the primary source of one world event: highest facet weight, then
/// highest completeness of the source's own event record, then the lexically
/// smallest source name.
pub fn elect_primary_source(
  members: &[SourceEventRecord],
  counts: &BTreeMap<String, FacetCounts>,
  weights: &FacetWeights,
) -> Option<String> {
  let sources: BTreeSet<&str> = members
    .iter()
    .map(|m| m.source.as_str())
    .chain(counts.keys().map(String::as_str))
    .collect();

  let completeness = |source: &str| {
    members
      .iter()
      .filter(|m| m.source == source)
      .map(SourceEventRecord::completeness_score)
      .fold(0.0, f64::max)
  };
  let weight = |source: &str| counts.get(source).map_or(0.0, |c| c.weight(weights));

  sources
    .into_iter()
    .max_by(|a, b| {
      weight(a)
        .total_cmp(&weight(b))
        .then_with(|| completeness(a).total_cmp(&completeness(b)))
        .then_with(|| b.cmp(a))
    })
    .map(str::to_owned)
}

/// Fill in the derived fields of `event`: primary source and the display
/// name taken from the primary source's record. The id and key are left
/// untouched.
pub fn finalize_world_event(
  event: &mut WorldEvent,
  members: &[SourceEventRecord],
  counts: &BTreeMap<String, FacetCounts>,
  weights: &FacetWeights,
) {
  event.primary_source = elect_primary_source(members, counts, weights);
  if let Some(primary) = &event.primary_source
    && let Some(record) = members.iter().find(|m| &m.source == primary)
  {
    event.name = record.name.clone();
  }
}

// ─── Units ───────────────────────────────────────────────────────────────────

/// One world event's facet set, written as a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFacetUnit {
  pub world_event: WorldEvent,
  /// Source events to (re)link to `world_event`.
  pub members:     Vec<SourceEventRecord>,
  pub results:     Vec<ResultRecord>,
  pub heats:       Vec<HeatRecord>,
  pub scores:      Vec<ScoreRecord>,
  /// Used to re-elect the primary source over everything stored for the
  /// event once the unit's rows are in.
  pub weights:     FacetWeights,
}

/// Insert/update/no-change tallies of natural-key upserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
  pub inserted:  usize,
  pub updated:   usize,
  pub unchanged: usize,
}

impl UpsertCounts {
  pub fn add(&mut self, other: UpsertCounts) {
    self.inserted += other.inserted;
    self.updated += other.updated;
    self.unchanged += other.unchanged;
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetUpsertReport {
  pub world_event_id: Uuid,
  pub primary_source: Option<String>,
  pub results:        UpsertCounts,
  pub heats:          UpsertCounts,
  pub scores:         UpsertCounts,
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn date(s: &str) -> NaiveDate { s.parse().unwrap() }

  fn event(
    source: &str,
    id: &str,
    name: &str,
    start: &str,
    end: &str,
    location: Option<&str>,
  ) -> SourceEventRecord {
    SourceEventRecord {
      source:          source.into(),
      source_event_id: id.into(),
      name:            name.into(),
      start_date:      date(start),
      end_date:        date(end),
      location:        location.map(str::to_owned),
      country:         None,
      level:           None,
    }
  }

  #[test]
  fn two_of_three_signals_match() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);

    let lh = event("liveheats", "e1", "Aloha Classic", "2023-10-26", "2023-11-05", Some("Hookipa"));
    let pwa = event("pwa", "p1", "Maui Aloha Classic", "2023-10-27", "2023-11-04", Some("Maui, USA"));
    let s = m.signals(&lh, &pwa);
    assert!(s.dates_overlap);
    assert!(s.same_location);
    assert!(s.count() >= 2);

    let clusters = m.cluster(vec![lh], vec![pwa]);
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].members.len(), 2);
  }

  #[test]
  fn a_single_strong_signal_is_not_enough() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);

    // Same name, a year apart, no known location.
    let a = event("liveheats", "e1", "Summer Classic", "2022-10-26", "2022-11-05", None);
    let b = event("pwa", "p1", "Summer Classic", "2023-10-26", "2023-11-05", None);
    assert_eq!(m.signals(&a, &b).count(), 1);

    let clusters = m.cluster(vec![a], vec![b]);
    assert_eq!(clusters.len(), 2);
  }

  #[test]
  fn date_tolerance_widens_overlap() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);
    let a = event("liveheats", "e1", "Pozo", "2024-07-01", "2024-07-05", None);
    let b = event("pwa", "p1", "Pozo", "2024-07-06", "2024-07-10", None);
    assert!(m.signals(&a, &b).dates_overlap);
    let c = event("pwa", "p2", "Pozo", "2024-07-07", "2024-07-10", None);
    assert!(!m.signals(&a, &c).dates_overlap);
  }

  #[test]
  fn best_candidate_wins_and_is_consumed() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);
    let left = vec![
      event("liveheats", "e1", "Gran Canaria Wind & Waves", "2024-07-01", "2024-07-07", Some("Pozo")),
      event("liveheats", "e2", "Gran Canaria Wind & Waves", "2024-07-01", "2024-07-07", Some("Pozo")),
    ];
    let right = vec![
      event("pwa", "p2", "Tenerife World Cup", "2024-07-01", "2024-07-07", Some("El Medano")),
      event("pwa", "p1", "Gran Canaria Wind Waves", "2024-07-02", "2024-07-08", Some("Gran Canaria")),
    ];
    let clusters = m.cluster(left, right);
    let pair = clusters.iter().find(|c| c.members.len() == 2).unwrap();
    assert_eq!(pair.members[0].source_event_id, "e1");
    assert_eq!(pair.members[1].source_event_id, "p1");
    // e2 finds p1 already taken; Tenerife only overlaps in dates.
    assert_eq!(clusters.len(), 3);
  }

  #[test]
  fn world_event_id_is_stable_for_the_same_key() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);
    let members = vec![
      event("liveheats", "e1", "Sylt", "2024-09-27", "2024-10-06", Some("Westerland")),
      event("pwa", "p1", "Sylt World Cup", "2024-09-28", "2024-10-06", None),
    ];
    let a = m.new_world_event(&members).unwrap();
    let b = m.new_world_event(&members).unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.key, "2024-09-27/2024-10-06/sylt/-");
    assert_eq!(a.id, world_event_id(&a.key));
  }

  #[test]
  fn late_counterpart_joins_the_stored_world_event() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);
    let lh = event("liveheats", "e1", "Aloha Classic", "2023-10-26", "2023-11-05", Some("Hookipa"));
    let stored = m.new_world_event(std::slice::from_ref(&lh)).unwrap();
    let pwa = event("pwa", "p1", "Maui Aloha Classic", "2023-10-27", "2023-11-04", Some("Maui, USA"));

    let joined = m.join_stored(&[pwa], vec![(stored.clone(), vec![lh])]).unwrap();
    assert_eq!(joined.id, stored.id);
  }

  #[test]
  fn stored_world_event_with_the_same_source_is_not_joined() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);
    let p1 = event("pwa", "p1", "Maui Aloha Classic", "2023-10-27", "2023-11-04", Some("Maui, USA"));
    let stored = m.new_world_event(std::slice::from_ref(&p1)).unwrap();
    let p2 = event("pwa", "p2", "Maui Aloha Classic", "2023-10-27", "2023-11-04", Some("Maui, USA"));
    assert!(m.join_stored(&[p2], vec![(stored, vec![p1])]).is_none());

    // One signal is not enough to join either.
    let a = event("liveheats", "e1", "Summer Classic", "2022-10-26", "2022-11-05", None);
    let stored = m.new_world_event(std::slice::from_ref(&a)).unwrap();
    let b = event("pwa", "p3", "Summer Classic", "2023-10-26", "2023-11-05", None);
    assert!(m.join_stored(&[b], vec![(stored, vec![a])]).is_none());
  }

  #[test]
  fn granular_facets_elect_the_primary_source() {
    let members = vec![
      event("x", "1", "Event", "2024-01-01", "2024-01-02", Some("Somewhere")),
      event("y", "2", "Event", "2024-01-01", "2024-01-01", None),
    ];
    let counts = BTreeMap::from([
      ("x".to_owned(), FacetCounts { results: 2, heats: 0, scores: 0 }),
      ("y".to_owned(), FacetCounts { results: 2, heats: 0, scores: 800 }),
    ]);
    let primary = elect_primary_source(&members, &counts, &FacetWeights::default());
    assert_eq!(primary.as_deref(), Some("y"));
  }

  #[test]
  fn weight_ties_fall_back_to_completeness_then_name() {
    let weights = FacetWeights::default();
    let counts = BTreeMap::from([
      ("x".to_owned(), FacetCounts { results: 3, ..Default::default() }),
      ("y".to_owned(), FacetCounts { results: 3, ..Default::default() }),
    ]);

    let members = vec![
      event("x", "1", "Event", "2024-01-01", "2024-01-01", None),
      event("y", "2", "Event", "2024-01-01", "2024-01-03", Some("Here")),
    ];
    assert_eq!(elect_primary_source(&members, &counts, &weights).as_deref(), Some("y"));

    let members = vec![
      event("x", "1", "Event", "2024-01-01", "2024-01-01", None),
      event("y", "2", "Event", "2024-01-01", "2024-01-01", None),
    ];
    assert_eq!(elect_primary_source(&members, &counts, &weights).as_deref(), Some("x"));
  }

  #[test]
  fn finalize_takes_name_from_primary() {
    let config = EventMatchConfig::default();
    let m = EventMatcher::new(&config, None);
    let members = vec![
      event("liveheats", "e1", "Aloha Classic", "2023-10-26", "2023-11-05", None),
      event("pwa", "p1", "Maui Aloha Classic", "2023-10-26", "2023-11-05", None),
    ];
    let mut we = m.new_world_event(&members).unwrap();
    let id = we.id;
    let counts = BTreeMap::from([("pwa".to_owned(), FacetCounts { heats: 4, ..Default::default() })]);
    finalize_world_event(&mut we, &members, &counts, &FacetWeights::default());
    assert_eq!(we.primary_source.as_deref(), Some("pwa"));
    assert_eq!(we.name, "Maui Aloha Classic");
    assert_eq!(we.id, id);
  }
}
