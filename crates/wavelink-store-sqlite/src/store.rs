//! [`SqliteStore`]: the SQLite implementation of [`MergeStore`] and
//! [`ReviewQueue`].

use std::{collections::BTreeMap, path::Path};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wavelink_core::{
  event::{EventFacetUnit, FacetCounts, FacetUpsertReport, UpsertCounts, finalize_world_event},
  identity::{AthleteAttributes, IdentityPlan},
  model::{
    HeatRecord, ResultRecord, ScoreRecord, SourceEventRecord, SourceLink, SourceRef,
    UnifiedAthlete, WorldEvent,
  },
  review::{NewReview, ReviewItem, ReviewQueue, Verdict},
  store::{LockOutcome, MergeStore},
};

use crate::{
  Error, Result,
  encode::{
    RawAthlete, RawLink, RawReview, RawScore, RawSourceEvent, RawWorldEvent, decode_dt,
    decode_uuid, decode_verdict, encode_date, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A wavelink store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Row count of every persisted table.
  pub async fn table_counts(&self) -> Result<BTreeMap<&'static str, i64>> {
    const TABLES: [&str; 9] = [
      "athletes",
      "source_links",
      "review_decisions",
      "world_events",
      "source_events",
      "results",
      "heats",
      "scores",
      "run_lock",
    ];

    let counts = self
      .conn
      .call(|conn| {
        let mut counts = BTreeMap::new();
        for table in TABLES {
          let n: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
          counts.insert(table, n);
        }
        Ok(counts)
      })
      .await?;
    Ok(counts)
  }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

/// Outcome of one natural-key upsert.
enum Change {
  Inserted,
  Updated,
  Unchanged,
}

fn tally(counts: &mut UpsertCounts, change: Change) {
  match change {
    Change::Inserted => counts.inserted += 1,
    Change::Updated => counts.updated += 1,
    Change::Unchanged => counts.unchanged += 1,
  }
}

fn read_links(conn: &Connection, athlete_id: &str) -> rusqlite::Result<Vec<RawLink>> {
  let mut stmt = conn.prepare(
    "SELECT athlete_id, source, source_id, match_stage, match_score
     FROM source_links WHERE athlete_id = ?1
     ORDER BY source, source_id",
  )?;
  let rows = stmt
    .query_map(params![athlete_id], |row| {
      Ok(RawLink {
        athlete_id:  row.get(0)?,
        source:      row.get(1)?,
        source_id:   row.get(2)?,
        match_stage: row.get(3)?,
        match_score: row.get(4)?,
      })
    })?
    .collect();
  rows
}

fn read_athlete(conn: &Connection, athlete_id: &str) -> rusqlite::Result<Option<RawAthlete>> {
  let athlete = conn
    .query_row(
      "SELECT athlete_id, display_name, birth_year, nationality, sail_number, created_at
       FROM athletes WHERE athlete_id = ?1",
      params![athlete_id],
      |row| {
        Ok(RawAthlete {
          athlete_id:   row.get(0)?,
          display_name: row.get(1)?,
          birth_year:   row.get(2)?,
          nationality:  row.get(3)?,
          sail_number:  row.get(4)?,
          created_at:   row.get(5)?,
          links:        Vec::new(),
        })
      },
    )
    .optional()?;

  let Some(mut athlete) = athlete else {
    return Ok(None);
  };
  athlete.links = read_links(conn, athlete_id)?;
  Ok(Some(athlete))
}

fn link_owner(conn: &Connection, source: &str, source_id: &str) -> rusqlite::Result<Option<String>> {
  conn
    .query_row(
      "SELECT athlete_id FROM source_links WHERE source = ?1 AND source_id = ?2",
      params![source, source_id],
      |r| r.get(0),
    )
    .optional()
}

fn insert_link(conn: &Connection, link: &SourceLink) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO source_links (source, source_id, athlete_id, match_stage, match_score)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    params![
      link.source,
      link.source_id,
      encode_uuid(link.unified_id),
      link.match_stage.map(|s| s.as_str()),
      link.match_score,
    ],
  )?;
  Ok(())
}

fn write_attributes(
  conn: &Connection,
  athlete_id: &str,
  attrs: &AthleteAttributes,
) -> rusqlite::Result<usize> {
  conn.execute(
    "UPDATE athletes
     SET display_name = ?2, birth_year = ?3, nationality = ?4, sail_number = ?5
     WHERE athlete_id = ?1",
    params![athlete_id, attrs.display_name, attrs.birth_year, attrs.nationality, attrs.sail_number],
  )
}

/// Re-check an attachment inside the writing transaction. `Ok(None)` means
/// the link is already in place.
fn check_attach(
  conn: &Connection,
  athlete_id: Uuid,
  link: &SourceLink,
) -> rusqlite::Result<Option<Result<()>>> {
  let id = encode_uuid(athlete_id);

  if let Some(owner) = link_owner(conn, &link.source, &link.source_id)? {
    if owner == id {
      return Ok(None);
    }
    // Name the target by a link it already holds.
    let held: Option<(String, String)> = conn
      .query_row(
        "SELECT source, source_id FROM source_links WHERE athlete_id = ?1
         ORDER BY source, source_id LIMIT 1",
        params![id],
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?;
    let left = held
      .map_or_else(|| link.source_ref(), |(source, source_id)| SourceRef::new(source, source_id));
    let conflict = match decode_uuid(&owner) {
      Ok(owner_id) => wavelink_core::Error::IdentityConflict {
        left,
        left_id: athlete_id,
        right: link.source_ref(),
        right_id: owner_id,
      }
      .into(),
      Err(err) => err,
    };
    return Ok(Some(Err(conflict)));
  }

  let existing: Option<String> = conn
    .query_row(
      "SELECT source_id FROM source_links WHERE athlete_id = ?1 AND source = ?2",
      params![id, link.source],
      |r| r.get(0),
    )
    .optional()?;
  if let Some(existing) = existing {
    return Ok(Some(Err(
      wavelink_core::Error::SourceSlotTaken {
        unified_id: athlete_id,
        existing:   SourceRef::new(link.source.clone(), existing),
        incoming:   link.source_ref(),
      }
      .into(),
    )));
  }
  Ok(Some(Ok(())))
}

const REVIEW_COLUMNS: &str =
  "decision_id, left_json, right_json, score, stage, tied, verdict, created_at, resolved_at";

fn review_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawReview> {
  Ok(RawReview {
    decision_id: row.get(0)?,
    left_json:   row.get(1)?,
    right_json:  row.get(2)?,
    score:       row.get(3)?,
    stage:       row.get(4)?,
    tied:        row.get(5)?,
    verdict:     row.get(6)?,
    created_at:  row.get(7)?,
    resolved_at: row.get(8)?,
  })
}

fn read_review(conn: &Connection, decision_id: &str) -> rusqlite::Result<Option<RawReview>> {
  conn
    .query_row(
      &format!("SELECT {REVIEW_COLUMNS} FROM review_decisions WHERE decision_id = ?1"),
      params![decision_id],
      review_from_row,
    )
    .optional()
}

fn world_event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawWorldEvent> {
  Ok(RawWorldEvent {
    world_event_id: row.get(0)?,
    event_key:      row.get(1)?,
    name:           row.get(2)?,
    start_date:     row.get(3)?,
    end_date:       row.get(4)?,
    location:       row.get(5)?,
    country:        row.get(6)?,
    level:          row.get(7)?,
    primary_source: row.get(8)?,
  })
}

fn read_source_events(conn: &Connection, world_event_id: &str) -> rusqlite::Result<Vec<RawSourceEvent>> {
  let mut stmt = conn.prepare(
    "SELECT source, source_event_id, name, start_date, end_date, location, country, level
     FROM source_events WHERE world_event_id = ?1
     ORDER BY source, source_event_id",
  )?;
  let rows = stmt
    .query_map(params![world_event_id], |row| {
      Ok(RawSourceEvent {
        source:          row.get(0)?,
        source_event_id: row.get(1)?,
        name:            row.get(2)?,
        start_date:      row.get(3)?,
        end_date:        row.get(4)?,
        location:        row.get(5)?,
        country:         row.get(6)?,
        level:           row.get(7)?,
      })
    })?
    .collect();
  rows
}

// ── Event unit writes ───────────────────────────────────────────────────────

fn upsert_world_event(conn: &Connection, event: &WorldEvent) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO world_events (
       world_event_id, event_key, name, start_date, end_date, location, country, level
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT (world_event_id) DO UPDATE SET
       start_date = min(world_events.start_date, excluded.start_date),
       end_date   = max(world_events.end_date, excluded.end_date),
       location   = COALESCE(world_events.location, excluded.location),
       country    = COALESCE(world_events.country, excluded.country),
       level      = COALESCE(world_events.level, excluded.level)",
    params![
      encode_uuid(event.id),
      event.key,
      event.name,
      encode_date(event.start_date),
      encode_date(event.end_date),
      event.location,
      event.country,
      event.level,
    ],
  )?;
  Ok(())
}

fn upsert_source_event(
  conn: &Connection,
  world_event_id: &str,
  e: &SourceEventRecord,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO source_events (
       source, source_event_id, world_event_id, name, start_date, end_date,
       location, country, level
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT (source, source_event_id) DO UPDATE SET
       world_event_id = excluded.world_event_id,
       name           = excluded.name,
       start_date     = excluded.start_date,
       end_date       = excluded.end_date,
       location       = COALESCE(excluded.location, source_events.location),
       country        = COALESCE(excluded.country, source_events.country),
       level          = COALESCE(excluded.level, source_events.level)",
    params![
      e.source,
      e.source_event_id,
      world_event_id,
      e.name,
      encode_date(e.start_date),
      encode_date(e.end_date),
      e.location,
      e.country,
      e.level,
    ],
  )?;
  Ok(())
}

fn upsert_result(conn: &Connection, world_event_id: &str, r: &ResultRecord) -> rusqlite::Result<Change> {
  type Payload = (String, Option<String>, Option<String>);
  let existing: Option<Payload> = conn
    .query_row(
      "SELECT world_event_id, athlete_name, sail_number FROM results
       WHERE source = ?1 AND source_event_id = ?2 AND division = ?3
         AND athlete_source_id = ?4 AND place = ?5",
      params![r.source, r.source_event_id, r.division, r.athlete_source_id, r.place],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .optional()?;
  let payload: Payload = (world_event_id.to_owned(), r.athlete_name.clone(), r.sail_number.clone());

  match existing {
    Some(stored) if stored == payload => Ok(Change::Unchanged),
    Some(_) => {
      conn.execute(
        "UPDATE results SET world_event_id = ?6, athlete_name = ?7, sail_number = ?8
         WHERE source = ?1 AND source_event_id = ?2 AND division = ?3
           AND athlete_source_id = ?4 AND place = ?5",
        params![
          r.source,
          r.source_event_id,
          r.division,
          r.athlete_source_id,
          r.place,
          payload.0,
          payload.1,
          payload.2,
        ],
      )?;
      Ok(Change::Updated)
    }
    None => {
      conn.execute(
        "INSERT INTO results (
           source, source_event_id, division, athlete_source_id, place,
           world_event_id, athlete_name, sail_number
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
          r.source,
          r.source_event_id,
          r.division,
          r.athlete_source_id,
          r.place,
          payload.0,
          payload.1,
          payload.2,
        ],
      )?;
      Ok(Change::Inserted)
    }
  }
}

fn upsert_heat(conn: &Connection, world_event_id: &str, h: &HeatRecord) -> rusqlite::Result<Change> {
  type Payload = (String, String, Option<String>, Option<String>, Option<u32>, Option<u32>);
  let existing: Option<Payload> = conn
    .query_row(
      "SELECT source_event_id, world_event_id, division, round_name, round_order, heat_order
       FROM heats WHERE source = ?1 AND heat_id = ?2",
      params![h.source, h.heat_id],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
    )
    .optional()?;
  let payload: Payload = (
    h.source_event_id.clone(),
    world_event_id.to_owned(),
    h.division.clone(),
    h.round_name.clone(),
    h.round_order,
    h.heat_order,
  );

  let change = match existing {
    Some(stored) if stored == payload => return Ok(Change::Unchanged),
    Some(_) => Change::Updated,
    None => Change::Inserted,
  };
  conn.execute(
    "INSERT INTO heats (
       source, heat_id, source_event_id, world_event_id, division,
       round_name, round_order, heat_order
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT (source, heat_id) DO UPDATE SET
       source_event_id = excluded.source_event_id,
       world_event_id  = excluded.world_event_id,
       division        = excluded.division,
       round_name      = excluded.round_name,
       round_order     = excluded.round_order,
       heat_order      = excluded.heat_order",
    params![h.source, h.heat_id, payload.0, payload.1, payload.2, payload.3, payload.4, payload.5],
  )?;
  Ok(change)
}

fn upsert_score(conn: &Connection, world_event_id: &str, s: &ScoreRecord) -> rusqlite::Result<Change> {
  type Payload = (String, String, Option<String>, Option<f64>, Option<String>);
  let hundredths = s.score_hundredths();
  let score_type = s.score_type.as_str();
  let existing: Option<Payload> = conn
    .query_row(
      "SELECT source_event_id, world_event_id, athlete_name, total_points, modifier
       FROM scores
       WHERE source = ?1 AND heat_id = ?2 AND athlete_source_id = ?3
         AND score_hundredths = ?4 AND score_type = ?5 AND counting = ?6",
      params![s.source, s.heat_id, s.athlete_source_id, hundredths, score_type, s.counting],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )
    .optional()?;
  let payload: Payload = (
    s.source_event_id.clone(),
    world_event_id.to_owned(),
    s.athlete_name.clone(),
    s.total_points,
    s.modifier.clone(),
  );

  let change = match existing {
    Some(stored) if stored == payload => return Ok(Change::Unchanged),
    Some(_) => Change::Updated,
    None => Change::Inserted,
  };
  conn.execute(
    "INSERT INTO scores (
       source, heat_id, athlete_source_id, score_hundredths, score_type, counting,
       source_event_id, world_event_id, athlete_name, total_points, modifier
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
     ON CONFLICT (source, heat_id, athlete_source_id, score_hundredths, score_type, counting)
     DO UPDATE SET
       source_event_id = excluded.source_event_id,
       world_event_id  = excluded.world_event_id,
       athlete_name    = excluded.athlete_name,
       total_points    = excluded.total_points,
       modifier        = excluded.modifier",
    params![
      s.source,
      s.heat_id,
      s.athlete_source_id,
      hundredths,
      score_type,
      s.counting,
      payload.0,
      payload.1,
      payload.2,
      payload.3,
      payload.4,
    ],
  )?;
  Ok(change)
}

/// Stored facet rows per source for one world event.
fn facet_counts(conn: &Connection, world_event_id: &str) -> rusqlite::Result<BTreeMap<String, FacetCounts>> {
  let mut counts: BTreeMap<String, FacetCounts> = BTreeMap::new();
  for table in ["results", "heats", "scores"] {
    let mut stmt = conn.prepare(&format!(
      "SELECT source, COUNT(*) FROM {table} WHERE world_event_id = ?1 GROUP BY source"
    ))?;
    let rows = stmt.query_map(params![world_event_id], |r| {
      Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
    })?;
    for row in rows {
      let (source, n) = row?;
      let entry = counts.entry(source).or_default();
      let n = usize::try_from(n).unwrap_or_default();
      match table {
        "results" => entry.results = n,
        "heats" => entry.heats = n,
        _ => entry.scores = n,
      }
    }
  }
  Ok(counts)
}

const RESULT_COLUMNS: &str =
  "r.source, r.source_event_id, r.division, r.athlete_source_id, r.place, r.athlete_name, r.sail_number";

fn result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRecord> {
  Ok(ResultRecord {
    source:            row.get(0)?,
    source_event_id:   row.get(1)?,
    division:          row.get(2)?,
    athlete_source_id: row.get(3)?,
    place:             row.get(4)?,
    athlete_name:      row.get(5)?,
    sail_number:       row.get(6)?,
  })
}

const SCORE_COLUMNS: &str = "s.source, s.source_event_id, s.heat_id, s.athlete_source_id, \
                             s.score_hundredths, s.score_type, s.counting, s.athlete_name, \
                             s.total_points, s.modifier";

fn score_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawScore> {
  Ok(RawScore {
    source:            row.get(0)?,
    source_event_id:   row.get(1)?,
    heat_id:           row.get(2)?,
    athlete_source_id: row.get(3)?,
    score_hundredths:  row.get(4)?,
    score_type:        row.get(5)?,
    counting:          row.get(6)?,
    athlete_name:      row.get(7)?,
    total_points:      row.get(8)?,
    modifier:          row.get(9)?,
  })
}

// ─── MergeStore impl ─────────────────────────────────────────────────────────

impl MergeStore for SqliteStore {
  type Error = Error;

  // ── Run lock ──────────────────────────────────────────────────────────────

  async fn acquire_run_lock(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<LockOutcome> {
    let run_str = encode_uuid(run_id);
    let at_str  = encode_dt(now);

    let held: Option<(String, String)> = self
      .conn
      .call(move |conn| {
        let inserted = conn.execute(
          "INSERT INTO run_lock (lock_id, run_id, acquired_at) VALUES (1, ?1, ?2)
           ON CONFLICT (lock_id) DO NOTHING",
          params![run_str, at_str],
        )?;
        if inserted == 1 {
          return Ok(None);
        }
        Ok(Some(conn.query_row(
          "SELECT run_id, acquired_at FROM run_lock WHERE lock_id = 1",
          [],
          |r| Ok((r.get(0)?, r.get(1)?)),
        )?))
      })
      .await?;

    let Some((holder, since)) = held else {
      debug!(%run_id, "run lock acquired");
      return Ok(LockOutcome::Acquired);
    };
    let holder = decode_uuid(&holder)?;
    if holder == run_id {
      return Ok(LockOutcome::Acquired);
    }
    Ok(LockOutcome::Held { holder, since: decode_dt(&since)? })
  }

  async fn release_run_lock(&self, run_id: Uuid) -> Result<()> {
    let run_str = encode_uuid(run_id);
    self
      .conn
      .call(move |conn| {
        conn.execute("DELETE FROM run_lock WHERE lock_id = 1 AND run_id = ?1", params![run_str])?;
        Ok(())
      })
      .await?;
    debug!(%run_id, "run lock released");
    Ok(())
  }

  async fn force_unlock(&self) -> Result<Option<Uuid>> {
    let holder: Option<String> = self
      .conn
      .call(|conn| {
        let holder = conn
          .query_row("SELECT run_id FROM run_lock WHERE lock_id = 1", [], |r| r.get(0))
          .optional()?;
        conn.execute("DELETE FROM run_lock", [])?;
        Ok(holder)
      })
      .await?;

    let holder = holder.as_deref().map(decode_uuid).transpose()?;
    if let Some(holder) = holder {
      warn!(%holder, "run lock forcibly cleared");
    }
    Ok(holder)
  }

  // ── Identities ────────────────────────────────────────────────────────────

  async fn athlete_for(&self, source_ref: SourceRef) -> Result<Option<UnifiedAthlete>> {
    let raw: Option<RawAthlete> = self
      .conn
      .call(move |conn| {
        match link_owner(conn, &source_ref.source, &source_ref.source_id)? {
          Some(athlete_id) => Ok(read_athlete(conn, &athlete_id)?),
          None => Ok(None),
        }
      })
      .await?;

    raw.map(RawAthlete::into_athlete).transpose()
  }

  async fn get_athlete(&self, id: Uuid) -> Result<Option<UnifiedAthlete>> {
    let id_str = encode_uuid(id);
    let raw = self
      .conn
      .call(move |conn| Ok(read_athlete(conn, &id_str)?))
      .await?;

    raw.map(RawAthlete::into_athlete).transpose()
  }

  async fn list_athletes(&self) -> Result<Vec<UnifiedAthlete>> {
    let raws: Vec<RawAthlete> = self
      .conn
      .call(|conn| {
        let ids: Vec<String> = conn
          .prepare("SELECT athlete_id FROM athletes ORDER BY created_at, athlete_id")?
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<_>>()?;

        let mut athletes = Vec::with_capacity(ids.len());
        for id in ids {
          if let Some(a) = read_athlete(conn, &id)? {
            athletes.push(a);
          }
        }
        Ok(athletes)
      })
      .await?;

    raws.into_iter().map(RawAthlete::into_athlete).collect()
  }

  async fn apply_identity(&self, plan: IdentityPlan) -> Result<Uuid> {
    let athlete_id = plan.athlete_id();

    let outcome: Result<()> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let checked: Result<()> = match &plan {
          IdentityPlan::Create(athlete) => {
            tx.execute(
              "INSERT INTO athletes (
                 athlete_id, display_name, birth_year, nationality, sail_number, created_at
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
              params![
                encode_uuid(athlete.id),
                athlete.display_name,
                athlete.birth_year,
                athlete.nationality,
                athlete.sail_number,
                encode_dt(athlete.created_at),
              ],
            )?;
            for link in &athlete.source_links {
              insert_link(&tx, link)?;
            }
            Ok(())
          }
          IdentityPlan::Attach { athlete_id, link, attributes } => {
            let id = encode_uuid(*athlete_id);
            match check_attach(&tx, *athlete_id, link)? {
              Some(Err(err)) => Err(err),
              _ if write_attributes(&tx, &id, attributes)? == 0 => {
                Err(Error::AthleteNotFound(*athlete_id))
              }
              Some(Ok(())) => {
                insert_link(&tx, link)?;
                Ok(())
              }
              None => Ok(()),
            }
          }
          IdentityPlan::Enrich { athlete_id, attributes } => {
            if write_attributes(&tx, &encode_uuid(*athlete_id), attributes)? == 0 {
              Err(Error::AthleteNotFound(*athlete_id))
            } else {
              Ok(())
            }
          }
          IdentityPlan::NoOp { .. } => Ok(()),
        };

        // Dropping an uncommitted transaction rolls the unit back.
        if checked.is_ok() {
          tx.commit()?;
        }
        Ok(checked)
      })
      .await?;

    outcome?;
    Ok(athlete_id)
  }

  // ── Events ────────────────────────────────────────────────────────────────

  async fn world_event_for(&self, source_ref: SourceRef) -> Result<Option<WorldEvent>> {
    let raw: Option<RawWorldEvent> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT w.world_event_id, w.event_key, w.name, w.start_date, w.end_date,
                    w.location, w.country, w.level, w.primary_source
             FROM world_events w
             JOIN source_events s ON s.world_event_id = w.world_event_id
             WHERE s.source = ?1 AND s.source_event_id = ?2",
            params![source_ref.source, source_ref.source_id],
            world_event_from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawWorldEvent::into_world_event).transpose()
  }

  async fn get_world_event(&self, id: Uuid) -> Result<Option<WorldEvent>> {
    let id_str = encode_uuid(id);
    let raw: Option<RawWorldEvent> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT world_event_id, event_key, name, start_date, end_date,
                    location, country, level, primary_source
             FROM world_events WHERE world_event_id = ?1",
            params![id_str],
            world_event_from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawWorldEvent::into_world_event).transpose()
  }

  async fn list_world_events(&self) -> Result<Vec<WorldEvent>> {
    let raws: Vec<RawWorldEvent> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT world_event_id, event_key, name, start_date, end_date,
                  location, country, level, primary_source
           FROM world_events ORDER BY start_date, world_event_id",
        )?;
        let rows = stmt
          .query_map([], world_event_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawWorldEvent::into_world_event).collect()
  }

  async fn world_events_overlapping(
    &self,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<WorldEvent>> {
    let (start, end) = (encode_date(start), encode_date(end));
    let raws: Vec<RawWorldEvent> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT world_event_id, event_key, name, start_date, end_date,
                  location, country, level, primary_source
           FROM world_events WHERE start_date <= ?2 AND end_date >= ?1
           ORDER BY start_date, world_event_id",
        )?;
        let rows = stmt
          .query_map(params![start, end], world_event_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawWorldEvent::into_world_event).collect()
  }

  async fn source_events_for(&self, world_event_id: Uuid) -> Result<Vec<SourceEventRecord>> {
    let id_str = encode_uuid(world_event_id);
    let raws = self
      .conn
      .call(move |conn| Ok(read_source_events(conn, &id_str)?))
      .await?;

    raws.into_iter().map(RawSourceEvent::into_record).collect()
  }

  async fn apply_event_unit(&self, unit: EventFacetUnit) -> Result<FacetUpsertReport> {
    let outcome: Result<FacetUpsertReport> = self
      .conn
      .call(move |conn| {
        let EventFacetUnit { mut world_event, members, results, heats, scores, weights } = unit;
        let id = encode_uuid(world_event.id);
        let mut report = FacetUpsertReport { world_event_id: world_event.id, ..Default::default() };

        let tx = conn.transaction()?;
        upsert_world_event(&tx, &world_event)?;
        for m in &members {
          upsert_source_event(&tx, &id, m)?;
        }
        for r in &results {
          tally(&mut report.results, upsert_result(&tx, &id, r)?);
        }
        for h in &heats {
          tally(&mut report.heats, upsert_heat(&tx, &id, h)?);
        }
        for s in &scores {
          tally(&mut report.scores, upsert_score(&tx, &id, s)?);
        }

        // Elect over everything stored for the event, not just this batch.
        let counts = facet_counts(&tx, &id)?;
        let stored: Result<Vec<SourceEventRecord>> = read_source_events(&tx, &id)?
          .into_iter()
          .map(RawSourceEvent::into_record)
          .collect();
        let stored = match stored {
          Ok(stored) => stored,
          Err(err) => return Ok(Err(err)),
        };
        finalize_world_event(&mut world_event, &stored, &counts, &weights);

        tx.execute(
          "UPDATE world_events SET primary_source = ?2, name = ?3 WHERE world_event_id = ?1",
          params![id, world_event.primary_source, world_event.name],
        )?;
        tx.commit()?;

        report.primary_source = world_event.primary_source;
        Ok(Ok(report))
      })
      .await?;

    outcome
  }

  // ── Serving reads ─────────────────────────────────────────────────────────

  async fn results_for_world_event(&self, world_event_id: Uuid) -> Result<Vec<ResultRecord>> {
    let id_str = encode_uuid(world_event_id);
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RESULT_COLUMNS} FROM results r
           WHERE r.world_event_id = ?1
           ORDER BY r.source, r.division, r.place, r.athlete_source_id"
        ))?;
        let rows = stmt
          .query_map(params![id_str], result_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn heats_for_world_event(&self, world_event_id: Uuid) -> Result<Vec<HeatRecord>> {
    let id_str = encode_uuid(world_event_id);
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT source, source_event_id, heat_id, division, round_name, round_order, heat_order
           FROM heats WHERE world_event_id = ?1
           ORDER BY source, round_order, heat_order, heat_id",
        )?;
        let rows = stmt
          .query_map(params![id_str], |row| {
            Ok(HeatRecord {
              source:          row.get(0)?,
              source_event_id: row.get(1)?,
              heat_id:         row.get(2)?,
              division:        row.get(3)?,
              round_name:      row.get(4)?,
              round_order:     row.get(5)?,
              heat_order:      row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn scores_for_world_event(&self, world_event_id: Uuid) -> Result<Vec<ScoreRecord>> {
    let id_str = encode_uuid(world_event_id);
    let raws: Vec<RawScore> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SCORE_COLUMNS} FROM scores s
           WHERE s.world_event_id = ?1
           ORDER BY s.source, s.heat_id, s.athlete_source_id, s.score_hundredths DESC"
        ))?;
        let rows = stmt
          .query_map(params![id_str], score_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawScore::into_record).collect()
  }

  async fn results_for_athlete(&self, athlete_id: Uuid) -> Result<Vec<ResultRecord>> {
    let id_str = encode_uuid(athlete_id);
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RESULT_COLUMNS} FROM results r
           JOIN source_links l ON l.source = r.source AND l.source_id = r.athlete_source_id
           WHERE l.athlete_id = ?1
           ORDER BY r.source, r.source_event_id, r.division, r.place"
        ))?;
        let rows = stmt
          .query_map(params![id_str], result_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(rows)
  }

  async fn scores_for_athlete(&self, athlete_id: Uuid) -> Result<Vec<ScoreRecord>> {
    let id_str = encode_uuid(athlete_id);
    let raws: Vec<RawScore> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SCORE_COLUMNS} FROM scores s
           JOIN source_links l ON l.source = s.source AND l.source_id = s.athlete_source_id
           WHERE l.athlete_id = ?1
           ORDER BY s.source, s.heat_id, s.score_hundredths DESC"
        ))?;
        let rows = stmt
          .query_map(params![id_str], score_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawScore::into_record).collect()
  }
}

// ─── ReviewQueue impl ────────────────────────────────────────────────────────

impl ReviewQueue for SqliteStore {
  type Error = Error;

  async fn enqueue(&self, review: NewReview) -> Result<ReviewItem> {
    let id_str     = encode_uuid(review.decision_id());
    let left_json  = serde_json::to_string(&review.left)?;
    let right_json = serde_json::to_string(&review.right)?;
    let at_str     = encode_dt(Utc::now());
    let stage      = review.stage.as_str();

    let raw = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO review_decisions (
             decision_id, left_source, left_source_id, right_source, right_source_id,
             left_json, right_json, score, stage, tied, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
           ON CONFLICT (decision_id) DO NOTHING",
          params![
            id_str,
            review.left.source,
            review.left.source_id,
            review.right.source,
            review.right.source_id,
            left_json,
            right_json,
            review.score,
            stage,
            review.tied,
            at_str,
          ],
        )?;
        Ok(read_review(conn, &id_str)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?)
      })
      .await?;

    raw.into_item()
  }

  async fn list_pending_page(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<ReviewItem>> {
    let after_str = after.map(encode_uuid);
    let limit_val = i64::try_from(limit).unwrap_or(i64::MAX);

    let raws: Vec<RawReview> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {REVIEW_COLUMNS} FROM review_decisions
           WHERE verdict IS NULL AND (?1 IS NULL OR decision_id > ?1)
           ORDER BY decision_id
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(params![after_str, limit_val], review_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawReview::into_item).collect()
  }

  async fn get_review(&self, decision_id: Uuid) -> Result<Option<ReviewItem>> {
    let id_str = encode_uuid(decision_id);
    let raw = self
      .conn
      .call(move |conn| Ok(read_review(conn, &id_str)?))
      .await?;

    raw.map(RawReview::into_item).transpose()
  }

  async fn resolve(&self, decision_id: Uuid, verdict: Verdict) -> Result<ReviewItem> {
    let id_str = encode_uuid(decision_id);
    let at_str = encode_dt(Utc::now());

    let outcome: Result<RawReview> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let Some(current) = read_review(&tx, &id_str)? else {
          return Ok(Err(wavelink_core::Error::DecisionNotFound(decision_id).into()));
        };

        if let Some(existing) = current.verdict.as_deref() {
          if existing == verdict.as_str() {
            return Ok(Ok(current));
          }
          return Ok(Err(match decode_verdict(existing) {
            Ok(stored) => {
              wavelink_core::Error::AlreadyResolved { decision_id, verdict: stored }.into()
            }
            Err(err) => err,
          }));
        }

        tx.execute(
          "UPDATE review_decisions SET verdict = ?2, resolved_at = ?3 WHERE decision_id = ?1",
          params![id_str, verdict.as_str(), at_str],
        )?;
        let updated = read_review(&tx, &id_str)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok(Ok(updated))
      })
      .await?;

    let item = outcome?.into_item()?;
    info!(%decision_id, %verdict, "review decision resolved");
    Ok(item)
  }

  async fn resolved_reviews(&self) -> Result<Vec<ReviewItem>> {
    let raws: Vec<RawReview> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {REVIEW_COLUMNS} FROM review_decisions
           WHERE verdict IS NOT NULL
           ORDER BY decision_id"
        ))?;
        let rows = stmt
          .query_map([], review_from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawReview::into_item).collect()
  }
}
