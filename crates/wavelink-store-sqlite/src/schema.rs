//! SQL schema for the wavelink SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- At most one row: the run currently merging into this store.
CREATE TABLE IF NOT EXISTS run_lock (
    lock_id     INTEGER PRIMARY KEY CHECK (lock_id = 1),
    run_id      TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);

-- ── Identities ─────────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS athletes (
    athlete_id   TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    birth_year   INTEGER,
    nationality  TEXT,
    sail_number  TEXT,
    created_at   TEXT NOT NULL
);

-- One source identity belongs to exactly one athlete; an athlete holds at
-- most one identity per source.
CREATE TABLE IF NOT EXISTS source_links (
    source      TEXT NOT NULL,
    source_id   TEXT NOT NULL,
    athlete_id  TEXT NOT NULL REFERENCES athletes(athlete_id),
    match_stage TEXT,              -- 'exact_name' | 'birth_year' | 'nationality'
    match_score REAL,
    PRIMARY KEY (source, source_id),
    UNIQUE (athlete_id, source)
);

CREATE TABLE IF NOT EXISTS review_decisions (
    decision_id     TEXT PRIMARY KEY,   -- UUIDv5 of the candidate pair
    left_source     TEXT NOT NULL,
    left_source_id  TEXT NOT NULL,
    right_source    TEXT NOT NULL,
    right_source_id TEXT NOT NULL,
    left_json       TEXT NOT NULL,      -- raw CandidateIdentity
    right_json      TEXT NOT NULL,
    score           REAL NOT NULL,
    stage           TEXT NOT NULL,
    tied            INTEGER NOT NULL DEFAULT 0,
    verdict         TEXT CHECK (verdict IN ('accept', 'reject')),  -- NULL while pending
    created_at      TEXT NOT NULL,
    resolved_at     TEXT
);

-- ── Events ─────────────────────────────────────────────────────────────────

-- world_event_id is fixed at first assignment; primary_source is a
-- provenance label and never a join key.
CREATE TABLE IF NOT EXISTS world_events (
    world_event_id TEXT PRIMARY KEY,
    event_key      TEXT NOT NULL,
    name           TEXT NOT NULL,
    start_date     TEXT NOT NULL,
    end_date       TEXT NOT NULL,
    location       TEXT,
    country        TEXT,
    level          INTEGER,
    primary_source TEXT
);

CREATE TABLE IF NOT EXISTS source_events (
    source          TEXT NOT NULL,
    source_event_id TEXT NOT NULL,
    world_event_id  TEXT NOT NULL REFERENCES world_events(world_event_id),
    name            TEXT NOT NULL,
    start_date      TEXT NOT NULL,
    end_date        TEXT NOT NULL,
    location        TEXT,
    country         TEXT,
    level           INTEGER,
    PRIMARY KEY (source, source_event_id)
);

CREATE TABLE IF NOT EXISTS results (
    source            TEXT NOT NULL,
    source_event_id   TEXT NOT NULL,
    division          TEXT NOT NULL,
    athlete_source_id TEXT NOT NULL,
    place             INTEGER NOT NULL,
    world_event_id    TEXT NOT NULL REFERENCES world_events(world_event_id),
    athlete_name      TEXT,
    sail_number       TEXT,
    PRIMARY KEY (source, source_event_id, division, athlete_source_id, place)
);

CREATE TABLE IF NOT EXISTS heats (
    source          TEXT NOT NULL,
    heat_id         TEXT NOT NULL,
    source_event_id TEXT NOT NULL,
    world_event_id  TEXT NOT NULL REFERENCES world_events(world_event_id),
    division        TEXT,
    round_name      TEXT,
    round_order     INTEGER,
    heat_order      INTEGER,
    PRIMARY KEY (source, heat_id)
);

-- Scores compare at two-decimal precision: stored as integer hundredths.
CREATE TABLE IF NOT EXISTS scores (
    source            TEXT NOT NULL,
    heat_id           TEXT NOT NULL,
    athlete_source_id TEXT NOT NULL,
    score_hundredths  INTEGER NOT NULL CHECK (score_hundredths >= 0),
    score_type        TEXT NOT NULL,   -- 'wave' | 'jump' | 'other'
    counting          INTEGER NOT NULL,
    source_event_id   TEXT NOT NULL,
    world_event_id    TEXT NOT NULL REFERENCES world_events(world_event_id),
    athlete_name      TEXT,
    total_points      REAL,
    modifier          TEXT,
    PRIMARY KEY (source, heat_id, athlete_source_id, score_hundredths, score_type, counting)
);

CREATE INDEX IF NOT EXISTS links_athlete_idx        ON source_links(athlete_id);
CREATE INDEX IF NOT EXISTS review_pending_idx       ON review_decisions(verdict, decision_id);
CREATE INDEX IF NOT EXISTS source_events_world_idx  ON source_events(world_event_id);
CREATE INDEX IF NOT EXISTS results_world_idx        ON results(world_event_id);
CREATE INDEX IF NOT EXISTS heats_world_idx          ON heats(world_event_id);
CREATE INDEX IF NOT EXISTS scores_world_idx         ON scores(world_event_id);
CREATE INDEX IF NOT EXISTS results_athlete_idx      ON results(source, athlete_source_id);
CREATE INDEX IF NOT EXISTS scores_athlete_idx       ON scores(source, athlete_source_id);

PRAGMA user_version = 1;
";
