//! `wavelink`: command-line front end for the athlete/event merge engine.
//!
//! # Usage
//!
//! ```
//! wavelink merge --input extracted.jsonl
//! wavelink review list --page-size 20
//! wavelink review resolve 3f0c…e1 accept
//! wavelink --config wavelink.toml unlock
//! ```
//!
//! Configuration is read from a TOML file (default `wavelink.toml`, optional)
//! and `WAVELINK_*` environment variables; nested keys use `__`, e.g.
//! `WAVELINK_MERGE__LEFT_SOURCE=liveheats`.

use std::{
  io::{self, BufRead, BufReader, Read},
  path::{Path, PathBuf},
};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wavelink_core::{
  config::MergeConfig,
  engine::MergeEngine,
  model::{ExtractedRecord, ExtractionBatch},
  review::{ReviewQueue, Verdict},
  store::MergeStore,
};
use wavelink_store_sqlite::SqliteStore;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wavelink", version, about = "Cross-source athlete and event merge engine")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, value_name = "FILE", default_value = "wavelink.toml")]
  config: PathBuf,

  /// SQLite database path; overrides `store_path` from the config.
  #[arg(long, value_name = "FILE")]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Merge one extraction run (JSON lines, `-` for stdin) and print the report.
  Merge {
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,
  },
  /// Inspect and adjudicate the review queue.
  Review {
    #[command(subcommand)]
    action: ReviewAction,
  },
  /// List unified athletes.
  Athletes,
  /// List world events.
  Events,
  /// Row counts per table.
  Status,
  /// Clear a run lock left behind by a crashed run.
  Unlock,
}

#[derive(Subcommand, Debug)]
enum ReviewAction {
  /// Print pending decisions, one JSON object per line.
  List {
    #[arg(long, default_value_t = 50)]
    page_size: usize,
    /// Resume after this decision id.
    #[arg(long)]
    after: Option<Uuid>,
  },
  Show { decision_id: Uuid },
  Resolve {
    decision_id: Uuid,
    #[arg(value_enum)]
    verdict: VerdictArg,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VerdictArg {
  Accept,
  Reject,
}

impl From<VerdictArg> for Verdict {
  fn from(v: VerdictArg) -> Self {
    match v {
      VerdictArg::Accept => Verdict::Accept,
      VerdictArg::Reject => Verdict::Reject,
    }
  }
}

// ─── Config file ─────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
#[serde(default)]
struct AppConfig {
  store_path: PathBuf,
  merge:      MergeConfig,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self { store_path: PathBuf::from("wavelink.db"), merge: MergeConfig::default() }
  }
}

fn load_config(path: &Path) -> Result<AppConfig> {
  let settings = config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(config::Environment::with_prefix("WAVELINK").separator("__").try_parsing(true))
    .build()
    .with_context(|| format!("failed to read config from {}", path.display()))?;

  settings.try_deserialize().context("failed to deserialise config")
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = load_config(&cli.config)?;
  let store_path = expand_tilde(cli.db.as_deref().unwrap_or(cfg.store_path.as_path()));

  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {}", store_path.display()))?;

  match cli.command {
    Command::Merge { input } => {
      let batch = read_batch(&input)?;
      let engine = MergeEngine::new(store, cfg.merge).context("invalid merge config")?;
      let report = engine.run(batch).await.context("merge run failed")?;
      print_json(&report)?;
    }
    Command::Review { action } => review(&store, action).await?,
    Command::Athletes => {
      for athlete in store.list_athletes().await? {
        println!("{}", serde_json::to_string(&athlete)?);
      }
    }
    Command::Events => {
      for event in store.list_world_events().await? {
        println!("{}", serde_json::to_string(&event)?);
      }
    }
    Command::Status => print_json(&store.table_counts().await?)?,
    Command::Unlock => match store.force_unlock().await? {
      Some(holder) => println!("cleared run lock held by {holder}"),
      None => println!("no run lock held"),
    },
  }

  Ok(())
}

async fn review(store: &SqliteStore, action: ReviewAction) -> Result<()> {
  match action {
    ReviewAction::List { page_size, after } => {
      let mut pending = store.list_pending(page_size);
      if let Some(after) = after {
        pending = pending.starting_after(after);
      }
      while let Some(item) = pending.next().await? {
        println!("{}", serde_json::to_string(&item)?);
      }
    }
    ReviewAction::Show { decision_id } => match store.get_review(decision_id).await? {
      Some(item) => print_json(&item)?,
      None => bail!("review decision not found: {decision_id}"),
    },
    ReviewAction::Resolve { decision_id, verdict } => {
      let item = store.resolve(decision_id, verdict.into()).await?;
      print_json(&item)?;
    }
  }
  Ok(())
}

// ─── Input ───────────────────────────────────────────────────────────────────

/// Read a JSON-lines extraction file. Blank lines are skipped; any malformed
/// line aborts before the run starts.
fn read_batch(path: &Path) -> Result<ExtractionBatch> {
  let reader: Box<dyn Read> = if path == Path::new("-") {
    Box::new(io::stdin())
  } else {
    Box::new(
      std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
    )
  };

  let mut batch = ExtractionBatch::default();
  for (index, line) in BufReader::new(reader).lines().enumerate() {
    let line = line.with_context(|| format!("failed to read {}", path.display()))?;
    if line.trim().is_empty() {
      continue;
    }
    let record: ExtractedRecord = serde_json::from_str(&line)
      .with_context(|| format!("{}:{}: malformed record", path.display(), index + 1))?;
    batch.push(record);
  }
  Ok(batch)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
