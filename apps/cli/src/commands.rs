//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use crawltail_core::{EventSink, OutboundEvent, Session};
use crawltail_query::{IdRef, SourceCursor};
use crawltail_shared::{
    AppConfig, Collection, TailConfig, init_config, load_config, load_config_from,
};
use crawltail_storage::{DocumentStore, SqlStore};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// crawltail: follow crawl jobs and scraped pages as they are written.
#[derive(Parser)]
#[command(
    name = "crawltail",
    version,
    about = "Tail crawl jobs and scraped pages from a document store as JSON lines.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.crawltail/crawltail.toml.
    #[arg(long, global = true, env = "CRAWLTAIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file (overrides `storage.database_path`).
    #[arg(long, global = true, env = "CRAWLTAIL_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Follow a collection until interrupted.
    Tail {
        #[command(subcommand)]
        target: TailTarget,

        /// Batch delivered events and flush every N milliseconds (0 = immediate).
        #[arg(long, default_value = "0", global = true)]
        delay_ms: u64,

        /// Idle interval between polls when nothing is new.
        #[arg(long, global = true)]
        idle_ms: Option<u64>,

        /// Pause after each delivered document.
        #[arg(long, global = true)]
        fetch_delay_ms: Option<u64>,
    },

    /// Insert one JSON document and print its id.
    Insert {
        /// Collection: jobs or pages.
        collection: Collection,

        /// Document body as a JSON object.
        json: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// What to tail.
#[derive(Subcommand)]
pub(crate) enum TailTarget {
    /// Crawl jobs filtered by their URLs.
    Jobs {
        /// Pattern every followed job URL must match (repeatable).
        #[arg(long)]
        include: Vec<String>,

        /// Pattern no followed job URL may match (repeatable).
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Scraped pages, resumed per source.
    Pages {
        /// Source to follow as KEY=ID[@FIELD], e.g. `http://a.com=ObjectId(12)@url`.
        #[arg(long = "source", value_parser = parse_source)]
        sources: Vec<(String, SourceCursor)>,
    },
}

/// Configuration subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Parse `KEY=ID[@FIELD]` into a page source cursor.
fn parse_source(raw: &str) -> std::result::Result<(String, SourceCursor), String> {
    let (key, cursor) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected KEY=ID[@FIELD], got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty source key in '{raw}'"));
    }
    let (id, url_field) = match cursor.split_once('@') {
        Some((id, field)) => (id, Some(field.to_string())),
        None => (cursor, None),
    };
    let id = IdRef::Text(id.trim().to_string());
    id.resolve().map_err(|e| e.to_string())?;
    Ok((key.to_string(), SourceCursor::Full { id, url_field }))
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "crawltail=info",
        1 => "crawltail=debug",
        _ => "crawltail=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    // stdout carries events, so logs go to stderr.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let db_path = match cli.db {
        Some(path) => path,
        None => config.database_path()?,
    };

    match cli.command {
        Command::Tail {
            target,
            delay_ms,
            idle_ms,
            fetch_delay_ms,
        } => {
            let mut tail_config = TailConfig::from(&config);
            if let Some(ms) = idle_ms {
                tail_config.idle_interval = Duration::from_millis(ms);
            }
            if let Some(ms) = fetch_delay_ms {
                tail_config.fetch_delay = Duration::from_millis(ms);
            }
            cmd_tail(db_path, target, delay_ms, tail_config).await
        }
        Command::Insert { collection, json } => cmd_insert(db_path, collection, &json).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// Writes each event to stdout as one JSON line.
struct StdoutSink;

impl EventSink for StdoutSink {
    fn write_event(&self, event: OutboundEvent) {
        let mut out = std::io::stdout().lock();
        let written = serde_json::to_writer(&mut out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            warn!(event = %event.event, error = %e, "failed to write event");
        }
    }
}

/// Open an existing database for tailing. Tailing never writes or migrates.
async fn open_for_tail(db_path: &Path) -> Result<SqlStore> {
    if !db_path.exists() {
        return Err(eyre!(
            "no database at {}; insert a document first",
            db_path.display()
        ));
    }
    Ok(SqlStore::open_readonly(db_path).await?)
}

async fn cmd_tail(
    db_path: PathBuf,
    target: TailTarget,
    delay_ms: u64,
    config: TailConfig,
) -> Result<()> {
    let store = Arc::new(open_for_tail(&db_path).await?);
    let mut session = Session::new(store, Arc::new(StdoutSink), config);

    let handle = match target {
        TailTarget::Jobs { include, exclude } => {
            session.subscribe_to_jobs(include, exclude, delay_ms)?
        }
        TailTarget::Pages { sources } => {
            let sources: BTreeMap<String, SourceCursor> = sources.into_iter().collect();
            session.subscribe_to_pages(sources, delay_ms)?
        }
    };
    info!(db = %db_path.display(), %handle, "tailing, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for ctrl-c: {e}"))?;

    // Only documents already written to stdout count as seen.
    let watermarks = session.watermarks();
    session.close();
    for (handle, watermark) in watermarks {
        match watermark {
            Some(id) => info!(%handle, resume_from = %id.to_literal(), "stopped"),
            None => info!(%handle, "stopped before any document"),
        }
    }
    Ok(())
}

async fn cmd_insert(db_path: PathBuf, collection: Collection, json: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| eyre!("invalid JSON document: {e}"))?;
    let serde_json::Value::Object(body) = value else {
        return Err(eyre!("document must be a JSON object"));
    };

    let store = SqlStore::open(&db_path).await?;
    let id = store.insert(collection, body).await?;
    println!("{}", id.to_literal());
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
