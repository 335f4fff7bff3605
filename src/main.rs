mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use offline_sync::{Config, OfflineClient, SyncAction};

#[derive(Parser, Debug)]
#[command(name = "offline-sync")]
#[command(about = "Offline-first cache, record store and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show record, queue and connectivity stats
  Stats,
  /// Queue a mutation
  Enqueue {
    #[arg(short, long, value_enum)]
    action: ActionArg,
    /// Endpoint, relative to the API base URL or absolute
    #[arg(short, long)]
    endpoint: String,
    /// JSON body
    #[arg(short, long)]
    payload: Option<String>,
    /// Offline record to mark synced once delivered
    #[arg(short, long)]
    record: Option<String>,
  },
  /// Offline records
  Record {
    #[command(subcommand)]
    command: RecordCommand,
  },
  /// Cache entries
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Drain the sync queue once
  Sync,
  /// Monitor connectivity and sync in the background until ctrl-c
  Run,
}

#[derive(Subcommand, Debug)]
enum RecordCommand {
  Add {
    /// Record type (summary, voice, user_data or any other name)
    #[arg(short = 't', long = "type")]
    record_type: String,
    /// JSON payload
    payload: String,
    /// Also queue a create of this record against the endpoint
    #[arg(long)]
    sync_to: Option<String>,
  },
  List {
    #[arg(short = 't', long = "type")]
    record_type: Option<String>,
    #[arg(long)]
    unsynced: bool,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Get {
    key: String,
  },
  Set {
    key: String,
    /// JSON value
    value: String,
    /// TTL in seconds (default from config)
    #[arg(long)]
    ttl: Option<u64>,
  },
  /// Remove expired, stale and excess entries
  Sweep,
  Clear,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ActionArg {
  Create,
  Update,
  Delete,
}

impl From<ActionArg> for SyncAction {
  fn from(action: ActionArg) -> Self {
    match action {
      ActionArg::Create => SyncAction::Create,
      ActionArg::Update => SyncAction::Update,
      ActionArg::Delete => SyncAction::Delete,
    }
  }
}

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offline_sync=info"))
}

/// Short commands log to stderr; `run` logs to a daily file instead.
fn init_tracing(to_file: bool) -> Option<WorkerGuard> {
  if to_file {
    if let Some(data_dir) = dirs::data_dir() {
      let appender = tracing_appender::rolling::daily(data_dir.join("offline-sync").join("logs"), "offline-sync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .init();
      return Some(guard);
    }
  }

  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_writer(std::io::stderr)
    .init();
  None
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(matches!(args.command, Command::Run));

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let client = OfflineClient::open(config).await?;

  match args.command {
    Command::Stats => commands::stats(&client).await?,
    Command::Enqueue {
      action,
      endpoint,
      payload,
      record,
    } => {
      commands::enqueue(&client, action.into(), &endpoint, payload.as_deref(), record.as_deref()).await?
    }
    Command::Record { command } => match command {
      RecordCommand::Add {
        record_type,
        payload,
        sync_to,
      } => commands::record_add(&client, &record_type, &payload, sync_to.as_deref()).await?,
      RecordCommand::List { record_type, unsynced } => {
        commands::record_list(&client, record_type.as_deref(), unsynced).await?
      }
    },
    Command::Cache { command } => match command {
      CacheCommand::Get { key } => commands::cache_get(&client, &key).await?,
      CacheCommand::Set { key, value, ttl } => commands::cache_set(&client, &key, &value, ttl).await?,
      CacheCommand::Sweep => commands::cache_sweep(&client).await?,
      CacheCommand::Clear => commands::cache_clear(&client).await?,
    },
    Command::Sync => commands::sync(&client).await?,
    Command::Run => commands::run(&client).await?,
  }

  Ok(())
}
