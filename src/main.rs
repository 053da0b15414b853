use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use rollbook::cache::CacheSource;
use rollbook::config::Config;
use rollbook::connectivity::{self, Connectivity, Reachability};
use rollbook::context::Context;
use rollbook::gate::MutationOutcome;
use rollbook::ident::Identifier;
use rollbook::payload::{EntityKind, MutationPayload};
use rollbook::remote::HttpRemote;
use rollbook::store::SqliteStore;
use rollbook::sync::{SingleSyncOutcome, SyncTarget};
use rollbook::App;

#[derive(Parser, Debug)]
#[command(name = "rollbook")]
#[command(about = "Record grades and assessments offline, sync them later")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rollbook/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Treat the service as unreachable without probing it
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an endpoint, falling back to the cached copy when offline
  Get { endpoint: String },
  /// Create a record
  Create {
    kind: String,
    /// Plain field, `name=value` (value parsed as JSON when possible)
    #[arg(long = "field")]
    fields: Vec<String>,
    /// Reference field, `name=ID` (ID may be a TEMP_ id)
    #[arg(long = "ref")]
    refs: Vec<String>,
  },
  /// Update a record
  Update {
    kind: String,
    id: String,
    #[arg(long = "field")]
    fields: Vec<String>,
    #[arg(long = "ref")]
    refs: Vec<String>,
  },
  /// Delete a record
  Delete { kind: String, id: String },
  /// Show everything waiting to be synced
  Pending,
  /// Drop a pending item (queue entry number or TEMP_ id)
  Discard { id: String },
  /// Sync everything, or a single pending item
  Sync { id: Option<String> },
  /// Stay running and sync whenever the service becomes reachable
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing()?;

  let store = SqliteStore::open(&config.storage_path()?)?;
  let remote = Arc::new(HttpRemote::new(&config.api, Config::api_token())?);

  let online = !args.offline && remote.reachable().await;
  let connectivity = Connectivity::new(online);
  tracing::info!(online, "Starting");

  let app = App::new(&config, Context::new(store), remote.clone(), connectivity.clone());

  match args.command {
    Command::Get { endpoint } => get(&app, &endpoint).await,
    Command::Create { kind, fields, refs } => {
      let payload = with_fields(MutationPayload::create(EntityKind::new(kind)), &fields, &refs)?;
      mutate(&app, payload).await
    }
    Command::Update {
      kind,
      id,
      fields,
      refs,
    } => {
      let target = Identifier::parse(&id)?;
      let payload = with_fields(
        MutationPayload::update(EntityKind::new(kind), target),
        &fields,
        &refs,
      )?;
      mutate(&app, payload).await
    }
    Command::Delete { kind, id } => {
      let target = Identifier::parse(&id)?;
      mutate(&app, MutationPayload::delete(EntityKind::new(kind), target)).await
    }
    Command::Pending => pending(&app).await,
    Command::Discard { id } => {
      let target: SyncTarget = id.parse()?;
      app.discard(&target).await?;
      println!("Discarded {}", target);
      Ok(())
    }
    Command::Sync { id } => sync(&app, id.as_deref()).await,
    Command::Watch => {
      let interval = Duration::from_secs(config.probe_interval_secs);
      let probe = connectivity::spawn_probe(connectivity, remote, interval);
      let auto_sync = app.spawn_auto_sync();
      if online {
        sync(&app, None).await?;
      }
      println!("Watching for connectivity changes, Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
      probe.abort();
      auto_sync.abort();
      Ok(())
    }
  }
}

/// Log to a daily file under the data directory so stdout stays readable.
fn init_tracing() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("rollbook")
    .join("logs");

  let appender = tracing_appender::rolling::daily(log_dir, "rollbook.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_env("ROLLBOOK_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn with_fields(
  mut payload: MutationPayload,
  fields: &[String],
  refs: &[String],
) -> Result<MutationPayload> {
  for field in fields {
    let (name, raw) = split_assignment(field)?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    payload = payload.with_value(name, value);
  }
  for reference in refs {
    let (name, raw) = split_assignment(reference)?;
    payload = payload.with_ref(name, Identifier::parse(raw)?);
  }
  Ok(payload)
}

fn split_assignment(arg: &str) -> Result<(&str, &str)> {
  arg
    .split_once('=')
    .filter(|(name, _)| !name.is_empty())
    .ok_or_else(|| eyre!("Expected name=value, got {:?}", arg))
}

async fn get(app: &App, endpoint: &str) -> Result<()> {
  let result = app.gate().get(endpoint).await?;
  match result.source {
    CacheSource::Network => {}
    CacheSource::Offline => {
      if let Some(at) = result.cached_at {
        eprintln!("offline: showing cached response from {}", at.format("%Y-%m-%d %H:%M"));
      }
    }
    CacheSource::Unavailable => eprintln!("offline: nothing cached for {}", endpoint),
  }
  println!("{}", serde_json::to_string_pretty(&result.data)?);
  Ok(())
}

async fn mutate(app: &App, payload: MutationPayload) -> Result<()> {
  let outcome = match app.gate().mutate(payload).await? {
    MutationOutcome::Failed { error, payload } => {
      eprintln!("The server did not accept this change: {}", error);
      if !confirm("Keep it in the pending queue and retry later?")? {
        return Err(eyre!("Change not saved"));
      }
      app.gate().enqueue_fallback(payload).await?
    }
    other => other,
  };

  match outcome {
    MutationOutcome::Sent(body) => println!("{}", serde_json::to_string_pretty(&body)?),
    MutationOutcome::Queued(id) => println!("Queued as {} (will sync when online)", id),
    MutationOutcome::CreatedLocally(id) => {
      println!("Created offline as {} (usable in --ref until synced)", id)
    }
    MutationOutcome::Failed { error, .. } => return Err(error.into()),
  }
  Ok(())
}

fn confirm(question: &str) -> Result<bool> {
  print!("{} [y/N] ", question);
  std::io::stdout().flush()?;
  let mut answer = String::new();
  std::io::stdin().lock().read_line(&mut answer)?;
  Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn pending(app: &App) -> Result<()> {
  let pending = app.pending().await?;
  println!(
    "{} pending ({} queued, {} created offline); {} cached endpoints",
    pending.count(),
    pending.entries.len(),
    pending.temporaries.len(),
    app.cache().len().await?
  );

  for entity in &pending.temporaries {
    println!(
      "  {:<22} create {:<14} attempts={} {}",
      entity.temporary_id,
      entity.kind,
      entity.attempts,
      entity.last_error.as_deref().unwrap_or("")
    );
  }
  for entry in &pending.entries {
    let target = entry
      .payload
      .target
      .as_ref()
      .map(|t| format!(" {}", t))
      .unwrap_or_default();
    println!(
      "  {:<22} {:?} {}{} attempts={} {}",
      entry.id,
      entry.payload.operation,
      entry.payload.kind,
      target,
      entry.attempts,
      entry.last_error.as_deref().unwrap_or("")
    );
  }
  Ok(())
}

async fn sync(app: &App, id: Option<&str>) -> Result<()> {
  match id {
    None => {
      let report = app.sync_now().await?;
      println!("Sync finished: {}", report);
      for (temporary, real) in &report.resolved {
        println!("  {} -> {}", temporary, real);
      }
    }
    Some(id) => {
      let target: SyncTarget = id.parse()?;
      match app.sync_one(&target).await? {
        SingleSyncOutcome::Entry(_) => println!("Synced {}", target),
        SingleSyncOutcome::Temporary(real) => println!("Synced {} as {}", target, real),
      }
    }
  }
  Ok(())
}
