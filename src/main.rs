use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use offsync::config::Config;
use offsync::connectivity::HttpProbe;
use offsync::db::{SqliteStore, Store};
use offsync::http::HttpClient;
use offsync::outbox::{DeadLetter, DrainReport, OperationStatus, QueuedOperation};
use offsync::{EngineConfig, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline response cache and write-behind outbox for a REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the queue database (overrides storage.path)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queue size and API reachability
  Status,
  /// List queued operations
  List {
    /// Only operations of this type
    #[arg(short = 't', long = "type")]
    op_type: Option<String>,
  },
  /// Queue an operation, replaying it right away if the API is reachable
  Enqueue {
    /// Operation type, as configured under `routes`
    op_type: String,
    /// JSON payload
    payload: String,
  },
  /// Cancel a queued operation
  Remove { id: String },
  /// Replay queued operations if the API is reachable
  Drain,
  /// Poll the API and replay the queue every time it comes back
  Watch,
  /// GET an endpoint through the response cache
  Fetch {
    endpoint: String,
    /// Query params as KEY=VALUE
    params: Vec<String>,
    /// Also keep the returned object(s) as cached entities of this type
    #[arg(long, value_name = "TYPE")]
    store_as: Option<String>,
    /// Field holding each entity's id
    #[arg(long, default_value = "id")]
    id_field: String,
  },
  /// List cached entities of a type
  Entities { entity_type: String },
  /// Drop cached entities
  ClearEntities {
    /// Only entities of this type
    #[arg(short = 't', long = "type")]
    entity_type: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = setup_logging(args.verbose);

  let config = Config::load(args.config.as_deref())?;

  let store = match args.db.as_ref().or(config.storage.path.as_ref()) {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  };
  let store = Arc::new(store);

  let client = HttpClient::new(&config.api)?;
  let registry = client.apply_registry(&config.routes);
  let engine = SyncEngine::new(
    Arc::clone(&store),
    registry,
    EngineConfig::from(&config),
    false,
  )?;

  match args.command {
    Command::Status => {
      let online = client.is_reachable().await;
      let ops = engine.operations()?;
      println!("API:     {}", if online { "reachable" } else { "unreachable" });
      println!("Pending: {}", ops.len());
      for status in [
        OperationStatus::Pending,
        OperationStatus::Syncing,
        OperationStatus::Failed,
      ] {
        let count = ops.iter().filter(|op| op.status == status).count();
        if count > 0 {
          println!("  {:<8} {}", status, count);
        }
      }
    }
    Command::List { op_type } => {
      let ops = match op_type {
        Some(t) => store.list_operations_by_type(&t)?,
        None => engine.operations()?,
      };
      print_operations(&ops);
    }
    Command::Enqueue { op_type, payload } => {
      if !config.routes.contains_key(&op_type) {
        return Err(eyre!("No route configured for operation type '{}'", op_type));
      }
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;

      // Queue while offline so the write is durable before any network call
      let id = engine.queue_operation(&op_type, payload).await?;
      println!("Queued {}", id);

      if let Some(report) = engine.set_online(client.is_reachable().await).await? {
        print_report(&report);
      }
      print_dead_letters(&engine.take_dead_letters());
    }
    Command::Remove { id } => {
      if engine.remove_from_queue(&id)? {
        println!("Removed {}", id);
      } else {
        return Err(eyre!("No queued operation with id {}", id));
      }
    }
    Command::Drain => {
      match engine.set_online(client.is_reachable().await).await? {
        Some(report) => print_report(&report),
        None => println!(
          "API unreachable, {} operation(s) remain queued",
          engine.pending_count()?
        ),
      }
      print_dead_letters(&engine.take_dead_letters());
    }
    Command::Watch => {
      let interval = Duration::from_secs(config.connectivity.probe_interval_secs);
      let probe = HttpProbe::new(client.clone(), interval);
      println!(
        "Watching {} every {}s, {} operation(s) queued (Ctrl-C to stop)",
        config.api.base_url,
        interval.as_secs(),
        engine.pending_count()?
      );

      tokio::select! {
        _ = engine.watch_connectivity(probe) => {}
        _ = tokio::signal::ctrl_c() => {}
      }

      println!("{} operation(s) remain queued", engine.pending_count()?);
      print_dead_letters(&engine.take_dead_letters());
    }
    Command::Fetch {
      endpoint,
      params,
      store_as,
      id_field,
    } => {
      let params = parse_params(&params)?;
      let refs: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

      let value = engine
        .cache()
        .fetch(&endpoint, &refs, || {
          let client = client.clone();
          let endpoint = endpoint.clone();
          let params = params.clone();
          async move {
            let refs: Vec<(&str, &str)> = params
              .iter()
              .map(|(k, v)| (k.as_str(), v.as_str()))
              .collect();
            client.get_json(&endpoint, &refs).await
          }
        })
        .await?;

      println!("{}", serde_json::to_string_pretty(&value)?);

      if let Some(entity_type) = store_as {
        let written = engine.entities().put_all(&entity_type, &id_field, &value)?;
        eprintln!("Stored {} {} entit{}", written, entity_type, if written == 1 { "y" } else { "ies" });
      }
    }
    Command::Entities { entity_type } => {
      let entities = engine.entities().list(&entity_type)?;
      println!("{}", serde_json::to_string_pretty(&entities)?);
    }
    Command::ClearEntities { entity_type } => {
      let removed = engine.entities().clear(entity_type.as_deref())?;
      println!("Removed {} entit{}", removed, if removed == 1 { "y" } else { "ies" });
    }
  }

  Ok(())
}

fn setup_logging(verbose: bool) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let log_dir = dirs::data_dir().map(|d| d.join("offsync").join("logs"));
  match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
    Some(dir) => {
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "offsync.log"));
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
      Some(guard)
    }
    None => {
      // No data dir: stderr is the only place left to log
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      None
    }
  }
}

fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>> {
  raw
    .iter()
    .map(|pair| {
      pair
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| eyre!("Expected KEY=VALUE, got '{}'", pair))
    })
    .collect()
}

fn print_operations(ops: &[QueuedOperation]) {
  if ops.is_empty() {
    println!("Queue is empty");
    return;
  }
  for op in ops {
    let created = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(op.timestamp)
      .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
      .unwrap_or_default();
    print!(
      "{}  {:<20} {:<9} retries={} {}",
      op.id, op.op_type, op.status, op.retries, created
    );
    match &op.last_error {
      Some(err) => println!("  ({})", err),
      None => println!(),
    }
  }
}

fn print_report(report: &DrainReport) {
  if report.skipped {
    println!("Another drain is already running");
    return;
  }
  println!(
    "Applied {}, failed {}, dead-lettered {}",
    report.applied.len(),
    report.failed.len(),
    report.dead_lettered.len()
  );
}

fn print_dead_letters(letters: &[DeadLetter]) {
  for letter in letters {
    eprintln!(
      "Gave up on {} ({}) after {} attempts: {}",
      letter.operation.id, letter.operation.op_type, letter.operation.retries, letter.error
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_params() {
    let parsed = parse_params(&["page=2".to_string(), "q=a=b".to_string()]).unwrap();
    assert_eq!(
      parsed,
      vec![
        ("page".to_string(), "2".to_string()),
        ("q".to_string(), "a=b".to_string())
      ]
    );
    assert!(parse_params(&["broken".to_string()]).is_err());
  }

  #[test]
  fn test_args_parse() {
    let args = Args::try_parse_from(["offsync", "--db", "/tmp/q.db", "list", "--type", "sale"]).unwrap();
    assert_eq!(args.db, Some(PathBuf::from("/tmp/q.db")));
    assert!(matches!(args.command, Command::List { op_type: Some(ref t) } if t == "sale"));
  }

  #[test]
  fn test_fetch_args() {
    let args = Args::try_parse_from(["offsync", "fetch", "/products", "page=1", "--store-as", "product"]).unwrap();
    match args.command {
      Command::Fetch {
        endpoint,
        params,
        store_as,
        id_field,
      } => {
        assert_eq!(endpoint, "/products");
        assert_eq!(params, vec!["page=1".to_string()]);
        assert_eq!(store_as.as_deref(), Some("product"));
        assert_eq!(id_field, "id");
      }
      other => panic!("unexpected command: {:?}", other),
    }
  }
}
