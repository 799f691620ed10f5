mod cache;
mod config;
mod db;
mod error;
mod event;
mod http;
mod logging;
mod queue;
#[cfg(test)]
mod testing;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::CacheSource;
use crate::config::Config;
use crate::db::Database;
use crate::event::{Event, EventHandler};
use crate::http::{HttpNetwork, Network, Request};
use crate::queue::{ActionPayload, QueueStore};
use crate::worker::{MessageReply, Outcome, ServiceWorker, SyncReport, SyncSignal, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "offline-relay")]
#[command(about = "Offline request queueing and replay for a web app origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-relay/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell for the configured generation
  Install {
    /// Activate right after a successful install
    #[arg(long)]
    skip_waiting: bool,
  },
  /// Activate an installed generation and evict older caches
  Activate,
  /// Send a request through the relay
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    #[arg(short, long)]
    data: Option<String>,
    /// Header as "Name: value"; repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Exit with an error on a 4xx/5xx response
    #[arg(short, long)]
    fail: bool,
  },
  /// Inspect or edit the outbound queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Replay queued actions now, using the token from OFFLINE_RELAY_TOKEN
  Flush,
  /// List caches and their entry counts
  Caches,
  /// Run the relay: probe connectivity, read control messages from stdin,
  /// replay on reconnect
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  Clear,
  /// Enqueue an action given as JSON: {"url": "...", "method": "...", "body": "..."}
  Add { payload: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.log);

  let db_path = match &config.database {
    Some(path) => path.clone(),
    None => Database::default_path()?,
  };
  let db = Arc::new(Database::open(&db_path)?);
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.request_timeout())?);
  let (worker, signals) = ServiceWorker::new(&config, db, Arc::clone(&network))?;
  worker.credentials().set(Config::get_api_token());

  match args.command {
    Command::Install { skip_waiting } => {
      let count = worker.install().await?;
      println!("installed {} ({} entries)", worker.generation(), count);
      if skip_waiting {
        print_evicted(&worker.skip_waiting()?);
      }
    }
    Command::Activate => {
      if worker.state() == WorkerState::Parsed {
        worker.install().await?;
      }
      print_evicted(&worker.activate()?);
    }
    Command::Fetch {
      url,
      method,
      data,
      headers,
      fail,
    } => {
      let request = build_request(&config, &url, &method, data, &headers)?;
      let outcome = worker.fetch(&request).await?;
      if let Outcome::Response(result) = &outcome {
        if result.source == CacheSource::Offline {
          warn!(cached_at = ?result.cached_at, "network unavailable, served from cache");
        }
      }
      let response = outcome.into_response();
      worker.cache().settle().await;
      println!("{}", response.status);
      println!("{}", response.text());
      if fail {
        response.error_for_status(&request.url)?;
      }
    }
    Command::Queue { command } => match command {
      QueueCommand::List => {
        for action in worker.queue().drain()? {
          let action = action?;
          println!(
            "{}\t{}\t{}\t{}",
            action.id,
            action.enqueued_at.to_rfc3339(),
            action.method,
            action.url
          );
        }
      }
      QueueCommand::Clear => {
        println!("cleared {} queued actions", worker.queue().clear()?);
      }
      QueueCommand::Add { payload } => {
        let payload: ActionPayload = serde_json::from_str(&payload)?;
        let action = worker.queue_action(payload)?;
        println!("queued {}", action.id);
      }
    },
    Command::Flush => {
      let report = worker.sync_trigger().run_pass().await?;
      print_report(&report);
      if let Some(halt) = report.halted {
        return Err(eyre!("replay halted at action {}: {}", halt.id, halt.error));
      }
    }
    Command::Caches => {
      for name in worker.cache().cache_names()? {
        println!("{}\t{}", name, worker.cache().entries(&name)?.len());
      }
    }
    Command::Watch => watch(&config, worker, signals, network).await?,
  }

  Ok(())
}

async fn watch(
  config: &Config,
  worker: ServiceWorker,
  signals: mpsc::UnboundedReceiver<SyncSignal>,
  network: Arc<dyn Network>,
) -> Result<()> {
  match worker.start().await {
    Ok(evicted) => print_evicted(&evicted),
    Err(e) => warn!(error = %e, "install failed; previous generation stays active"),
  }
  if worker.state() == WorkerState::Installed {
    info!(generation = worker.generation(), "installed, waiting for SKIP_WAITING");
  }

  let (report_tx, mut reports) = mpsc::unbounded_channel();
  tokio::spawn(worker.sync_trigger().run(signals, report_tx));

  let mut events = EventHandler::new();
  events.spawn_connectivity_probe(network, config.probe_url()?, config.probe_interval());
  events.spawn_stdin_reader();
  // Replay anything left over from a previous run.
  worker.signal(SyncSignal::Flush);

  loop {
    tokio::select! {
      event = events.next() => match event {
        Some(Event::Message(message)) => match worker.handle_message(message) {
          Ok(MessageReply::Queued(action)) => println!("queued {}", action.id),
          Ok(MessageReply::Activated(evicted)) => print_evicted(&evicted),
          Ok(MessageReply::Ack) => {}
          Err(e) => warn!(error = %e, "control message failed"),
        },
        Some(Event::Online) => {
          info!("connectivity restored");
          worker.signal(SyncSignal::ConnectivityRestored);
        }
        Some(Event::Offline) => info!("connectivity lost"),
        None => break,
      },
      Some(report) = reports.recv() => print_report(&report),
      _ = tokio::signal::ctrl_c() => {
        info!("shutting down");
        break;
      }
    }
  }

  Ok(())
}

fn build_request(
  config: &Config,
  url: &str,
  method: &str,
  data: Option<String>,
  headers: &[String],
) -> Result<Request> {
  let url = config.origin.join(url)?;
  let method = Method::from_bytes(method.to_uppercase().as_bytes())?;
  let mut request = Request::new(method, url);
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Header must be \"Name: value\", got {}", header))?;
    request = request.with_header(name.trim(), value.trim())?;
  }
  if let Some(data) = data {
    request = request.with_body(data);
  }
  Ok(request)
}

fn print_evicted(evicted: &[String]) {
  for name in evicted {
    println!("evicted {}", name);
  }
}

fn print_report(report: &SyncReport) {
  println!(
    "replayed {}, rejected {}, expired {}, remaining {}",
    report.replayed.len(),
    report.rejected.len(),
    report.expired.len(),
    report.remaining
  );
  for rejected in &report.rejected {
    println!("rejected {} {}: {}", rejected.id, rejected.url, rejected.reason);
  }
  if report.is_complete() && report.remaining == 0 {
    println!("queue empty");
  }
  if let Some(halt) = &report.halted {
    if halt.needs_token() {
      println!("halted at {}: set a fresh token with SET_TOKEN", halt.id);
    }
  }
}
