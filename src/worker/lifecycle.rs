//! Worker lifecycle and the page-facing surface.
//!
//! A worker for a new generation installs (precaches) while the previously
//! active generation keeps serving. Activation evicts older caches, records
//! the generation, and takes over request handling immediately.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::interceptor::{Interceptor, Outcome};
use super::messages::ControlMessage;
use super::sync::{SyncSignal, SyncTrigger};
use crate::cache::{static_cache, CacheManager, CacheResult, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::http::{CredentialStore, Network, Request};
use crate::queue::{ActionPayload, NewAction, QueuedAction, SqliteQueue};

const ACTIVE_GENERATION_KEY: &str = "active_generation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Installation failed; this generation will never activate
  Redundant,
}

/// Reply to a control message.
#[derive(Debug)]
pub enum MessageReply {
  Ack,
  /// Names of caches deleted by activation
  Activated(Vec<String>),
  Queued(QueuedAction),
}

pub struct ServiceWorker {
  db: Arc<Database>,
  network: Arc<dyn Network>,
  interceptor: Interceptor<SqliteStorage, SqliteQueue>,
  queue: Arc<SqliteQueue>,
  credentials: CredentialStore,
  origin: Url,
  generation: String,
  precache: Vec<Url>,
  install_timeout: Duration,
  queue_max_age: Option<chrono::Duration>,
  retry_interval: Duration,
  state: Mutex<WorkerState>,
  active_generation: RwLock<Option<String>>,
  signals: mpsc::UnboundedSender<SyncSignal>,
}

impl ServiceWorker {
  /// Build the worker for `config.generation`. The receiver feeds a
  /// [`SyncTrigger`] obtained from [`ServiceWorker::sync_trigger`].
  pub fn new(
    config: &Config,
    db: Arc<Database>,
    network: Arc<dyn Network>,
  ) -> Result<(Self, mpsc::UnboundedReceiver<SyncSignal>)> {
    let queue = Arc::new(SqliteQueue::new(Arc::clone(&db)));
    let cache = CacheManager::new(SqliteStorage::new(Arc::clone(&db)), Arc::clone(&network))
      .with_max_fallback_age(config.api_max_age());
    let active = db.get_meta(ACTIVE_GENERATION_KEY)?;
    let state = if active.as_deref() == Some(config.generation.as_str()) {
      WorkerState::Activated
    } else if cache
      .cache_names()?
      .contains(&static_cache(&config.generation))
    {
      // Precached by an earlier process and still waiting to activate.
      WorkerState::Installed
    } else {
      WorkerState::Parsed
    };
    debug!(generation = %config.generation, active = ?active, ?state, "worker created");

    let interceptor = Interceptor::new(
      cache,
      Arc::clone(&queue),
      Arc::clone(&network),
      config.origin.clone(),
      config.api_prefix.clone(),
      config.write_failure,
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Self {
      db,
      network,
      interceptor,
      queue,
      credentials: CredentialStore::new(),
      origin: config.origin.clone(),
      generation: config.generation.clone(),
      precache: config.precache_urls()?,
      install_timeout: config.install_timeout(),
      queue_max_age: config.queue_max_age(),
      retry_interval: config.retry_interval(),
      state: Mutex::new(state),
      active_generation: RwLock::new(active),
      signals: tx,
    };
    Ok((worker, rx))
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  /// Generation currently serving requests, possibly an older one.
  pub fn active_generation(&self) -> Option<String> {
    self
      .active_generation
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Precache the app shell within the install timeout. On failure the
  /// worker becomes redundant and the active generation is untouched.
  pub async fn install(&self) -> Result<usize> {
    self.set_state(WorkerState::Installing);
    info!(generation = %self.generation, urls = self.precache.len(), "installing");

    let precache = self
      .interceptor
      .cache()
      .precache(&self.generation, &self.precache);
    match tokio::time::timeout(self.install_timeout, precache).await {
      Ok(Ok(count)) => {
        self.set_state(WorkerState::Installed);
        Ok(count)
      }
      Ok(Err(e)) => {
        warn!(generation = %self.generation, error = %e, "install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
      Err(_) => {
        warn!(generation = %self.generation, timeout = ?self.install_timeout, "install timed out");
        self.set_state(WorkerState::Redundant);
        Err(Error::InstallTimeout(self.install_timeout))
      }
    }
  }

  /// Evict other generations and start controlling requests.
  pub fn activate(&self) -> Result<Vec<String>> {
    match self.state() {
      WorkerState::Installed => {}
      WorkerState::Activated => return Ok(Vec::new()),
      _ => return Err(Error::NotInstalled(self.generation.clone())),
    }

    self.set_state(WorkerState::Activating);
    let deleted = match self.interceptor.cache().activate(&self.generation) {
      Ok(deleted) => deleted,
      Err(e) => {
        self.set_state(WorkerState::Installed);
        return Err(e);
      }
    };
    if let Err(e) = self.db.set_meta(ACTIVE_GENERATION_KEY, &self.generation) {
      self.set_state(WorkerState::Installed);
      return Err(e);
    }

    *self
      .active_generation
      .write()
      .unwrap_or_else(|e| e.into_inner()) = Some(self.generation.clone());
    self.set_state(WorkerState::Activated);
    info!(generation = %self.generation, evicted = deleted.len(), "activated");
    Ok(deleted)
  }

  /// Bring the worker up: install if nothing is precached yet, then take
  /// control when no generation does. A newer generation installed next to
  /// an active one waits for SKIP_WAITING. Returns evicted cache names.
  pub async fn start(&self) -> Result<Vec<String>> {
    if self.state() == WorkerState::Parsed {
      self.install().await?;
    }
    if self.state() == WorkerState::Installed && self.active_generation().is_none() {
      return self.activate();
    }
    Ok(Vec::new())
  }

  /// Activate without waiting for older clients to go away.
  pub fn skip_waiting(&self) -> Result<Vec<String>> {
    self.activate()
  }

  /// Route a request. With no active generation, requests are not
  /// controlled and go straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<Outcome> {
    match self.active_generation() {
      Some(generation) => self.interceptor.handle(request, &generation).await,
      None => {
        let response = self.network.fetch(request).await?;
        Ok(Outcome::Response(CacheResult::from_network(response)))
      }
    }
  }

  /// Durably enqueue an action from the page. Resolves once it is stored.
  pub fn queue_action(&self, payload: ActionPayload) -> Result<QueuedAction> {
    let action = NewAction::from_payload(payload, &self.origin)?;
    self.interceptor.queue_action(&action)
  }

  pub fn handle_message(&self, message: ControlMessage) -> Result<MessageReply> {
    debug!(?message, "control message");
    match message {
      ControlMessage::SkipWaiting => Ok(MessageReply::Activated(self.skip_waiting()?)),
      ControlMessage::SetToken { token: None } => {
        self.credentials.clear();
        Ok(MessageReply::Ack)
      }
      ControlMessage::SetToken { token } => {
        self.credentials.set(token);
        // A fresh token may unblock a pass halted on auth.
        if self.credentials.is_present() {
          self.signal(SyncSignal::Flush);
        }
        Ok(MessageReply::Ack)
      }
      ControlMessage::QueueAction { payload } => {
        Ok(MessageReply::Queued(self.queue_action(payload)?))
      }
      ControlMessage::Flush => {
        self.signal(SyncSignal::Flush);
        Ok(MessageReply::Ack)
      }
    }
  }

  pub fn signal(&self, signal: SyncSignal) {
    if self.signals.send(signal).is_err() {
      debug!(?signal, "no sync trigger running; signal dropped");
    }
  }

  /// Trigger that replays this worker's queue with its credentials.
  pub fn sync_trigger(&self) -> SyncTrigger<SqliteQueue> {
    SyncTrigger::new(
      Arc::clone(&self.queue),
      Arc::clone(&self.network),
      self.credentials.clone(),
      self.origin.clone(),
    )
    .with_max_age(self.queue_max_age)
    .with_retry_interval(self.retry_interval)
  }

  pub fn queue(&self) -> &SqliteQueue {
    &self.queue
  }

  pub fn cache(&self) -> &CacheManager<SqliteStorage> {
    self.interceptor.cache()
  }

  pub fn credentials(&self) -> &CredentialStore {
    &self.credentials
  }
}
