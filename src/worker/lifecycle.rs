//! Worker versions and the registration that decides which one is active.

use color_eyre::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use super::message::ControlAction;
use super::OfflineWorker;

/// Lifecycle state of a worker version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activated,
}

struct Version {
  id: u64,
  state: WorkerState,
  worker: Arc<OfflineWorker>,
}

#[derive(Default)]
struct Slots {
  installing: Option<Version>,
  waiting: Option<Version>,
  active: Option<Version>,
  /// Clients currently controlled by the active version
  clients: usize,
  next_id: u64,
}

impl Slots {
  /// Move the waiting version into the active slot.
  fn promote(&mut self) -> bool {
    let Some(mut next) = self.waiting.take() else {
      return false;
    };

    if let Some(previous) = self.active.take() {
      info!(version = previous.id, "worker is redundant");
    }
    next.state = WorkerState::Activated;
    info!(version = next.id, "worker activated");
    self.active = Some(next);

    true
  }
}

/// Snapshot of one version, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionStatus {
  pub id: u64,
  pub state: WorkerState,
  pub cache_name: String,
}

/// Snapshot of the whole registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationStatus {
  pub installing: Option<VersionStatus>,
  pub waiting: Option<VersionStatus>,
  pub active: Option<VersionStatus>,
  pub clients: usize,
}

/// Holds the installing, waiting and active worker versions.
///
/// A version only reaches the active slot after its install completed, so
/// fetch events never reach a worker whose precache is incomplete.
#[derive(Clone, Default)]
pub struct Registration {
  slots: Arc<Mutex<Slots>>,
}

impl Registration {
  pub fn new() -> Self {
    Self::default()
  }

  fn slots(&self) -> MutexGuard<'_, Slots> {
    // Slot updates never panic midway, so a poisoned lock still holds
    // consistent data.
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Install `worker` as a new version.
  ///
  /// On success the version activates right away when nothing is active or
  /// no clients are controlled, and waits otherwise. On failure the version
  /// is discarded and the current active version keeps serving.
  pub async fn install(&self, worker: OfflineWorker) -> Result<u64> {
    let worker = Arc::new(worker);
    let id = {
      let mut slots = self.slots();
      let id = slots.next_id;
      slots.next_id += 1;
      slots.installing = Some(Version {
        id,
        state: WorkerState::Installing,
        worker: Arc::clone(&worker),
      });
      id
    };

    info!(version = id, cache = %worker.config().cache_name, "installing worker");
    let result = worker.install().await;

    let mut slots = self.slots();
    let Some(mut version) = slots.installing.take() else {
      return Err(color_eyre::eyre::eyre!("Install of version {} was abandoned", id));
    };

    if let Err(e) = result {
      warn!(version = id, error = %e, "install failed, keeping current worker");
      return Err(e);
    }

    version.state = WorkerState::Installed;
    if let Some(superseded) = slots.waiting.replace(version) {
      info!(version = superseded.id, "waiting worker superseded");
    }

    if slots.active.is_none() || slots.clients == 0 {
      slots.promote();
    } else {
      info!(version = id, clients = slots.clients, "worker waiting for clients to close");
    }

    Ok(id)
  }

  /// Activate the waiting version now. Returns whether anything changed.
  pub fn skip_waiting(&self) -> bool {
    self.slots().promote()
  }

  pub fn apply(&self, action: ControlAction) -> bool {
    match action {
      ControlAction::SkipWaiting => self.skip_waiting(),
    }
  }

  /// Register a controlled client until the returned guard is dropped.
  pub fn claim_client(&self) -> ClientGuard {
    self.slots().clients += 1;
    ClientGuard {
      registration: self.clone(),
    }
  }

  /// The version that receives fetch events.
  pub fn active(&self) -> Option<Arc<OfflineWorker>> {
    self.slots().active.as_ref().map(|v| Arc::clone(&v.worker))
  }

  pub fn status(&self) -> RegistrationStatus {
    let slots = self.slots();
    let describe = |v: &Version| VersionStatus {
      id: v.id,
      state: v.state,
      cache_name: v.worker.config().cache_name.clone(),
    };

    RegistrationStatus {
      installing: slots.installing.as_ref().map(describe),
      waiting: slots.waiting.as_ref().map(describe),
      active: slots.active.as_ref().map(describe),
      clients: slots.clients,
    }
  }
}

/// A controlled client. When the last one goes away a waiting version
/// takes over.
pub struct ClientGuard {
  registration: Registration,
}

impl Drop for ClientGuard {
  fn drop(&mut self) {
    let mut slots = self.registration.slots();
    slots.clients = slots.clients.saturating_sub(1);
    if slots.clients == 0 {
      slots.promote();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, MemoryStorage};
  use crate::fetch::testing::ScriptedFetcher;
  use crate::fetch::Response;
  use crate::worker::WorkerConfig;
  use url::Url;

  fn worker(cache_name: &str, fetcher: ScriptedFetcher) -> OfflineWorker {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let config = WorkerConfig {
      cache_name: cache_name.to_string(),
      ..WorkerConfig::new(Url::parse("http://app.test").unwrap())
    };
    OfflineWorker::new(config, storage, Arc::new(fetcher)).unwrap()
  }

  fn healthy(cache_name: &str) -> OfflineWorker {
    worker(
      cache_name,
      ScriptedFetcher::new()
        .respond("http://app.test/static/", Response::new(200, "static"))
        .respond("http://app.test/offline/", Response::new(200, "offline")),
    )
  }

  fn broken(cache_name: &str) -> OfflineWorker {
    worker(cache_name, ScriptedFetcher::new())
  }

  fn active_cache(registration: &Registration) -> Option<String> {
    registration
      .active()
      .map(|w| w.config().cache_name.clone())
  }

  #[tokio::test]
  async fn test_first_install_activates() {
    let registration = Registration::new();

    let id = registration.install(healthy("v1")).await.unwrap();

    let status = registration.status();
    assert_eq!(status.active.unwrap().id, id);
    assert_eq!(registration.status().active.unwrap().state, WorkerState::Activated);
    assert!(status.waiting.is_none());
  }

  #[tokio::test]
  async fn test_failed_first_install_leaves_nothing_active() {
    let registration = Registration::new();

    assert!(registration.install(broken("v1")).await.is_err());

    assert!(registration.active().is_none());
    assert!(registration.status().installing.is_none());
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_version() {
    let registration = Registration::new();
    registration.install(healthy("v1")).await.unwrap();

    assert!(registration.install(broken("v2")).await.is_err());

    assert_eq!(active_cache(&registration).as_deref(), Some("v1"));
    assert!(registration.status().waiting.is_none());
  }

  #[tokio::test]
  async fn test_new_version_waits_while_clients_are_controlled() {
    let registration = Registration::new();
    registration.install(healthy("v1")).await.unwrap();
    let _client = registration.claim_client();

    registration.install(healthy("v2")).await.unwrap();

    let status = registration.status();
    assert_eq!(active_cache(&registration).as_deref(), Some("v1"));
    assert_eq!(status.waiting.unwrap().state, WorkerState::Installed);
    assert_eq!(status.clients, 1);
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_despite_clients() {
    let registration = Registration::new();
    registration.install(healthy("v1")).await.unwrap();
    let _client = registration.claim_client();
    registration.install(healthy("v2")).await.unwrap();

    assert!(registration.apply(ControlAction::SkipWaiting));

    assert_eq!(active_cache(&registration).as_deref(), Some("v2"));
    assert!(registration.status().waiting.is_none());
    assert!(!registration.skip_waiting());
  }

  #[tokio::test]
  async fn test_last_client_leaving_activates_waiting_version() {
    let registration = Registration::new();
    registration.install(healthy("v1")).await.unwrap();
    let first = registration.claim_client();
    let second = registration.claim_client();
    registration.install(healthy("v2")).await.unwrap();

    drop(first);
    assert_eq!(active_cache(&registration).as_deref(), Some("v1"));

    drop(second);
    assert_eq!(active_cache(&registration).as_deref(), Some("v2"));
    assert_eq!(registration.status().clients, 0);
  }

  #[tokio::test]
  async fn test_install_without_clients_replaces_active_version() {
    let registration = Registration::new();
    let first = registration.install(healthy("v1")).await.unwrap();
    let second = registration.install(healthy("v2")).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(registration.status().active.unwrap().id, second);
  }
}
