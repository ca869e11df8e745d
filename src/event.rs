use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::worker::{handle_message, ControlAction, OfflineWorker, Registration};

/// Builds a fresh worker version, e.g. from a re-read config file.
pub type WorkerFactory = Arc<dyn Fn() -> Result<OfflineWorker> + Send + Sync>;

/// Lifecycle events, handled one at a time
#[derive(Debug)]
pub enum LifecycleEvent {
  /// Build and install a new worker version
  Update { reply: oneshot::Sender<Result<u64>> },
  /// A message posted to the worker
  Message {
    data: Value,
    reply: oneshot::Sender<Option<ControlAction>>,
  },
}

/// Runs lifecycle events in order on a single task.
///
/// Fetch events do not go through here; they are handled concurrently by
/// whichever version is active.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<LifecycleEvent>,
  registration: Registration,
  factory: WorkerFactory,
}

impl EventHandler {
  /// Spawn the event loop and return a handle for posting events.
  pub fn spawn(registration: Registration, factory: WorkerFactory) -> EventSender {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Self {
      rx,
      registration,
      factory,
    };

    tokio::spawn(handler.run());

    EventSender { tx }
  }

  async fn run(mut self) {
    while let Some(event) = self.rx.recv().await {
      match event {
        LifecycleEvent::Update { reply } => {
          let result = self.update().await;
          let _ = reply.send(result);
        }
        LifecycleEvent::Message { data, reply } => {
          let action = handle_message(&data);
          if let Some(action) = action {
            let changed = self.registration.apply(action);
            info!(?action, changed, "applied control message");
          }
          let _ = reply.send(action);
        }
      }
    }

    debug!("lifecycle event loop stopped");
  }

  async fn update(&self) -> Result<u64> {
    let worker = (self.factory)().map_err(|e| {
      warn!(error = %e, "could not build new worker version");
      e
    })?;

    self.registration.install(worker).await
  }
}

/// Handle for posting lifecycle events.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl EventSender {
  /// Install a new worker version and wait for the outcome.
  pub async fn update(&self) -> Result<u64> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(LifecycleEvent::Update { reply })
      .map_err(|_| eyre!("Lifecycle event loop has stopped"))?;

    rx.await
      .map_err(|_| eyre!("Lifecycle event loop dropped the update"))?
  }

  /// Post a message and wait until it has been handled.
  pub async fn post_message(&self, data: Value) -> Result<Option<ControlAction>> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(LifecycleEvent::Message { data, reply })
      .map_err(|_| eyre!("Lifecycle event loop has stopped"))?;

    rx.await
      .map_err(|_| eyre!("Lifecycle event loop dropped the message"))
  }
}
