//! Live online/offline signal with transition notifications.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Something that can tell whether the remote service is reachable right now.
#[async_trait]
pub trait Reachability: Send + Sync {
  async fn reachable(&self) -> bool;
}

/// A change in connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  WentOnline,
  WentOffline,
}

/// Shared connectivity state. Cloning shares the same signal.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Publish the current state. Subscribers are only woken on a change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "Connectivity changed");
    }
  }

  pub fn subscribe(&self) -> ConnectivityEvents {
    ConnectivityEvents {
      rx: self.tx.subscribe(),
    }
  }
}

/// Stream of connectivity transitions.
pub struct ConnectivityEvents {
  rx: watch::Receiver<bool>,
}

impl ConnectivityEvents {
  /// Wait for the next transition. `None` once the signal is dropped.
  pub async fn next(&mut self) -> Option<Transition> {
    self.rx.changed().await.ok()?;
    Some(if *self.rx.borrow_and_update() {
      Transition::WentOnline
    } else {
      Transition::WentOffline
    })
  }
}

/// Poll `target` every `interval` and publish the result.
pub fn spawn_probe<R>(connectivity: Connectivity, target: Arc<R>, interval: Duration) -> JoinHandle<()>
where
  R: Reachability + ?Sized + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let online = target.reachable().await;
      connectivity.set_online(online);
    }
  })
}
