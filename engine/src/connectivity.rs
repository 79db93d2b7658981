//! Network reachability signals.
//!
//! The sync coordinator only talks to the remote tier while a
//! [`ConnectivityObserver`] reports the device online, and starts a sync
//! cycle whenever it flips from offline to online.

use crate::remote::RemoteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Source of online/offline state.
pub trait ConnectivityObserver: Send + Sync {
    fn is_online(&self) -> bool;

    /// A receiver that changes whenever the state does.
    fn watch(&self) -> watch::Receiver<bool>;
}

fn publish(tx: &watch::Sender<bool>, online: bool) -> bool {
    tx.send_if_modified(|current| {
        if *current == online {
            false
        } else {
            *current = online;
            true
        }
    })
}

/// Connectivity set explicitly by the host application (or a test).
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        if publish(&self.tx, online) {
            info!(online, "connectivity changed");
        }
    }
}

impl ConnectivityObserver for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Connectivity inferred by pinging the remote tier at a fixed interval.
#[derive(Debug)]
pub struct ProbeConnectivity {
    tx: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ProbeConnectivity {
    /// Start probing. Must be called inside a tokio runtime.
    pub fn spawn(remote: Arc<dyn RemoteStore>, interval: Duration) -> Self {
        let (tx, _) = watch::channel(false);
        let tx = Arc::new(tx);

        let sender = Arc::clone(&tx);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let online = remote.ping().await.is_ok();
                if publish(&sender, online) {
                    info!(online, "connectivity changed");
                }
            }
        });

        Self { tx, task }
    }
}

impl ConnectivityObserver for ProbeConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}
