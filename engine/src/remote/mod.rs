//! The Remote Store adapter.
//!
//! The remote tier is a cloud document store and the system of record while
//! online. Every write through it receives a server-assigned `updatedAt`,
//! which becomes the authoritative timestamp for conflict resolution.
//!
//! - [`HttpRemote`] talks to the Tandem document service
//! - [`MemoryRemote`] is an in-process document store for tests and
//!   offline development

mod http;
mod memory;
mod retry;

pub use http::HttpRemote;
pub use memory::MemoryRemote;
pub use retry::with_single_retry;

use crate::{EntityKind, Record, RecordKey};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a remote call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached (connect failure, timeout, 5xx)
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The service answered and refused the request
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Network-class failures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Unreachable(_) => true,
            RemoteError::Rejected { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Decode(_) => false,
        }
    }
}

/// Called with the current remote record (or `None` once it is removed).
pub type RemoteCallback = Arc<dyn Fn(Option<Record>) + Send + Sync>;

/// Handle for an active remote subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving updates.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Contract of the remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, RemoteError>;

    /// Store `record` and return it as stored, with the server's `updatedAt`.
    async fn upsert(&self, record: &Record) -> Result<Record, RemoteError>;

    /// Remove one document. Removing a missing document succeeds.
    async fn remove(&self, key: &RecordKey) -> Result<(), RemoteError>;

    /// Remove every document of `kind` owned by `owner_id`, returning how many.
    async fn remove_all(&self, kind: EntityKind, owner_id: &str) -> Result<usize, RemoteError>;

    /// Watch one document for changes.
    fn subscribe(&self, key: RecordKey, callback: RemoteCallback) -> Subscription;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn transient_classification() {
        assert!(RemoteError::Unreachable("timeout".into()).is_transient());
        assert!(RemoteError::Rejected {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!RemoteError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!RemoteError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn subscription_cancels_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let subscription = Subscription::new(move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        subscription.unsubscribe();
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn dropping_subscription_cancels() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        drop(Subscription::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
