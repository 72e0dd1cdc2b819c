//! Coalescing of concurrent operations
//!
//! An [`InFlight`] slot holds at most one running operation. Callers arriving while it
//! runs get a clone of the same shared future, so they all observe one outcome. The work
//! itself runs as a spawned task and finishes even if every caller goes away.

use crate::error::{GateError, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Shared outcome of a coalesced operation
pub type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Slot<T: Clone> {
    id: u64,
    future: SharedOutcome<T>,
}

/// Single-occupancy slot for a coalesced operation
pub struct InFlight<T: Clone> {
    name: &'static str,
    slot: Arc<Mutex<Option<Slot<T>>>>,
    next_id: AtomicU64,
}

/// A handle to the running operation
pub struct Joined<T: Clone> {
    pub future: SharedOutcome<T>,
    /// True when this caller joined an operation someone else started
    pub coalesced: bool,
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Join the running operation, or start `make()` on `runtime` if none is running
    pub fn run<F, Fut>(&self, runtime: &Handle, make: F) -> Joined<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            debug!("Joining in-flight {} #{}", self.name, existing.id);
            return Joined {
                future: existing.future.clone(),
                coalesced: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = self.name;
        let work = make();
        let release = Arc::clone(&self.slot);

        // The slot lock is held until the entry is stored, so the release below
        // can never run before it
        let task = runtime.spawn(async move {
            let outcome = work.await;
            let mut slot = release.lock();
            if slot.as_ref().map(|s| s.id) == Some(id) {
                *slot = None;
            }
            outcome
        });

        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(GateError::restart(format!("{} task failed: {}", name, e))),
            }
        }
        .boxed()
        .shared();

        *slot = Some(Slot {
            id,
            future: future.clone(),
        });
        debug!("Started {} #{}", self.name, id);

        Joined {
            future,
            coalesced: false,
        }
    }
}
