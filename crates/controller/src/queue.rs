//! Deduplicating reconcile queue and the worker pool draining it.
//!
//! A classifier name is held at most once in the queue. A name added while a worker
//! is processing it is marked dirty and re-queued when that worker finishes, so two
//! workers never reconcile the same classifier at once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Action, Reconciler};

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    queued: FxHashSet<String>,
    processing: FxHashSet<String>,
    dirty: FxHashSet<String>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add(&self, name: &str) {
        let mut st = self.state();
        if st.closed {
            return;
        }
        if st.processing.contains(name) {
            st.dirty.insert(name.to_string());
            return;
        }
        if st.queued.insert(name.to_string()) {
            st.order.push_back(name.to_string());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    pub fn add_after(&self, name: String, delay: Duration) {
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(&name);
        });
    }

    /// Next name to reconcile; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            // Registered before the state check so a concurrent add or close is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if let Some(name) = st.order.pop_front() {
                    st.queued.remove(&name);
                    st.processing.insert(name.clone());
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(name);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `name` finished; re-queue it if it was added meanwhile.
    pub fn done(&self, name: &str) {
        let mut st = self.state();
        st.processing.remove(name);
        if st.dirty.remove(name) && !st.closed && st.queued.insert(name.to_string()) {
            st.order.push_back(name.to_string());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn `workers` reconcile loops draining `queue`.
pub fn spawn_workers(reconciler: Arc<Reconciler>, queue: WorkQueue, workers: usize) -> Vec<JoinHandle<()>> {
    let workers = workers.max(1);
    info!(workers, "reconcile workers started");
    (0..workers)
        .map(|id| {
            let reconciler = Arc::clone(&reconciler);
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(name) = queue.next().await {
                    match reconciler.reconcile(&name).await {
                        Ok(Action::Done) => {}
                        Ok(Action::RequeueAfter(d)) => queue.add_after(name.clone(), d),
                        Err(e) if e.is_recoverable() => queue.add_after(name.clone(), reconciler.settings.requeue),
                        Err(e) => warn!(classifier = %name, error = %e, "not retrying"),
                    }
                    queue.done(&name);
                }
                debug!(worker = id, "reconcile worker stopped");
            })
        })
        .collect()
}
