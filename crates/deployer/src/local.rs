//! In-process [`Deployer`]: bounded dispatch channel feeding a fixed pool of workers.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use classy_core::ClusterRef;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{DeployResult, Deployer, DeployerError, Options, Request, RequestHandler, RequestKey, ResultStatus};

#[derive(Clone)]
struct Job {
    handler: Arc<dyn RequestHandler>,
    timeout: Duration,
    options: Options,
}

#[derive(Default)]
struct Jobs {
    queued: FxHashMap<RequestKey, Job>,
    running: FxHashSet<RequestKey>,
    /// Dispatched again while running; re-queued when the current run ends.
    dirty: FxHashMap<RequestKey, Job>,
    /// `None` on success, error text on failure.
    results: FxHashMap<RequestKey, Option<String>>,
}

struct Shared {
    jobs: Mutex<Jobs>,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn start(&self, key: &RequestKey) -> Option<Job> {
        let mut jobs = self.jobs();
        let job = jobs.queued.remove(key)?;
        jobs.running.insert(key.clone());
        Some(job)
    }

    /// Record the outcome. Returns true when the key must be sent again.
    fn finish(&self, key: &RequestKey, outcome: Result<(), String>) -> bool {
        let mut jobs = self.jobs();
        jobs.running.remove(key);
        if let Some(job) = jobs.dirty.remove(key) {
            jobs.queued.insert(key.clone(), job);
            return true;
        }
        jobs.results.insert(key.clone(), outcome.err());
        false
    }
}

/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct LocalDeployer {
    shared: Arc<Shared>,
    tx: mpsc::Sender<RequestKey>,
}

impl LocalDeployer {
    /// Start the dispatcher with `workers` concurrent jobs and room for `capacity`
    /// queued keys. Must be called inside a tokio runtime.
    pub fn spawn(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<RequestKey>(capacity.max(1));
        let shared = Arc::new(Shared { jobs: Mutex::new(Jobs::default()) });
        let requeue = tx.downgrade();
        tokio::spawn(run_dispatcher(Arc::clone(&shared), rx, requeue, workers.max(1)));
        info!(workers = workers.max(1), capacity = capacity.max(1), "deployer started");
        Self { shared, tx }
    }
}

async fn run_dispatcher(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<RequestKey>,
    requeue: mpsc::WeakSender<RequestKey>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(key) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
        let Some(job) = shared.start(&key) else {
            debug!(%key, "request dropped before start");
            continue;
        };
        let shared = Arc::clone(&shared);
        let requeue = requeue.clone();
        tokio::spawn(async move {
            let outcome = run_job(&key, job).await;
            let again = shared.finish(&key, outcome);
            // Free the slot before sending so the dispatcher can keep draining.
            drop(permit);
            if again {
                if let Some(tx) = requeue.upgrade() {
                    let _ = tx.send(key).await;
                }
            }
        });
    }
    debug!("deployer dispatcher stopped");
}

async fn run_job(key: &RequestKey, job: Job) -> Result<(), String> {
    let started = Instant::now();
    counter!("deployer_jobs_total", 1u64);
    let request = Request { key: key.clone(), options: job.options };
    let res = match tokio::time::timeout(job.timeout, job.handler.handle(&request)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("request timed out after {}s", job.timeout.as_secs())),
    };
    histogram!("deployer_job_ms", started.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(()) => debug!(%key, "request completed"),
        Err(e) => {
            counter!("deployer_job_failures_total", 1u64);
            warn!(%key, error = %e, "request failed");
        }
    }
    res
}

impl Deployer for LocalDeployer {
    fn deploy(
        &self,
        key: RequestKey,
        handler: Arc<dyn RequestHandler>,
        timeout: Duration,
        options: Options,
    ) -> Result<(), DeployerError> {
        let job = Job { handler, timeout, options };
        let mut jobs = self.shared.jobs();
        if jobs.running.contains(&key) {
            debug!(%key, "request running; marked to run again");
            jobs.results.remove(&key);
            jobs.dirty.insert(key, job);
            return Ok(());
        }
        if let Some(slot) = jobs.queued.get_mut(&key) {
            *slot = job;
            return Ok(());
        }
        match self.tx.try_send(key.clone()) {
            Ok(()) => {
                jobs.results.remove(&key);
                jobs.queued.insert(key, job);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                counter!("deployer_queue_full_total", 1u64);
                Err(DeployerError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DeployerError::Closed),
        }
    }

    fn is_in_progress(&self, key: &RequestKey) -> bool {
        let jobs = self.shared.jobs();
        jobs.queued.contains_key(key) || jobs.running.contains(key) || jobs.dirty.contains_key(key)
    }

    fn get_result(&self, key: &RequestKey) -> DeployResult {
        let jobs = self.shared.jobs();
        if jobs.queued.contains_key(key) || jobs.running.contains(key) || jobs.dirty.contains_key(key) {
            return DeployResult::of(ResultStatus::InProgress);
        }
        match jobs.results.get(key) {
            Some(None) if key.undeploy => DeployResult::of(ResultStatus::Removed),
            Some(None) => DeployResult::of(ResultStatus::Deployed),
            Some(Some(e)) => DeployResult { status: ResultStatus::Failed, error: Some(e.clone()) },
            None => DeployResult::of(ResultStatus::Unavailable),
        }
    }

    fn cleanup_entries(&self, cluster: &ClusterRef, applicant: &str, feature_id: &str) {
        let mut jobs = self.shared.jobs();
        for key in [RequestKey::deploy(cluster, applicant, feature_id), RequestKey::undeploy(cluster, applicant, feature_id)] {
            jobs.queued.remove(&key);
            jobs.dirty.remove(&key);
            jobs.results.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl RequestHandler for Counting {
        async fn handle(&self, _request: &Request) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("apply rejected by api server");
            }
            Ok(())
        }
    }

    /// Blocks until released.
    struct Gate {
        entered: Notify,
        release: Notify,
        runs: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RequestHandler for Gate {
        async fn handle(&self, _request: &Request) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn key(undeploy: bool) -> RequestKey {
        let c = ClusterRef::capi("fleet", "a");
        if undeploy {
            RequestKey::undeploy(&c, "acme-x", "Classifier")
        } else {
            RequestKey::deploy(&c, "acme-x", "Classifier")
        }
    }

    async fn settle(d: &LocalDeployer, k: &RequestKey) -> DeployResult {
        for _ in 0..200 {
            let r = d.get_result(k);
            if r.status != ResultStatus::InProgress {
                return r;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        d.get_result(k)
    }

    #[tokio::test]
    async fn deploy_then_result_is_deployed() {
        let d = LocalDeployer::spawn(2, 8);
        let h = Arc::new(Counting { runs: AtomicUsize::new(0), fail: false });
        assert_eq!(d.get_result(&key(false)).status, ResultStatus::Unavailable);
        d.deploy(key(false), h.clone(), Duration::from_secs(5), Options::default()).unwrap();
        assert_eq!(settle(&d, &key(false)).await, DeployResult::of(ResultStatus::Deployed));
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);
        assert!(!d.is_in_progress(&key(false)));
    }

    #[tokio::test]
    async fn undeploy_success_reads_as_removed() {
        let d = LocalDeployer::spawn(1, 8);
        let h = Arc::new(Counting { runs: AtomicUsize::new(0), fail: false });
        d.deploy(key(true), h, Duration::from_secs(5), Options::default()).unwrap();
        assert_eq!(settle(&d, &key(true)).await.status, ResultStatus::Removed);
    }

    #[tokio::test]
    async fn failure_keeps_the_error_text() {
        let d = LocalDeployer::spawn(1, 8);
        let h = Arc::new(Counting { runs: AtomicUsize::new(0), fail: true });
        d.deploy(key(false), h, Duration::from_secs(5), Options::default()).unwrap();
        let r = settle(&d, &key(false)).await;
        assert_eq!(r.status, ResultStatus::Failed);
        assert_eq!(r.error.as_deref(), Some("apply rejected by api server"));
    }

    #[tokio::test]
    async fn redispatch_while_running_runs_again() {
        let d = LocalDeployer::spawn(1, 8);
        let gate = Arc::new(Gate { entered: Notify::new(), release: Notify::new(), runs: AtomicUsize::new(0) });
        d.deploy(key(false), gate.clone(), Duration::from_secs(5), Options::default()).unwrap();
        gate.entered.notified().await;
        assert!(d.is_in_progress(&key(false)));
        assert!(!d.is_in_progress(&key(true)));
        d.deploy(key(false), gate.clone(), Duration::from_secs(5), Options::default()).unwrap();
        gate.release.notify_one();
        gate.entered.notified().await;
        assert_eq!(d.get_result(&key(false)).status, ResultStatus::InProgress);
        gate.release.notify_one();
        assert_eq!(settle(&d, &key(false)).await.status, ResultStatus::Deployed);
        assert_eq!(gate.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let d = LocalDeployer::spawn(1, 8);
        let gate = Arc::new(Gate { entered: Notify::new(), release: Notify::new(), runs: AtomicUsize::new(0) });
        d.deploy(key(false), gate, Duration::from_millis(20), Options::default()).unwrap();
        let r = settle(&d, &key(false)).await;
        assert_eq!(r.status, ResultStatus::Failed);
        assert!(r.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn full_queue_pushes_back() {
        let d = LocalDeployer::spawn(1, 1);
        let gate = Arc::new(Gate { entered: Notify::new(), release: Notify::new(), runs: AtomicUsize::new(0) });
        d.deploy(key(false), gate.clone(), Duration::from_secs(5), Options::default()).unwrap();
        gate.entered.notified().await;
        // One key can sit in the dispatcher waiting for a worker and one in the channel.
        let mut full = 0;
        for i in 0..4 {
            let c = ClusterRef::capi("fleet", format!("b{i}"));
            let k = RequestKey::deploy(&c, "acme-x", "Classifier");
            if d.deploy(k, gate.clone(), Duration::from_secs(5), Options::default()) == Err(DeployerError::QueueFull) {
                full += 1;
            }
        }
        assert!(full >= 2, "expected back-pressure, got {full} rejections");
        gate.release.notify_waiters();
    }

    #[tokio::test]
    async fn cleanup_forgets_results() {
        let d = LocalDeployer::spawn(1, 8);
        let h = Arc::new(Counting { runs: AtomicUsize::new(0), fail: false });
        d.deploy(key(false), h, Duration::from_secs(5), Options::default()).unwrap();
        settle(&d, &key(false)).await;
        d.cleanup_entries(&ClusterRef::capi("fleet", "a"), "acme-x", "Classifier");
        assert_eq!(d.get_result(&key(false)).status, ResultStatus::Unavailable);
    }
}
