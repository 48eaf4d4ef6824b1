//! Durable retry queue on top of the store's sorted sets.
//!
//! ```text
//!  enqueue ──► {ns}::queue::{q}::delayed   (score = due at, epoch ms)
//!                    │ lease into active, then zrem claim
//!                    │ (one winner across processes)
//!                    ▼
//!              {ns}::queue::{q}::active    (member = "{token}|{job}",
//!                                           score = lease expiry)
//!                    │ handler.process(job)
//!          ┌─────────┴──────────┐
//!          ▼                    ▼
//!      Completed         Failed: reschedule into delayed after backoff,
//!                        or call handler.exhausted() when out of attempts
//! ```
//!
//! Any live worker moves jobs whose lease ran out back into the delayed set,
//! so jobs claimed by a crashed process are picked up again.
//!
//! Job ids are UUID v7. Jobs due in the same millisecond therefore sort in
//! enqueue order, and with the default concurrency of one a process runs
//! them in that order.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::{Keyspace, Result, Store};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after attempt number `attempts_made` (1-based) failed.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 1u32
                    .checked_shl(attempts_made.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Attempt budget for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Backoff::Fixed(Duration::from_millis(5)),
        }
    }
}

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs run at once per process. Above one, jobs due together may
    /// finish out of enqueue order.
    pub concurrency: usize,
    /// How often idle workers look for due jobs
    pub poll_interval: Duration,
    /// How long a claimed job may run before another worker takes it back
    pub lease: Duration,
    /// Due jobs fetched per poll
    pub batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(10),
            lease: Duration::from_secs(30),
            batch_size: 64,
        }
    }
}

/// A unit of work as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<T> {
    pub id: String,
    pub data: T,
    /// Attempts started so far, including the one running now
    pub attempts_made: u32,
    pub policy: RetryPolicy,
}

/// Returned by a handler to request another attempt.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct JobFailure(pub String);

impl JobFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Outcome notifications, one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Completed {
        job_id: String,
    },
    Failed {
        job_id: String,
        attempts_made: u32,
        exhausted: bool,
    },
}

#[async_trait]
pub trait JobHandler<T: Send + Sync>: Send + Sync + 'static {
    async fn process(&self, job: &Job<T>) -> std::result::Result<(), JobFailure>;

    /// Called once when a job fails its last attempt.
    async fn exhausted(&self, _job: &Job<T>) {}
}

pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Named queue shared by every process attached to the same store.
pub struct JobQueue<T> {
    name: String,
    store: Arc<dyn Store>,
    delayed_key: String,
    active_key: String,
    config: QueueConfig,
    notify: Arc<Notify>,
    events: broadcast::Sender<JobEvent>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    _job: PhantomData<fn() -> T>,
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>, keys: &Keyspace, config: QueueConfig) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);
        Self {
            delayed_key: keys.queue_delayed(&name),
            active_key: keys.queue_active(&name),
            name,
            store,
            config,
            notify: Arc::new(Notify::new()),
            events,
            shutdown,
            workers: Mutex::new(Vec::new()),
            _job: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a job due immediately. Returns its id.
    pub async fn enqueue(&self, data: T, policy: RetryPolicy) -> Result<String> {
        let job = Job {
            id: Uuid::now_v7().to_string(),
            data,
            attempts_made: 0,
            policy,
        };
        let member = serde_json::to_string(&job)?;
        self.store.zadd(&self.delayed_key, &member, epoch_ms()).await?;
        self.notify.notify_one();
        Ok(job.id)
    }

    /// Start a worker in this process feeding due jobs to `handler`.
    pub async fn process<H: JobHandler<T>>(&self, handler: H) {
        let worker = Worker {
            store: self.store.clone(),
            delayed_key: self.delayed_key.clone(),
            active_key: self.active_key.clone(),
            config: self.config.clone(),
            notify: self.notify.clone(),
            events: self.events.clone(),
            handler: Arc::new(handler),
            permits: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            token: Uuid::new_v4().to_string(),
            _job: PhantomData,
        };
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(worker.run(shutdown));
        self.workers.lock().await.push(handle);
        log::info!("Queue '{}' worker started", self.name);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Jobs waiting or running, across all processes.
    pub async fn count(&self) -> Result<usize> {
        let delayed = self
            .store
            .zrange_by_score(&self.delayed_key, i64::MAX, usize::MAX)
            .await?;
        let active = self
            .store
            .zrange_by_score(&self.active_key, i64::MAX, usize::MAX)
            .await?;
        Ok(delayed.len() + active.len())
    }

    /// Drop every waiting job.
    pub async fn empty(&self) -> Result<()> {
        self.store
            .del(&[self.delayed_key.clone(), self.active_key.clone()])
            .await?;
        Ok(())
    }

    /// Stop local workers. Stored jobs stay for other processes.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers.lock().await.drain(..) {
            handle.abort();
        }
        log::info!("Queue '{}' closed", self.name);
    }
}

impl<T> Drop for JobQueue<T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Active-set entry for a job leased by the worker holding `token`.
fn lease_entry(token: &str, member: &str) -> String {
    format!("{token}|{member}")
}

/// Job member behind an active-set entry.
fn leased_member(entry: &str) -> Option<&str> {
    entry.split_once('|').map(|(_, member)| member)
}

struct Worker<T, H> {
    store: Arc<dyn Store>,
    delayed_key: String,
    active_key: String,
    config: QueueConfig,
    notify: Arc<Notify>,
    events: broadcast::Sender<JobEvent>,
    handler: Arc<H>,
    permits: Arc<Semaphore>,
    /// Distinguishes this worker's leases from other claimants'
    token: String,
    _job: PhantomData<fn() -> T>,
}

impl<T, H> Worker<T, H>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<T>,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let this = Arc::new(self);
        let reap_every = (this.config.lease / 2).max(this.config.poll_interval);
        let mut last_reap = Instant::now();
        let mut backlog = false;

        loop {
            if !backlog {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = this.notify.notified() => {}
                    _ = tokio::time::sleep(this.config.poll_interval) => {}
                }
            }
            if *shutdown.borrow() {
                break;
            }

            if last_reap.elapsed() >= reap_every {
                if let Err(e) = this.reap_stalled().await {
                    log::error!("Stalled job recovery failed: {e}");
                }
                last_reap = Instant::now();
            }

            backlog = match this.claim_due().await {
                Ok(full_batch) => full_batch,
                Err(e) => {
                    log::error!("Queue poll failed: {e}");
                    false
                }
            };
        }
        log::debug!("Queue worker for {} stopped", this.delayed_key);
    }

    /// Claim and start due jobs. Returns true when a full batch was due.
    async fn claim_due(self: &Arc<Self>) -> Result<bool> {
        let due = self
            .store
            .zrange_by_score(&self.delayed_key, epoch_ms(), self.config.batch_size)
            .await?;
        let full_batch = due.len() >= self.config.batch_size;

        for member in due {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return Ok(false);
            };
            let Some(lease) = self.claim(&member).await? else {
                continue;
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.run_job(member, lease).await {
                    log::error!("Job bookkeeping failed: {e}");
                }
                drop(permit);
            });
        }
        Ok(full_batch)
    }

    /// Lease `member` and take it out of the delayed set. Returns the lease
    /// entry, or `None` when another worker won the job.
    ///
    /// The lease is written first, so a crash at any point leaves the job in
    /// at least one of the two sets.
    async fn claim(&self, member: &str) -> Result<Option<String>> {
        let lease = lease_entry(&self.token, member);
        let lease_until = epoch_ms() + self.config.lease.as_millis() as i64;
        self.store.zadd(&self.active_key, &lease, lease_until).await?;
        if self.store.zrem(&self.delayed_key, member).await? {
            return Ok(Some(lease));
        }
        self.store.zrem(&self.active_key, &lease).await?;
        Ok(None)
    }

    async fn run_job(&self, member: String, lease: String) -> Result<()> {
        let mut job: Job<T> = match serde_json::from_str(&member) {
            Ok(job) => job,
            Err(e) => {
                log::error!("Discarding undecodable job: {e}");
                self.store.zrem(&self.active_key, &lease).await?;
                return Ok(());
            }
        };
        job.attempts_made += 1;

        match self.handler.process(&job).await {
            Ok(()) => {
                self.store.zrem(&self.active_key, &lease).await?;
                log::debug!("Job {} completed after {} attempt(s)", job.id, job.attempts_made);
                let _ = self.events.send(JobEvent::Completed { job_id: job.id });
            }
            Err(failure) if job.attempts_made >= job.policy.attempts => {
                self.store.zrem(&self.active_key, &lease).await?;
                log::error!(
                    "Job {} exhausted after {} attempt(s): {failure}",
                    job.id,
                    job.attempts_made
                );
                self.handler.exhausted(&job).await;
                let _ = self.events.send(JobEvent::Failed {
                    job_id: job.id,
                    attempts_made: job.attempts_made,
                    exhausted: true,
                });
            }
            Err(failure) => {
                let delay = job.policy.backoff.delay(job.attempts_made);
                let next = serde_json::to_string(&job)?;
                // Reschedule before releasing the lease; a crash in between
                // yields a duplicate attempt rather than a lost job
                self.store
                    .zadd(&self.delayed_key, &next, epoch_ms() + delay.as_millis() as i64)
                    .await?;
                self.store.zrem(&self.active_key, &lease).await?;
                log::debug!(
                    "Job {} attempt {} failed ({failure}), retrying in {delay:?}",
                    job.id,
                    job.attempts_made
                );
                let _ = self.events.send(JobEvent::Failed {
                    job_id: job.id,
                    attempts_made: job.attempts_made,
                    exhausted: false,
                });
            }
        }
        Ok(())
    }

    /// Return jobs with expired leases to the delayed set.
    async fn reap_stalled(&self) -> Result<()> {
        let now = epoch_ms();
        let stalled = self
            .store
            .zrange_by_score(&self.active_key, now, self.config.batch_size)
            .await?;
        for entry in stalled {
            let Some(member) = leased_member(&entry) else {
                log::warn!("Dropping malformed lease in {}", self.active_key);
                self.store.zrem(&self.active_key, &entry).await?;
                continue;
            };
            if self.store.zrem(&self.active_key, &entry).await? {
                self.store.zadd(&self.delayed_key, member, now).await?;
                log::info!("Recovered stalled job from {}", self.active_key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    struct Flaky {
        fail_first: u32,
        calls: Arc<AtomicU32>,
        exhausted: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler<String> for Flaky {
        async fn process(&self, _job: &Job<String>) -> std::result::Result<(), JobFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(JobFailure::new("not yet"))
            } else {
                Ok(())
            }
        }

        async fn exhausted(&self, _job: &Job<String>) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn queue(store: &MemoryStore) -> JobQueue<String> {
        JobQueue::new("jobs", Arc::new(store.clone()), &Keyspace::new("test"), QueueConfig::default())
    }

    async fn next_final(rx: &mut broadcast::Receiver<JobEvent>) -> JobEvent {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            match &event {
                JobEvent::Failed { exhausted: false, .. } => continue,
                _ => return event,
            }
        }
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(Backoff::Fixed(Duration::from_millis(5)).delay(3), Duration::from_millis(5));
        let exp = Backoff::Exponential {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(exp.delay(1), Duration::from_millis(10));
        assert_eq!(exp.delay(2), Duration::from_millis(20));
        assert_eq!(exp.delay(3), Duration::from_millis(40));
        assert_eq!(exp.delay(4), Duration::from_millis(50));
        assert_eq!(exp.delay(60), Duration::from_millis(50));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_job_retried_until_success() {
        let store = MemoryStore::new();
        let q = queue(&store);
        let calls = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicU32::new(0));
        let mut events = q.subscribe_events();
        q.process(Flaky { fail_first: 2, calls: calls.clone(), exhausted: exhausted.clone() }).await;

        let id = q.enqueue("hello".into(), RetryPolicy::default()).await.unwrap();

        assert_eq!(next_final(&mut events).await, JobEvent::Completed { job_id: id });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exhausted.load(Ordering::SeqCst), 0);
        assert_eq!(q.count().await.unwrap(), 0);
        q.close().await;
    }

    #[tokio::test]
    async fn test_job_exhausts_budget() {
        let store = MemoryStore::new();
        let q = queue(&store);
        let calls = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicU32::new(0));
        let mut events = q.subscribe_events();
        q.process(Flaky { fail_first: u32::MAX, calls: calls.clone(), exhausted: exhausted.clone() }).await;

        let policy = RetryPolicy { attempts: 3, backoff: Backoff::Fixed(Duration::from_millis(1)) };
        let id = q.enqueue("doomed".into(), policy).await.unwrap();

        assert_eq!(
            next_final(&mut events).await,
            JobEvent::Failed { job_id: id, attempts_made: 3, exhausted: true }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(q.count().await.unwrap(), 0);
        q.close().await;
    }

    #[tokio::test]
    async fn test_two_workers_run_each_job_once() {
        let store = MemoryStore::new();
        let a = queue(&store);
        let b = queue(&store);
        let calls = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicU32::new(0));
        a.process(Flaky { fail_first: 0, calls: calls.clone(), exhausted: exhausted.clone() }).await;
        b.process(Flaky { fail_first: 0, calls: calls.clone(), exhausted: exhausted.clone() }).await;

        for i in 0..50 {
            a.enqueue(format!("job-{i}"), RetryPolicy::default()).await.unwrap();
        }
        timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 50 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert_eq!(a.count().await.unwrap(), 0);
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_close_leaves_jobs_in_store() {
        let store = MemoryStore::new();
        let q = queue(&store);
        q.close().await;
        q.enqueue("later".into(), RetryPolicy::default()).await.unwrap();
        assert_eq!(q.count().await.unwrap(), 1);

        // Another process picks it up
        let other = queue(&store);
        let calls = Arc::new(AtomicU32::new(0));
        let mut events = other.subscribe_events();
        other.process(Flaky { fail_first: 0, calls: calls.clone(), exhausted: Arc::new(AtomicU32::new(0)) }).await;
        assert!(matches!(next_final(&mut events).await, JobEvent::Completed { .. }));
        other.close().await;
    }

    #[tokio::test]
    async fn test_stalled_job_recovered() {
        let store = MemoryStore::new();
        let keys = Keyspace::new("test");
        let job = Job {
            id: "stuck".to_string(),
            data: "x".to_string(),
            attempts_made: 1,
            policy: RetryPolicy::default(),
        };
        // Claimed by a process that died, lease already expired
        let lease = lease_entry("dead-worker", &serde_json::to_string(&job).unwrap());
        store
            .zadd(&keys.queue_active("jobs"), &lease, epoch_ms() - 1)
            .await
            .unwrap();

        let config = QueueConfig { lease: Duration::from_millis(20), ..QueueConfig::default() };
        let q: JobQueue<String> = JobQueue::new("jobs", Arc::new(store.clone()), &keys, config);
        let mut events = q.subscribe_events();
        q.process(Flaky { fail_first: 0, calls: Arc::new(AtomicU32::new(0)), exhausted: Arc::new(AtomicU32::new(0)) }).await;

        assert_eq!(
            next_final(&mut events).await,
            JobEvent::Completed { job_id: "stuck".to_string() }
        );
        q.close().await;
    }

    struct Recording {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobHandler<String> for Recording {
        async fn process(&self, job: &Job<String>) -> std::result::Result<(), JobFailure> {
            // Yield so a second concurrent job would get the chance to overtake
            tokio::task::yield_now().await;
            self.seen.lock().unwrap().push(job.data.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_jobs_due_together_run_in_enqueue_order() {
        let store = MemoryStore::new();
        let q = queue(&store);
        for i in 0..40 {
            q.enqueue(format!("{i:02}"), RetryPolicy::default()).await.unwrap();
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        q.process(Recording { seen: seen.clone() }).await;
        timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 40 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let expected: Vec<String> = (0..40).map(|i| format!("{i:02}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        q.close().await;
    }

    #[test]
    fn test_job_ids_sort_by_enqueue_time() {
        let first = Uuid::now_v7().to_string();
        let second = Uuid::now_v7().to_string();
        assert!(first < second);
    }

    fn worker(store: &MemoryStore) -> Worker<String, Flaky> {
        let keys = Keyspace::new("test");
        let config = QueueConfig::default();
        Worker {
            store: Arc::new(store.clone()),
            delayed_key: keys.queue_delayed("jobs"),
            active_key: keys.queue_active("jobs"),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            notify: Arc::new(Notify::new()),
            events: broadcast::channel(16).0,
            handler: Arc::new(Flaky {
                fail_first: 0,
                calls: Arc::new(AtomicU32::new(0)),
                exhausted: Arc::new(AtomicU32::new(0)),
            }),
            token: Uuid::new_v4().to_string(),
            _job: PhantomData,
        }
    }

    #[tokio::test]
    async fn test_claim_leases_before_release() {
        let store = MemoryStore::new();
        let q = queue(&store);
        q.enqueue("once".into(), RetryPolicy::default()).await.unwrap();
        let keys = Keyspace::new("test");
        let member = store
            .zrange_by_score(&keys.queue_delayed("jobs"), i64::MAX, 1)
            .await
            .unwrap()
            .remove(0);

        let winner = worker(&store);
        let loser = worker(&store);
        let lease = winner.claim(&member).await.unwrap().expect("first claim wins");
        assert_eq!(leased_member(&lease), Some(member.as_str()));
        assert!(loser.claim(&member).await.unwrap().is_none());

        // The losing claim leaves the winner's lease alone and adds none of its own
        let active = store
            .zrange_by_score(&keys.queue_active("jobs"), i64::MAX, usize::MAX)
            .await
            .unwrap();
        assert_eq!(active, vec![lease]);
        assert!(store
            .zrange_by_score(&keys.queue_delayed("jobs"), i64::MAX, usize::MAX)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(q.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_stops_workers() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let q = queue(&store);
        q.process(Flaky { fail_first: 0, calls: calls.clone(), exhausted: Arc::new(AtomicU32::new(0)) }).await;
        drop(q);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let producer = queue(&store);
        producer.enqueue("orphan".into(), RetryPolicy::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(producer.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty() {
        let store = MemoryStore::new();
        let q = queue(&store);
        q.enqueue("a".into(), RetryPolicy::default()).await.unwrap();
        q.enqueue("b".into(), RetryPolicy::default()).await.unwrap();
        q.empty().await.unwrap();
        assert_eq!(q.count().await.unwrap(), 0);
    }
}
