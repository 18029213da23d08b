use crate::crypto::{IssuedKey, KeyIssuer, SubjectName};
use crate::issuance::cache::{IssuanceCache, Lookup, Outcome};
use crate::issuance::IssueError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A queued generation job
struct Task {
    subject: SubjectName,
    reply: watch::Sender<Outcome>,
    receiver: watch::Receiver<Outcome>,
}

/// Issuance counters for monitoring
#[derive(Debug, Default)]
pub struct IssuanceStats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    issued: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub issued: u64,
    pub failed: u64,
}

impl IssuanceStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            issued: self.issued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requests={} cache_hits={} issued={} failed={}",
            self.requests, self.cache_hits, self.issued, self.failed
        )
    }
}

/// Fixed set of workers generating keys off a shared queue, fronted by the cache.
pub struct IssuancePool {
    queue: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    cache: Arc<IssuanceCache>,
    stats: Arc<IssuanceStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl IssuancePool {
    /// Spawn `workers` workers on the current runtime
    pub fn start(issuer: Arc<dyn KeyIssuer>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let cache = Arc::new(IssuanceCache::new());
        let stats = Arc::new(IssuanceStats::default());

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(Self::worker(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&issuer),
                    Arc::clone(&cache),
                    Arc::clone(&stats),
                ))
            })
            .collect();

        info!("Started issuance pool with {} workers", workers);

        Self {
            queue: Mutex::new(Some(sender)),
            cache,
            stats,
            workers: Mutex::new(handles),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Get the key for `subject`, generating it at most once per cache entry
    pub async fn request(&self, subject: SubjectName) -> Result<Arc<IssuedKey>, IssueError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(IssueError::ShuttingDown);
        }
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let mut receiver = match self.cache.lookup_or_insert(subject.as_str()) {
            Lookup::Pending(receiver) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!("Joining existing issuance for {}", subject);
                receiver
            }
            Lookup::Created(reply, receiver) => {
                self.enqueue(Task {
                    subject,
                    reply,
                    receiver: receiver.clone(),
                })?;
                receiver
            }
        };

        let result = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(IssueError::ShuttingDown)),
            Err(_) => Err(IssueError::ShuttingDown),
        };
        result
    }

    fn enqueue(&self, task: Task) -> Result<(), IssueError> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match queue.as_ref() {
            Some(sender) => sender.send(task).map_err(|e| e.0),
            None => Err(task),
        };

        if let Err(task) = sent {
            task.reply.send_replace(Some(Err(IssueError::ShuttingDown)));
            self.cache.evict(task.subject.as_str(), &task.receiver);
            return Err(IssueError::ShuttingDown);
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Stop taking work and wait up to `grace` for the workers to drain the queue
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down issuance pool...");

        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handles =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Worker did not stop within {:?}, aborting", grace);
                handle.abort();
            }
        }
        info!("Issuance pool stopped ({})", self.stats());
    }

    #[instrument(skip(receiver, issuer, cache, stats))]
    async fn worker(
        worker_id: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>,
        issuer: Arc<dyn KeyIssuer>,
        cache: Arc<IssuanceCache>,
        stats: Arc<IssuanceStats>,
    ) {
        loop {
            let next = receiver.lock().await.recv().await;
            let Some(task) = next else {
                break;
            };

            let started = Instant::now();
            let subject = task.subject.clone();
            let job_issuer = Arc::clone(&issuer);
            let result = tokio::task::spawn_blocking(move || job_issuer.issue(&subject)).await;

            let outcome = match result {
                Ok(Ok(issued)) => {
                    stats.issued.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Issued certificate for {} (serial {}) in {:?}",
                        task.subject,
                        issued.serial_hex,
                        started.elapsed()
                    );
                    Ok(Arc::new(issued))
                }
                Ok(Err(e)) => {
                    error!("Issuance for {} failed: {}", task.subject, e);
                    Err(IssueError::Generation(e.to_string()))
                }
                Err(e) => {
                    error!("Issuance task for {} panicked: {}", task.subject, e);
                    Err(IssueError::Generation(e.to_string()))
                }
            };

            if outcome.is_err() {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                cache.evict(task.subject.as_str(), &task.receiver);
            }
            task.reply.send_replace(Some(outcome));
        }
        debug!("Worker stopped");
    }
}
