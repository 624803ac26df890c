// Trimmer - background pruning of transactions behind the snapshot cutoff
//
// A single worker on its own thread drains a bounded queue of hashes and
// removes each transaction's footprint. Producers block once the queue is full.

use crate::convert::Hash;
use crate::tangle::LedgerStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tokio::runtime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Errors from the trim queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrimmerError {
    #[error("Trimmer is not running")]
    Closed,
}

/// Producer side of the pruning queue
#[derive(Clone, Debug)]
pub struct TrimQueue {
    tx: mpsc::Sender<Hash>,
}

impl TrimQueue {
    /// Enqueue from async code, waiting while the queue is full
    pub async fn enqueue(&self, hash: Hash) -> Result<(), TrimmerError> {
        self.tx.send(hash).await.map_err(|_| TrimmerError::Closed)
    }

    /// Enqueue from a blocking thread, waiting while the queue is full
    ///
    /// Must not be called from within an async task.
    pub fn enqueue_blocking(&self, hash: Hash) -> Result<(), TrimmerError> {
        self.tx.blocking_send(hash).map_err(|_| TrimmerError::Closed)
    }

    /// Hashes waiting in the queue
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Counters kept by the worker
#[derive(Debug, Default)]
pub struct TrimmerStats {
    trimmed: AtomicU64,
    missing: AtomicU64,
    failed: AtomicU64,
}

impl TrimmerStats {
    /// Transactions removed
    pub fn trimmed(&self) -> u64 {
        self.trimmed.load(Ordering::SeqCst)
    }

    /// Hashes that were already gone
    pub fn missing(&self) -> u64 {
        self.missing.load(Ordering::SeqCst)
    }

    /// Hashes whose removal failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Hashes handled in any way
    pub fn processed(&self) -> u64 {
        self.trimmed() + self.missing() + self.failed()
    }
}

/// Handle to the running trim worker
pub struct Trimmer {
    handle: thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    stats: Arc<TrimmerStats>,
}

impl Trimmer {
    /// Start the worker with a queue of `capacity` hashes
    ///
    /// The worker runs on a dedicated thread, outside the caller's runtime.
    pub fn spawn(ledger: Arc<LedgerStore>, capacity: usize) -> (Trimmer, TrimQueue) {
        let (tx, mut rx) = mpsc::channel::<Hash>(capacity.max(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(TrimmerStats::default());
        let worker_stats = Arc::clone(&stats);

        let handle = thread::spawn(move || {
            let runtime = match runtime::Builder::new_current_thread().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Failed starting trimmer runtime");
                    return;
                }
            };
            debug!(capacity, "Trimmer started");
            runtime.block_on(async {
                loop {
                    let hash = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        next = rx.recv() => match next {
                            Some(hash) => hash,
                            None => break,
                        },
                    };
                    match ledger.prune(&hash) {
                        Ok(true) => {
                            worker_stats.trimmed.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(false) => {
                            worker_stats.missing.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            worker_stats.failed.fetch_add(1, Ordering::SeqCst);
                            warn!(hash = ?hash, error = %e, "Failed trimming transaction");
                        }
                    }
                }
            });
            info!(trimmed = worker_stats.trimmed(), "Trimmer stopped");
        });

        (
            Trimmer {
                handle,
                shutdown,
                stats,
            },
            TrimQueue { tx },
        )
    }

    /// Worker counters
    pub fn stats(&self) -> Arc<TrimmerStats> {
        Arc::clone(&self.stats)
    }

    /// Stop the worker and wait for its thread to exit
    ///
    /// Hashes still queued are left behind; their pruning markers are picked
    /// up again on the next start.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        let handle = self.handle;
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Trimmer thread panicked"),
            Err(e) => warn!(error = %e, "Failed joining trimmer thread"),
        }
    }
}
