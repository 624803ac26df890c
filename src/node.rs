// Node - wiring of storage, ledger, trimmer and snapshots
//
// Startup order:
// 1. open the store and rebuild the tip registry
// 2. start the trimmer
// 3. resume any interrupted snapshot or trimming
// 4. load the configured snapshot file
// 5. verify ledger integrity, then start automatic snapshots

use crate::api::QueryService;
use crate::snapshot::{SnapshotConfig, SnapshotError, SnapshotManager, Trimmer, TrimmerStats};
use crate::storage::{StoreConfig, StoreError, TangleDb};
use crate::tangle::{LedgerError, LedgerStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors while starting or running a node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Full node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Database directory; `None` opens a temporary store
    pub db_path: Option<PathBuf>,
    pub store: StoreConfig,
    pub snapshot: SnapshotConfig,
    /// Snapshot file loaded at startup
    pub load_file: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_load_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.load_file = Some(path.into());
        self
    }
}

/// A running node
pub struct Node {
    ledger: Arc<LedgerStore>,
    snapshots: Arc<SnapshotManager>,
    trimmer: Trimmer,
    autosnapshots: Option<JoinHandle<Result<(), SnapshotError>>>,
}

impl Node {
    /// Open storage and start the background workers
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let db = match &config.db_path {
            Some(path) => TangleDb::open(path, config.store.clone())?,
            None => TangleDb::temporary(config.store.clone())?,
        };
        let ledger = Arc::new(LedgerStore::open(db)?);

        let (trimmer, queue) =
            Trimmer::spawn(Arc::clone(&ledger), config.snapshot.trim_queue_capacity);
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&ledger),
            queue,
            config.snapshot.clone(),
        )?);

        if let Err(e) = Self::prepare(&snapshots, &config).await {
            error!(error = %e, "Node startup failed");
            trimmer.shutdown().await;
            return Err(e.into());
        }

        let autosnapshots = snapshots.start_autosnapshots();
        info!(
            cutoff = snapshots.current_cutoff_timestamp(),
            tips = ledger.tip_set().len(),
            "Node started"
        );
        Ok(Self {
            ledger,
            snapshots,
            trimmer,
            autosnapshots,
        })
    }

    async fn prepare(
        snapshots: &Arc<SnapshotManager>,
        config: &NodeConfig,
    ) -> Result<(), SnapshotError> {
        snapshots.recover().await?;
        if let Some(path) = &config.load_file {
            snapshots.load_snapshot(path.clone()).await?;
        }
        if let Err(e) = snapshots.check_integrity() {
            error!("Database is in an inconsistent state. Try deleting it and loading a snapshot.");
            return Err(e);
        }
        Ok(())
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn trimmer_stats(&self) -> Arc<TrimmerStats> {
        self.trimmer.stats()
    }

    /// Query surface over this node
    pub fn queries(&self) -> QueryService {
        QueryService::new(Arc::clone(&self.ledger), Arc::clone(&self.snapshots))
    }

    /// Wait until automatic snapshots stop, which only happens on a fatal
    /// error; pends forever when they are disabled
    pub async fn wait_fatal(&mut self) -> SnapshotError {
        let Some(handle) = self.autosnapshots.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.autosnapshots = None;
        match result {
            Ok(Err(e)) => e,
            Ok(Ok(())) => std::future::pending().await,
            Err(e) => SnapshotError::Task(e.to_string()),
        }
    }

    /// Stop background work and flush storage
    pub async fn shutdown(self) -> Result<(), NodeError> {
        self.snapshots.shutdown();
        if let Some(handle) = self.autosnapshots {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Automatic snapshots stopped with an error"),
                Err(e) => warn!(error = %e, "Automatic snapshot task ended abnormally"),
            }
        }
        self.trimmer.shutdown().await;
        self.ledger.db().flush()?;
        info!("Node stopped");
        Ok(())
    }
}
