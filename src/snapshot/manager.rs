// SnapshotManager - compacting history into a balance checkpoint
//
// A snapshot runs through Idle -> Locked -> Loading -> Trimming -> Committing.
// The lock record is written before any ledger state changes and cleared in
// the same write that advances the cutoff, so a lock found at startup means
// the previous run did not finish. At most one snapshot runs at a time.

use crate::convert::Hash;
use crate::snapshot::file::{self, SnapshotContents, SnapshotFileError, SnapshotRecord};
use crate::snapshot::trimmer::TrimQueue;
use crate::storage::keys::{self, kind};
use crate::storage::{StoreError, WriteOp};
use crate::tangle::{LedgerError, LedgerStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Errors from snapshot operations
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("A snapshot is already in progress")]
    AlreadyInProgress,

    #[error("Snapshots are halted after a failed integrity check")]
    Halted,

    #[error("Ledger integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Snapshot file error: {0}")]
    File(#[from] SnapshotFileError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Snapshot task failed: {0}")]
    Task(String),
}

impl SnapshotError {
    /// Errors after which the node must not keep serving
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SnapshotError::IntegrityCheckFailed(_) | SnapshotError::Halted
        )
    }
}

/// Configuration for snapshots
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Time between automatic snapshots; zero disables them
    pub interval: Duration,
    /// History kept behind the present by automatic snapshots
    pub retention: Duration,
    /// Pause after taking the writer section before touching the ledger
    pub settle_delay: Duration,
    /// Capacity of the pruning queue
    pub trim_queue_capacity: usize,
    /// Total supply the snapshot balances must add up to
    pub expected_supply: Option<i64>,
    /// Where computed snapshots are exported
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            retention: Duration::from_secs(24 * 3600),
            settle_delay: Duration::from_secs(3),
            trim_queue_capacity: 100_000,
            expected_supply: None,
            snapshot_dir: None,
        }
    }
}

impl SnapshotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_trim_queue_capacity(mut self, capacity: usize) -> Self {
        self.trim_queue_capacity = capacity;
        self
    }

    pub fn with_expected_supply(mut self, supply: i64) -> Self {
        self.expected_supply = Some(supply);
        self
    }

    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }
}

/// Persisted marker of a snapshot in flight
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLock {
    pub timestamp: i64,
    /// Source file, empty for computed snapshots
    pub filename: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotPhase {
    Idle,
    Locked,
    Loading,
    Trimming,
    Committing,
}

/// What a snapshot call did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The cutoff advanced to `timestamp`
    Applied { timestamp: i64 },
    /// The candidate was not newer than `current`; nothing changed
    NotNewer { current: i64 },
}

struct SnapshotState {
    phase: SnapshotPhase,
    cutoff: i64,
    halted: bool,
}

/// Orchestrates snapshot loading, computing and pruning
pub struct SnapshotManager {
    ledger: Arc<LedgerStore>,
    queue: TrimQueue,
    config: SnapshotConfig,
    state: Mutex<SnapshotState>,
    shutdown: watch::Sender<bool>,
}

impl SnapshotManager {
    /// Create a manager, reading the committed cutoff from storage
    pub fn new(
        ledger: Arc<LedgerStore>,
        queue: TrimQueue,
        config: SnapshotConfig,
    ) -> Result<Self, SnapshotError> {
        let cutoff: i64 = ledger
            .db()
            .get(&keys::singleton(kind::SNAPSHOT_DATE))?
            .unwrap_or(0);
        info!(cutoff, "Current snapshot timestamp");
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            ledger,
            queue,
            config,
            state: Mutex::new(SnapshotState {
                phase: SnapshotPhase::Idle,
                cutoff,
                halted: false,
            }),
            shutdown,
        })
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SnapshotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Timestamp below which history may be pruned; 0 before any snapshot
    pub fn current_cutoff_timestamp(&self) -> i64 {
        self.state().cutoff
    }

    pub fn phase(&self) -> SnapshotPhase {
        self.state().phase
    }

    pub fn is_in_progress(&self) -> bool {
        self.phase() != SnapshotPhase::Idle
    }

    pub fn is_halted(&self) -> bool {
        self.state().halted
    }

    /// The persisted lock, if a snapshot is (or was left) in flight
    pub fn snapshot_lock(&self) -> Result<Option<SnapshotLock>, SnapshotError> {
        Ok(self.ledger.db().get(&keys::singleton(kind::SNAPSHOT_LOCK))?)
    }

    fn set_phase(&self, phase: SnapshotPhase) {
        debug!(?phase, "Snapshot phase");
        self.state().phase = phase;
    }

    /// Claim the in-progress flag for a candidate cutoff
    fn begin(&self, timestamp: i64) -> Result<Option<SnapshotOutcome>, SnapshotError> {
        let mut state = self.state();
        if state.halted {
            return Err(SnapshotError::Halted);
        }
        if state.phase != SnapshotPhase::Idle {
            return Err(SnapshotError::AlreadyInProgress);
        }
        if timestamp <= state.cutoff {
            return Ok(Some(SnapshotOutcome::NotNewer {
                current: state.cutoff,
            }));
        }
        state.phase = SnapshotPhase::Locked;
        Ok(None)
    }

    fn finish(&self, result: &Result<SnapshotOutcome, SnapshotError>) {
        let mut state = self.state();
        if let Err(e) = result {
            if e.is_fatal() {
                state.halted = true;
            }
        }
        state.phase = SnapshotPhase::Idle;
    }

    fn write_lock(&self, timestamp: i64, filename: &str) -> Result<(), SnapshotError> {
        let lock = SnapshotLock {
            timestamp,
            filename: filename.to_string(),
        };
        self.ledger.db().write(&[WriteOp::put(
            keys::singleton(kind::SNAPSHOT_LOCK).to_vec(),
            &lock,
        )?])?;
        Ok(())
    }

    fn settle(&self) {
        if !self.config.settle_delay.is_zero() {
            std::thread::sleep(self.config.settle_delay);
        }
    }

    // ========================================================================
    // MAKE
    // ========================================================================

    /// Compute a snapshot at `cutoff` from the live ledger
    pub async fn make_snapshot(self: &Arc<Self>, cutoff: i64) -> Result<SnapshotOutcome, SnapshotError> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.make_snapshot_blocking(cutoff))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))?
    }

    /// Blocking form of [`SnapshotManager::make_snapshot`]
    ///
    /// Must run on a blocking thread: the trimming step waits on the queue.
    pub fn make_snapshot_blocking(&self, cutoff: i64) -> Result<SnapshotOutcome, SnapshotError> {
        if let Some(outcome) = self.begin(cutoff)? {
            info!(cutoff, ?outcome, "Snapshot is not newer than the current one, skipping");
            return Ok(outcome);
        }
        let result = self.run_make(cutoff);
        self.finish(&result);
        result
    }

    fn run_make(&self, cutoff: i64) -> Result<SnapshotOutcome, SnapshotError> {
        info!(cutoff, "Making snapshot");
        self.write_lock(cutoff, "")?;

        let gate = self.ledger.lock_writes();
        self.settle();

        self.set_phase(SnapshotPhase::Loading);
        let (contents, obsolete) = self.compute(cutoff)?;
        let mut writer = self.ledger.db().batch_writer();
        for (address, value) in &contents.balances {
            writer.write(&balance_writes(address, *value, false)?)?;
        }
        for address in &contents.spent {
            writer.write(&spent_writes(address)?)?;
        }
        let stats = writer.finish()?;
        debug!(records = stats.records, commits = stats.commits, "Snapshot state written");

        self.set_phase(SnapshotPhase::Trimming);
        self.trim(&obsolete)?;

        self.set_phase(SnapshotPhase::Committing);
        self.commit(cutoff)?;
        drop(gate);

        if let Some(dir) = &self.config.snapshot_dir {
            match file::write_file(dir, cutoff, &contents) {
                Ok(path) => info!(path = %path.display(), "Snapshot exported"),
                Err(e) => warn!(error = %e, "Failed exporting snapshot file"),
            }
        }
        Ok(SnapshotOutcome::Applied { timestamp: cutoff })
    }

    /// New snapshot state plus the transactions it makes obsolete
    fn compute(&self, cutoff: i64) -> Result<(SnapshotContents, Vec<Hash>), SnapshotError> {
        let db = self.ledger.db();
        let mut contents = SnapshotContents::default();

        for entry in db.scan_prefix(&keys::prefix(kind::SNAPSHOT_BALANCE)) {
            let (key, value) = entry?;
            contents
                .balances
                .insert(id_of(&key)?, crate::storage::decode(&value)?);
        }
        for entry in db.scan_prefix(&keys::prefix(kind::SNAPSHOT_SPENT)) {
            let (key, _) = entry?;
            contents.spent.insert(id_of(&key)?);
        }
        contents.pending_bundles = self.pending_bundles()?;

        let mut obsolete = Vec::new();
        for hash in self.obsolete_before(cutoff, &contents.pending_bundles)? {
            if self.ledger.is_confirmed(&hash)? {
                let address = self.ledger.get_address(&hash)?;
                let value = self.ledger.get_value(&hash)?;
                if let (Some(address), Some(value)) = (address, value) {
                    if value != 0 {
                        let balance = contents.balances.entry(address).or_insert(0);
                        *balance = balance.checked_add(value).ok_or_else(|| {
                            SnapshotError::IntegrityCheckFailed(format!(
                                "balance overflow for {}",
                                address
                            ))
                        })?;
                    }
                    if value < 0 {
                        contents.spent.insert(address);
                    }
                }
            }
            obsolete.push(hash);
        }
        Ok((contents, obsolete))
    }

    fn pending_bundles(&self) -> Result<BTreeSet<Hash>, SnapshotError> {
        let mut bundles = BTreeSet::new();
        for entry in self.ledger.db().scan_prefix(&keys::prefix(kind::PENDING_BUNDLE)) {
            let (key, _) = entry?;
            bundles.insert(id_of(&key)?);
        }
        Ok(bundles)
    }

    /// Transactions older than `cutoff` not yet marked for pruning, minus
    /// those belonging to retained bundles
    fn obsolete_before(
        &self,
        cutoff: i64,
        pending_bundles: &BTreeSet<Hash>,
    ) -> Result<Vec<Hash>, SnapshotError> {
        let db = self.ledger.db();
        let mut obsolete = Vec::new();
        for hash in self.ledger.transactions_before(cutoff)? {
            if db.contains(&keys::key(&hash, kind::PRUNABLE))? {
                continue;
            }
            if let Some(bundle) = self.ledger.get_bundle(&hash)? {
                if pending_bundles.contains(&bundle) {
                    continue;
                }
            }
            obsolete.push(hash);
        }
        Ok(obsolete)
    }

    /// Durably mark then enqueue obsolete transactions
    fn trim(&self, obsolete: &[Hash]) -> Result<(), SnapshotError> {
        let mut writer = self.ledger.db().batch_writer();
        for hash in obsolete {
            writer.write(&[WriteOp::put(keys::key(hash, kind::PRUNABLE), &true)?])?;
        }
        writer.finish()?;

        for hash in obsolete {
            if self.queue.enqueue_blocking(*hash).is_err() {
                warn!("Trim queue closed, pruning resumes on next start");
                break;
            }
        }
        info!(count = obsolete.len(), "Transactions queued for trimming");
        Ok(())
    }

    fn commit(&self, timestamp: i64) -> Result<(), SnapshotError> {
        if let Err(e) = self.check_integrity() {
            error!(error = %e, "Database is in an inconsistent state. Try deleting it and loading a snapshot.");
            return Err(e);
        }
        self.ledger.db().write(&[
            WriteOp::put(keys::singleton(kind::SNAPSHOT_DATE).to_vec(), &timestamp)?,
            WriteOp::Delete(keys::singleton(kind::SNAPSHOT_LOCK).to_vec()),
        ])?;
        self.state().cutoff = timestamp;
        info!(timestamp, "Snapshot committed");
        Ok(())
    }

    // ========================================================================
    // LOAD
    // ========================================================================

    /// Load a snapshot file named `<timestamp>.snap`
    pub async fn load_snapshot(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let manager = Arc::clone(self);
        let path = path.into();
        tokio::task::spawn_blocking(move || manager.load_snapshot_blocking(&path))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))?
    }

    /// Blocking form of [`SnapshotManager::load_snapshot`]
    pub fn load_snapshot_blocking(&self, path: &Path) -> Result<SnapshotOutcome, SnapshotError> {
        let timestamp = file::timestamp_from_path(path)?;
        if let Some(outcome) = self.begin(timestamp)? {
            info!(path = %path.display(), ?outcome, "Snapshot file is not newer than the current one, skipping");
            return Ok(outcome);
        }
        let result = self.run_load(path, timestamp);
        self.finish(&result);
        result
    }

    fn run_load(&self, path: &Path, timestamp: i64) -> Result<SnapshotOutcome, SnapshotError> {
        info!(path = %path.display(), timestamp, "Loading snapshot");
        let summary = file::validate_file(path)?;
        debug!(?summary, "Snapshot file validated");

        self.write_lock(timestamp, &path.to_string_lossy())?;

        let gate = self.ledger.lock_writes();
        self.settle();

        self.set_phase(SnapshotPhase::Loading);
        info!("Loading values, this can take several minutes");
        let db = self.ledger.db();
        let mut writer = db.batch_writer();
        for record_kind in [kind::BALANCE, kind::SNAPSHOT_BALANCE] {
            for key in db.list_keys_with_prefix(&keys::prefix(record_kind))? {
                writer.write(&[WriteOp::Delete(key)])?;
            }
        }
        writer.finish()?;

        let mut writer = db.batch_writer();
        for record in file::open_file(path)? {
            let ops = match record? {
                SnapshotRecord::Balance { address, value } => balance_writes(&address, value, true)?,
                SnapshotRecord::Spent(address) => spent_writes(&address)?,
                SnapshotRecord::PendingBundle(bundle) => {
                    vec![WriteOp::put(keys::key(&bundle, kind::PENDING_BUNDLE), &true)?]
                }
            };
            writer.write(&ops)?;
        }
        let stats = writer.finish()?;
        info!(
            balances = summary.balances,
            spent = summary.spent,
            pending_bundles = summary.pending_bundles,
            total_value = %summary.total_value,
            commits = stats.commits,
            "Snapshot values loaded"
        );

        self.set_phase(SnapshotPhase::Trimming);
        let obsolete = self.obsolete_before(timestamp, &self.pending_bundles()?)?;
        self.trim(&obsolete)?;

        self.set_phase(SnapshotPhase::Committing);
        self.commit(timestamp)?;
        drop(gate);
        Ok(SnapshotOutcome::Applied { timestamp })
    }

    // ========================================================================
    // INTEGRITY
    // ========================================================================

    /// Structural self-consistency scan of the snapshot records
    pub fn check_integrity(&self) -> Result<(), SnapshotError> {
        let db = self.ledger.db();
        let mut total: i64 = 0;

        for entry in db.scan_prefix(&keys::prefix(kind::SNAPSHOT_BALANCE)) {
            let (key, value) = entry?;
            let address = id_of(&key)?;
            let value: i64 = crate::storage::decode(&value)?;
            if value < 0 {
                return Err(SnapshotError::IntegrityCheckFailed(format!(
                    "negative snapshot balance {} for {}",
                    value, address
                )));
            }
            if !db.contains(&keys::key(&address, kind::ADDRESS_BYTES))? {
                return Err(SnapshotError::IntegrityCheckFailed(format!(
                    "balance without address record for {}",
                    address
                )));
            }
            total = total.checked_add(value).ok_or_else(|| {
                SnapshotError::IntegrityCheckFailed("snapshot balances overflow".to_string())
            })?;
        }

        for entry in db.scan_prefix(&keys::prefix(kind::SNAPSHOT_SPENT)) {
            let (key, _) = entry?;
            let address = id_of(&key)?;
            if !db.contains(&keys::key(&address, kind::ADDRESS_BYTES))? {
                return Err(SnapshotError::IntegrityCheckFailed(format!(
                    "spent flag without address record for {}",
                    address
                )));
            }
        }

        if let Some(expected) = self.config.expected_supply {
            if total != expected {
                return Err(SnapshotError::IntegrityCheckFailed(format!(
                    "snapshot balances sum to {}, expected {}",
                    total, expected
                )));
            }
        }
        Ok(())
    }

    /// Snapshot balances keyed by address
    pub fn snapshot_balances(&self) -> Result<BTreeMap<Hash, i64>, SnapshotError> {
        let mut balances = BTreeMap::new();
        for entry in self.ledger.db().scan_prefix(&keys::prefix(kind::SNAPSHOT_BALANCE)) {
            let (key, value) = entry?;
            balances.insert(id_of(&key)?, crate::storage::decode(&value)?);
        }
        Ok(balances)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Resume work left behind by an unclean shutdown
    ///
    /// Re-queues transactions already marked for pruning, then re-runs a
    /// snapshot whose lock is still present.
    pub async fn recover(self: &Arc<Self>) -> Result<Option<SnapshotOutcome>, SnapshotError> {
        let marked = self
            .ledger
            .db()
            .list_keys_with_prefix(&keys::prefix(kind::PRUNABLE))?;
        if !marked.is_empty() {
            info!(count = marked.len(), "Resuming interrupted trimming");
        }
        for key in marked {
            if self.queue.enqueue(id_of(&key)?).await.is_err() {
                warn!("Trim queue closed, pruning resumes on next start");
                break;
            }
        }

        let Some(lock) = self.snapshot_lock()? else {
            return Ok(None);
        };
        warn!(timestamp = lock.timestamp, file = %lock.filename, "Found an unfinished snapshot, resuming");
        let outcome = if !lock.filename.is_empty() && Path::new(&lock.filename).exists() {
            self.load_snapshot(lock.filename).await?
        } else {
            self.make_snapshot(lock.timestamp).await?
        };
        Ok(Some(outcome))
    }

    /// Start the periodic snapshot task
    ///
    /// Returns `None` when the interval is zero. The task ends with an error
    /// only when a snapshot fails fatally.
    pub fn start_autosnapshots(self: &Arc<Self>) -> Option<JoinHandle<Result<(), SnapshotError>>> {
        let interval = self.config.interval;
        if interval.is_zero() {
            return None;
        }
        info!(
            interval_secs = interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Automatic snapshots enabled"
        );

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                if *shutdown.borrow() {
                    return Ok(());
                }
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = ticker.tick() => {}
                }

                if manager.is_in_progress() {
                    warn!("A snapshot is already in progress, skipping this run");
                    continue;
                }
                let retention = manager.config.retention.as_secs() as i64;
                let cutoff = chrono::Utc::now().timestamp() - retention;
                info!(cutoff, "Starting automatic snapshot");
                match manager.make_snapshot(cutoff).await {
                    Ok(outcome) => debug!(?outcome, "Automatic snapshot done"),
                    Err(SnapshotError::AlreadyInProgress) => {
                        warn!("A snapshot is already in progress, skipping this run")
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Automatic snapshot failed fatally");
                        return Err(e);
                    }
                    Err(e) => error!(error = %e, "Automatic snapshot failed"),
                }
            }
        }))
    }

    /// Stop the periodic snapshot task
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

fn id_of(key: &[u8]) -> Result<Hash, SnapshotError> {
    keys::id_of(key)
        .ok_or_else(|| LedgerError::CorruptRecord("snapshot key".to_string()).into())
}

fn balance_writes(address: &Hash, value: i64, running: bool) -> Result<Vec<WriteOp>, StoreError> {
    let mut ops = vec![
        WriteOp::Put(
            keys::key(address, kind::ADDRESS_BYTES),
            address.as_bytes().to_vec(),
        ),
        WriteOp::put(keys::key(address, kind::SNAPSHOT_BALANCE), &value)?,
    ];
    if running {
        ops.push(WriteOp::put(keys::key(address, kind::BALANCE), &value)?);
    }
    Ok(ops)
}

fn spent_writes(address: &Hash) -> Result<Vec<WriteOp>, StoreError> {
    Ok(vec![
        WriteOp::Put(
            keys::key(address, kind::ADDRESS_BYTES),
            address.as_bytes().to_vec(),
        ),
        WriteOp::put(keys::key(address, kind::SNAPSHOT_SPENT), &true)?,
        WriteOp::put(keys::key(address, kind::SPENT), &true)?,
    ])
}
