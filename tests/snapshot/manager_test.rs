// Snapshot Manager Tests
// Tests for loading, computing and recovering snapshots

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tanglestore::convert::{Hash, PACKED_LEN};
use tanglestore::snapshot::{
    file, SnapshotConfig, SnapshotError, SnapshotFileError, SnapshotLock, SnapshotManager,
    SnapshotOutcome, SnapshotPhase, Trimmer,
};
use tanglestore::storage::keys::{self, kind};
use tanglestore::storage::{StoreConfig, TangleDb, WriteOp};
use tanglestore::tangle::{LedgerStore, Transaction, TRANSACTION_BYTES};
use tempfile::TempDir;

fn id(byte: u8) -> Hash {
    Hash::from_bytes([byte; PACKED_LEN])
}

struct Harness {
    ledger: Arc<LedgerStore>,
    manager: Arc<SnapshotManager>,
    trimmer: Trimmer,
}

fn harness(store: StoreConfig, config: SnapshotConfig) -> Harness {
    harness_on(TangleDb::temporary(store).unwrap(), config)
}

fn harness_on(db: TangleDb, config: SnapshotConfig) -> Harness {
    let ledger = Arc::new(LedgerStore::open(db).unwrap());
    let (trimmer, queue) = Trimmer::spawn(Arc::clone(&ledger), config.trim_queue_capacity);
    let manager = Arc::new(SnapshotManager::new(Arc::clone(&ledger), queue, config).unwrap());
    Harness {
        ledger,
        manager,
        trimmer,
    }
}

fn quick() -> SnapshotConfig {
    SnapshotConfig::new()
        .with_settle_delay(Duration::ZERO)
        .with_trim_queue_capacity(4)
}

fn write_snapshot(dir: &Path, timestamp: i64, text: &str) -> PathBuf {
    let path = file::snapshot_path(dir, timestamp);
    fs::write(&path, text).unwrap();
    path
}

fn save(ledger: &LedgerStore, tx: Transaction) {
    ledger.save(&tx, &[0u8; TRANSACTION_BYTES]).unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

// ============================================================================
// LOADING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_snapshot_applies_balances_and_spent() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    let (addr1, spent) = (id(1), id(2));
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n{}\n", addr1, spent));

    let outcome = within(h.manager.load_snapshot(path)).await.unwrap();

    assert_eq!(outcome, SnapshotOutcome::Applied { timestamp: 1_000 });
    assert_eq!(h.ledger.snapshot_balance(&addr1).unwrap(), Some(100));
    assert_eq!(h.ledger.balance(&addr1).unwrap(), Some(100));
    assert!(h.ledger.is_spent(&spent).unwrap());
    assert_eq!(h.manager.current_cutoff_timestamp(), 1_000);
    assert_eq!(h.manager.snapshot_lock().unwrap(), None);
    assert_eq!(h.manager.phase(), SnapshotPhase::Idle);
    h.manager.check_integrity().unwrap();

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_not_newer_is_noop() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    let newer = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(1)));
    let older = write_snapshot(dir.path(), 500, &format!("{};7\n===\n", id(3)));

    within(h.manager.load_snapshot(newer.clone())).await.unwrap();
    let before = h.ledger.db().dump().unwrap();

    let again = within(h.manager.load_snapshot(newer)).await.unwrap();
    let stale = within(h.manager.load_snapshot(older)).await.unwrap();

    assert_eq!(again, SnapshotOutcome::NotNewer { current: 1_000 });
    assert_eq!(stale, SnapshotOutcome::NotNewer { current: 1_000 });
    assert_eq!(h.ledger.db().dump().unwrap(), before);

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_replaces_previous_balances() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    let first = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(1)));
    let second = write_snapshot(dir.path(), 2_000, &format!("{};100\n===\n", id(2)));

    within(h.manager.load_snapshot(first)).await.unwrap();
    within(h.manager.load_snapshot(second)).await.unwrap();

    assert_eq!(h.ledger.snapshot_balance(&id(1)).unwrap(), None);
    assert_eq!(h.ledger.balance(&id(1)).unwrap(), None);
    assert_eq!(h.ledger.snapshot_balance(&id(2)).unwrap(), Some(100));

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_file_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    let path = write_snapshot(
        dir.path(),
        1_000,
        &format!("{};100\n{};abc\n===\n", id(1), id(2)),
    );

    let result = within(h.manager.load_snapshot(path)).await;

    assert!(matches!(
        result,
        Err(SnapshotError::File(SnapshotFileError::Format { line: 2, .. }))
    ));
    assert!(h.ledger.db().is_empty());
    assert_eq!(h.manager.current_cutoff_timestamp(), 0);
    assert!(!h.manager.is_halted());
    assert!(!h.manager.is_in_progress());

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_snapshot_is_refused() {
    let dir = TempDir::new().unwrap();
    let h = harness(
        StoreConfig::default(),
        quick().with_settle_delay(Duration::from_millis(500)),
    );
    let first = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(1)));
    let second = write_snapshot(dir.path(), 2_000, &format!("{};100\n===\n", id(2)));

    let manager = Arc::clone(&h.manager);
    let running = tokio::spawn(async move { manager.load_snapshot(first).await });
    wait_until(|| h.manager.is_in_progress()).await;

    let result = within(h.manager.load_snapshot(second)).await;
    assert!(matches!(result, Err(SnapshotError::AlreadyInProgress)));

    let outcome = within(running).await.unwrap().unwrap();
    assert_eq!(outcome, SnapshotOutcome::Applied { timestamp: 1_000 });
    assert_eq!(h.ledger.snapshot_balance(&id(2)).unwrap(), None);

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_writes_match_single_write() {
    let dir = TempDir::new().unwrap();
    let mut text = String::new();
    for i in 1..=20u8 {
        text.push_str(&format!("{};{}\n", id(i), i as i64 * 10));
    }
    text.push_str("===\n");
    for i in 21..=30u8 {
        text.push_str(&format!("{}\n", id(i)));
    }
    let path = write_snapshot(dir.path(), 1_000, &text);

    let small = harness(StoreConfig::new().with_max_txn_bytes(256), quick());
    let large = harness(StoreConfig::default(), quick());
    within(small.manager.load_snapshot(path.clone())).await.unwrap();
    within(large.manager.load_snapshot(path)).await.unwrap();

    assert_eq!(
        small.ledger.db().dump().unwrap(),
        large.ledger.db().dump().unwrap()
    );

    small.trimmer.shutdown().await;
    large.trimmer.shutdown().await;
}

// ============================================================================
// TRIMMING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_trims_old_transactions() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    for i in 1..=10u8 {
        save(&h.ledger, Transaction::new(id(i), id(100), id(100), 500));
    }
    save(&h.ledger, Transaction::new(id(50), id(1), id(2), 1_500));
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(60)));

    within(h.manager.load_snapshot(path)).await.unwrap();
    let stats = h.trimmer.stats();
    wait_until(|| stats.processed() >= 10).await;

    assert_eq!(stats.trimmed(), 10);
    for i in 1..=10u8 {
        assert!(!h.ledger.contains(&id(i)).unwrap());
    }
    assert!(h.ledger.contains(&id(50)).unwrap());
    assert!(!h.ledger.db().has_prefix(&keys::prefix(kind::PRUNABLE)).unwrap());
    assert_eq!(h.ledger.tips(), vec![id(50)]);

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_bundle_is_retained() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    let bundle = id(70);
    save(
        &h.ledger,
        Transaction::new(id(1), id(100), id(100), 500).with_bundle(bundle, 0),
    );
    save(&h.ledger, Transaction::new(id(2), id(100), id(100), 500));
    let path = write_snapshot(
        dir.path(),
        1_000,
        &format!("{};100\n===\n===\n{}\n", id(60), bundle),
    );

    within(h.manager.load_snapshot(path)).await.unwrap();
    let stats = h.trimmer.stats();
    wait_until(|| stats.processed() >= 1).await;

    assert!(h.ledger.is_pending_bundle(&bundle).unwrap());
    assert!(h.ledger.contains(&id(1)).unwrap());
    assert!(!h.ledger.contains(&id(2)).unwrap());

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trimming_keeps_tips_consistent_with_storage() {
    let db_dir = TempDir::new().unwrap();
    let db = TangleDb::open(db_dir.path(), StoreConfig::default()).unwrap();
    let h = harness_on(db, quick());
    let (parent, child) = (id(1), id(2));
    save(&h.ledger, Transaction::new(parent, id(100), id(100), 2_000));
    save(&h.ledger, Transaction::new(child, parent, parent, 500));

    within(h.manager.make_snapshot(1_000)).await.unwrap();
    let stats = h.trimmer.stats();
    wait_until(|| stats.processed() >= 1).await;

    let Harness {
        ledger,
        manager,
        trimmer,
    } = h;
    trimmer.shutdown().await;
    let live = ledger.tips();
    ledger.db().flush().unwrap();
    drop(manager);
    drop(ledger);

    let reopened =
        LedgerStore::open(TangleDb::open(db_dir.path(), StoreConfig::default()).unwrap()).unwrap();
    assert_eq!(live, vec![parent]);
    assert_eq!(reopened.tips(), live);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_async_save_during_backlogged_trim() {
    let dir = TempDir::new().unwrap();
    let h = harness(
        StoreConfig::default(),
        quick()
            .with_trim_queue_capacity(2)
            .with_settle_delay(Duration::from_millis(300)),
    );
    for i in 1..=50u8 {
        save(&h.ledger, Transaction::new(id(i), id(100), id(100), 500));
    }
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(60)));

    let manager = Arc::clone(&h.manager);
    let loading = tokio::spawn(async move { manager.load_snapshot(path).await });
    wait_until(|| h.manager.is_in_progress()).await;

    // Parks the only runtime worker on the writer section
    let ledger = Arc::clone(&h.ledger);
    let saving = tokio::spawn(async move {
        ledger.save(
            &Transaction::new(id(51), id(100), id(100), 1_500),
            &[0u8; TRANSACTION_BYTES],
        )
    });

    let outcome = within(loading).await.unwrap().unwrap();
    within(saving).await.unwrap().unwrap();

    assert_eq!(outcome, SnapshotOutcome::Applied { timestamp: 1_000 });
    assert!(h.ledger.contains(&id(51)).unwrap());
    let stats = h.trimmer.stats();
    wait_until(|| stats.processed() >= 50).await;
    assert_eq!(stats.trimmed(), 50);

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_waits_for_snapshot_then_resumes() {
    let dir = TempDir::new().unwrap();
    let h = harness(
        StoreConfig::default(),
        quick().with_settle_delay(Duration::from_millis(600)),
    );
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(60)));

    let manager = Arc::clone(&h.manager);
    let loading = tokio::spawn(async move { manager.load_snapshot(path).await });
    wait_until(|| h.manager.is_in_progress()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ledger = Arc::clone(&h.ledger);
    let saving = tokio::task::spawn_blocking(move || {
        ledger.save(
            &Transaction::new(id(1), id(100), id(100), 1_500),
            &[0u8; TRANSACTION_BYTES],
        )
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!h.ledger.contains(&id(1)).unwrap());
    assert!(!saving.is_finished());

    within(loading).await.unwrap().unwrap();
    within(saving).await.unwrap().unwrap();

    assert!(h.ledger.contains(&id(1)).unwrap());
    assert_eq!(h.ledger.tips(), vec![id(1)]);

    h.trimmer.shutdown().await;
}

// ============================================================================
// MAKING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_make_snapshot_folds_confirmed_history() {
    let dir = TempDir::new().unwrap();
    let h = harness(
        StoreConfig::default(),
        quick()
            .with_expected_supply(100)
            .with_snapshot_dir(dir.path()),
    );
    let (a, b, c) = (id(80), id(81), id(82));
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 100).with_address(a).with_value(100));
    save(&h.ledger, Transaction::new(id(2), id(1), id(1), 200).with_address(a).with_value(-40));
    save(&h.ledger, Transaction::new(id(3), id(2), id(2), 200).with_address(b).with_value(40));
    // Never confirmed, contributes nothing
    save(&h.ledger, Transaction::new(id(4), id(3), id(3), 300).with_address(c).with_value(999));
    // Newer than the cutoff
    save(&h.ledger, Transaction::new(id(5), id(3), id(3), 5_000).with_address(c).with_value(1));
    for i in 1..=3u8 {
        assert!(h.ledger.mark_confirmed(&id(i)).unwrap());
    }

    let outcome = within(h.manager.make_snapshot(1_000)).await.unwrap();

    assert_eq!(outcome, SnapshotOutcome::Applied { timestamp: 1_000 });
    let balances = h.manager.snapshot_balances().unwrap();
    assert_eq!(balances.get(&a), Some(&60));
    assert_eq!(balances.get(&b), Some(&40));
    assert_eq!(balances.get(&c), None);
    assert!(h.ledger.db().contains(&keys::key(&a, kind::SNAPSHOT_SPENT)).unwrap());

    let exported = file::snapshot_path(dir.path(), 1_000);
    let summary = file::validate_file(&exported).unwrap();
    assert_eq!(summary.balances, 2);
    assert_eq!(summary.spent, 1);
    assert_eq!(summary.total_value, 100);

    let stats = h.trimmer.stats();
    wait_until(|| stats.processed() >= 4).await;
    assert!(h.ledger.contains(&id(5)).unwrap());
    for i in 1..=4u8 {
        assert!(!h.ledger.contains(&id(i)).unwrap());
    }

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_make_does_not_double_count() {
    let h = harness(StoreConfig::default(), quick().with_trim_queue_capacity(1));
    let a = id(80);
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 100).with_address(a).with_value(25));
    h.ledger.mark_confirmed(&id(1)).unwrap();

    within(h.manager.make_snapshot(1_000)).await.unwrap();
    within(h.manager.make_snapshot(2_000)).await.unwrap();

    assert_eq!(h.ledger.snapshot_balance(&a).unwrap(), Some(25));
    assert_eq!(h.manager.current_cutoff_timestamp(), 2_000);

    h.trimmer.shutdown().await;
}

// ============================================================================
// INTEGRITY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_integrity_failure_halts_snapshots() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick().with_expected_supply(50));
    let first = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(1)));
    let second = write_snapshot(dir.path(), 2_000, &format!("{};50\n===\n", id(1)));

    let result = within(h.manager.load_snapshot(first)).await;
    assert!(matches!(result, Err(SnapshotError::IntegrityCheckFailed(_))));
    assert!(h.manager.is_halted());
    assert_eq!(h.manager.current_cutoff_timestamp(), 0);
    assert!(h.manager.snapshot_lock().unwrap().is_some());

    let result = within(h.manager.load_snapshot(second)).await;
    assert!(matches!(result, Err(SnapshotError::Halted)));
    let result = within(h.manager.make_snapshot(3_000)).await;
    assert!(matches!(result, Err(SnapshotError::Halted)));

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_make_snapshot_rejects_balance_overflow() {
    let h = harness(StoreConfig::default(), quick());
    let a = id(80);
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 100).with_address(a).with_value(i64::MAX));
    save(&h.ledger, Transaction::new(id(2), id(1), id(1), 100).with_address(a).with_value(1));
    for i in 1..=2u8 {
        h.ledger
            .db()
            .write(&[WriteOp::put(keys::key(&id(i), kind::CONFIRMED), &true).unwrap()])
            .unwrap();
    }

    let result = within(h.manager.make_snapshot(1_000)).await;

    assert!(matches!(result, Err(SnapshotError::IntegrityCheckFailed(_))));
    assert!(h.manager.is_halted());
    assert_eq!(h.ledger.snapshot_balance(&a).unwrap(), None);

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_integrity_rejects_orphan_balance() {
    let h = harness(StoreConfig::default(), quick());
    h.ledger
        .db()
        .write(&[WriteOp::put(keys::key(&id(1), kind::SNAPSHOT_BALANCE), &10i64).unwrap()])
        .unwrap();

    let result = h.manager.check_integrity();

    assert!(matches!(result, Err(SnapshotError::IntegrityCheckFailed(_))));
    h.trimmer.shutdown().await;
}

// ============================================================================
// RECOVERY
// ============================================================================

fn write_lock(ledger: &LedgerStore, timestamp: i64, filename: &str) {
    let lock = SnapshotLock {
        timestamp,
        filename: filename.to_string(),
    };
    ledger
        .db()
        .write(&[WriteOp::put(keys::singleton(kind::SNAPSHOT_LOCK).to_vec(), &lock).unwrap()])
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recover_reloads_locked_file() {
    let dir = TempDir::new().unwrap();
    let h = harness(StoreConfig::default(), quick());
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(1)));
    write_lock(&h.ledger, 1_000, &path.to_string_lossy());

    let outcome = within(h.manager.recover()).await.unwrap();

    assert_eq!(outcome, Some(SnapshotOutcome::Applied { timestamp: 1_000 }));
    assert_eq!(h.ledger.snapshot_balance(&id(1)).unwrap(), Some(100));
    assert_eq!(h.manager.snapshot_lock().unwrap(), None);

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recover_remakes_computed_snapshot() {
    let h = harness(StoreConfig::default(), quick());
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 100).with_address(id(80)).with_value(5));
    h.ledger.mark_confirmed(&id(1)).unwrap();
    write_lock(&h.ledger, 1_000, "");

    let outcome = within(h.manager.recover()).await.unwrap();

    assert_eq!(outcome, Some(SnapshotOutcome::Applied { timestamp: 1_000 }));
    assert_eq!(h.ledger.snapshot_balance(&id(80)).unwrap(), Some(5));

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recover_resumes_marked_pruning() {
    let h = harness(StoreConfig::default(), quick());
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 100));
    h.ledger
        .db()
        .write(&[WriteOp::put(keys::key(&id(1), kind::PRUNABLE), &true).unwrap()])
        .unwrap();

    let outcome = within(h.manager.recover()).await.unwrap();
    assert_eq!(outcome, None);

    let stats = h.trimmer.stats();
    wait_until(|| stats.processed() >= 1).await;
    assert!(!h.ledger.contains(&id(1)).unwrap());

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cutoff_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(1)));
    {
        let ledger = Arc::new(
            LedgerStore::open(TangleDb::open(db_dir.path(), StoreConfig::default()).unwrap())
                .unwrap(),
        );
        let (trimmer, queue) = Trimmer::spawn(Arc::clone(&ledger), 4);
        let manager = Arc::new(SnapshotManager::new(Arc::clone(&ledger), queue, quick()).unwrap());
        within(manager.load_snapshot(path)).await.unwrap();
        trimmer.shutdown().await;
        ledger.db().flush().unwrap();
    }

    let ledger = Arc::new(
        LedgerStore::open(TangleDb::open(db_dir.path(), StoreConfig::default()).unwrap()).unwrap(),
    );
    let (trimmer, queue) = Trimmer::spawn(Arc::clone(&ledger), 4);
    let manager = SnapshotManager::new(ledger, queue, quick()).unwrap();

    assert_eq!(manager.current_cutoff_timestamp(), 1_000);
    trimmer.shutdown().await;
}

// ============================================================================
// AUTOMATIC SNAPSHOTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosnapshots_disabled_by_default() {
    let h = harness(StoreConfig::default(), quick());
    assert!(h.manager.start_autosnapshots().is_none());
    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosnapshots_advance_cutoff() {
    let h = harness(
        StoreConfig::default(),
        quick()
            .with_interval(Duration::from_millis(100))
            .with_retention(Duration::ZERO),
    );
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 1_000).with_address(id(80)).with_value(5));
    h.ledger.mark_confirmed(&id(1)).unwrap();

    let handle = h.manager.start_autosnapshots().unwrap();
    wait_until(|| h.manager.current_cutoff_timestamp() > 0).await;

    assert_eq!(h.ledger.snapshot_balance(&id(80)).unwrap(), Some(5));
    h.manager.shutdown();
    assert!(within(handle).await.unwrap().is_ok());

    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosnapshot_skips_tick_while_snapshot_runs() {
    let dir = TempDir::new().unwrap();
    let h = harness(
        StoreConfig::default(),
        quick()
            .with_settle_delay(Duration::from_millis(600))
            .with_interval(Duration::from_millis(100))
            .with_retention(Duration::ZERO),
    );
    let path = write_snapshot(dir.path(), 1_000, &format!("{};100\n===\n", id(60)));

    let manager = Arc::clone(&h.manager);
    let loading = tokio::spawn(async move { manager.load_snapshot(path).await });
    wait_until(|| h.manager.is_in_progress()).await;

    let handle = h.manager.start_autosnapshots().unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(!handle.is_finished());

    let outcome = within(loading).await.unwrap().unwrap();
    assert_eq!(outcome, SnapshotOutcome::Applied { timestamp: 1_000 });

    // A later tick runs once the manual snapshot is done
    wait_until(|| h.manager.current_cutoff_timestamp() > 1_000).await;
    assert_eq!(h.ledger.snapshot_balance(&id(60)).unwrap(), Some(100));

    h.manager.shutdown();
    assert!(within(handle).await.unwrap().is_ok());
    h.trimmer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autosnapshot_exits_on_integrity_failure() {
    let h = harness(
        StoreConfig::default(),
        quick()
            .with_interval(Duration::from_millis(100))
            .with_retention(Duration::ZERO)
            .with_expected_supply(100),
    );
    save(&h.ledger, Transaction::new(id(1), id(100), id(100), 1_000).with_address(id(80)).with_value(5));
    h.ledger.mark_confirmed(&id(1)).unwrap();

    let handle = h.manager.start_autosnapshots().unwrap();
    let result = within(handle).await.unwrap();

    assert!(matches!(result, Err(SnapshotError::IntegrityCheckFailed(_))));
    assert!(h.manager.is_halted());
    assert_eq!(h.manager.current_cutoff_timestamp(), 0);

    h.trimmer.shutdown().await;
}
