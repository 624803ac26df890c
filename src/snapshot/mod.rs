// Snapshot module - CHECKPOINTS AND PRUNING
// Handles snapshot files, the snapshot state machine and background trimming

pub mod file;
mod manager;
mod trimmer;

pub use file::{
    SnapshotContents, SnapshotFileError, SnapshotReader, SnapshotRecord, SnapshotSummary,
    SNAPSHOT_SEPARATOR,
};
pub use manager::{
    SnapshotConfig, SnapshotError, SnapshotLock, SnapshotManager, SnapshotOutcome, SnapshotPhase,
};
pub use trimmer::{TrimQueue, Trimmer, TrimmerError, TrimmerStats};
