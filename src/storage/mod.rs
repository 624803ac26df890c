// Storage module - PERSISTENCE
// Handles the transactional key-value store and the physical key layout

pub mod keys;
mod store;

pub use store::{
    decode, encode, BatchStats, BatchWriter, StorageStats, StoreConfig, StoreError, TangleDb,
    WriteOp, WriteTxn,
};
