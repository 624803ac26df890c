// Tangle storage node
//
// Durable storage for a transaction DAG in which every transaction approves a
// trunk and a branch predecessor, plus the snapshot machinery that compacts
// old history into address balances and spent flags.

pub mod api;
pub mod convert;
pub mod node;
pub mod snapshot;
pub mod storage;
pub mod tangle;

pub use node::{Node, NodeConfig, NodeError};
