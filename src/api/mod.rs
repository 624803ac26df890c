// API module - QUERIES
// Validated read operations for the request layer

mod queries;

pub use queries::{ApiError, InclusionStates, QueryService, TipHashes, TransactionsToApprove};
