//! Durable storage layer - JSONL collections with an in-memory cache.
//!
//! Everything written here survives process restarts. Ephemeral state never
//! reaches this module (see [`crate::state`]).

mod jsonl;
mod traits;

pub use jsonl::JsonlStorage;
pub use traits::{Filter, FilterOp, HasId, Storage};

/// Artifact registry rows.
pub const ARTIFACTS_COLLECTION: &str = "artifacts";

/// Durable session state entries.
pub const SESSION_STATE_COLLECTION: &str = "session_state";

/// Persisted execution results referenced by `result_ref`.
pub const RESULTS_COLLECTION: &str = "results";

/// Remote runs abandoned by the poller, awaiting reconciliation.
pub const ORPHANED_RUNS_COLLECTION: &str = "orphaned_runs";
