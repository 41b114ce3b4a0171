//! Two-tier (durable/ephemeral) session state.
//!
//! Every call names its [`Scope`] explicitly. Ephemeral entries never leave
//! memory; the `temp:` key marker is a second gate checked when durable
//! changes are committed.

mod scope;
mod store;

pub use scope::{EPHEMERAL_MARKER, Scope, ephemeral_key, is_ephemeral_key};
pub use store::{DurableDelta, StateChange, StateStore};
