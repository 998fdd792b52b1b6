//! Append-only turn journal for Attractor runs.
//!
//! A run's state transitions are recorded as a chain of immutable turns:
//! locally as newline-delimited JSON, remotely (best effort) in CXDB via the
//! same `TurnStore` contract.

pub mod memory;
pub mod ndjson;
pub mod store;
pub mod types;

pub use memory::MemoryTurnStore;
pub use ndjson::{JOURNAL_FILE_NAME, NdjsonJournal};
pub use store::{JournalError, JournalResult, TurnStore};
pub use types::{
    AppendTurnRequest, ContextId, ContextInfo, ROOT_TURN_ID, Turn, TurnId, payload_hash,
    turn_idempotency_key,
};
