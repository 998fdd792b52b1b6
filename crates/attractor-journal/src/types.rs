use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ContextId = String;
pub type TurnId = String;

/// Sentinel parent id for the first turn in a context.
pub const ROOT_TURN_ID: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub context_id: ContextId,
    pub head_turn_id: TurnId,
    pub head_depth: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendTurnRequest {
    pub context_id: ContextId,
    pub parent_turn_id: Option<TurnId>,
    pub type_id: String,
    pub type_version: u32,
    pub payload: Value,
    pub idempotency_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    pub parent_turn_id: TurnId,
    pub depth: u32,
    pub type_id: String,
    pub type_version: u32,
    pub payload: Value,
    pub payload_hash: String,
    pub created_at: String,
    pub idempotency_key: Option<String>,
}

pub fn payload_hash(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Duplicate appends after a crash must dedupe server-side, so the key is a
/// pure function of the payload and its parent.
pub fn turn_idempotency_key(payload: &Value, parent_turn_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(payload).unwrap_or_default());
    hasher.update(b"|");
    hasher.update(parent_turn_id.as_bytes());
    hasher.finalize().to_hex().to_string()
}
