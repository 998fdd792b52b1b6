use crate::store::{JournalError, JournalResult, TurnStore};
use crate::types::{
    AppendTurnRequest, ContextId, ContextInfo, ROOT_TURN_ID, Turn, TurnId, payload_hash,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub next_context_id: u64,
    pub next_turn_id: u64,
    pub contexts: BTreeMap<ContextId, ContextHead>,
    pub turns: BTreeMap<TurnId, Turn>,
    pub idempotency: BTreeMap<String, TurnId>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct ContextHead {
    pub head_turn_id: TurnId,
    pub head_depth: u32,
}

impl Default for ContextHead {
    fn default() -> Self {
        Self {
            head_turn_id: ROOT_TURN_ID.to_string(),
            head_depth: 0,
        }
    }
}

impl MemoryState {
    fn allocate_context_id(&mut self) -> ContextId {
        if self.next_context_id == 0 {
            self.next_context_id = 1;
        }
        let id = self.next_context_id;
        self.next_context_id += 1;
        id.to_string()
    }

    fn allocate_turn_id(&mut self) -> TurnId {
        if self.next_turn_id == 0 {
            self.next_turn_id = 1;
        }
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        id.to_string()
    }

    fn turn_depth(&self, turn_id: &str) -> Option<u32> {
        self.turns.get(turn_id).map(|turn| turn.depth)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryTurnStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TurnStore for MemoryTurnStore {
    async fn create_context(&self, base_turn_id: Option<TurnId>) -> JournalResult<ContextInfo> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| JournalError::Backend("memory turnstore mutex poisoned".to_string()))?;

        let (head_turn_id, head_depth) = match base_turn_id {
            Some(turn_id) if turn_id != ROOT_TURN_ID => {
                let Some(depth) = state.turn_depth(&turn_id) else {
                    return Err(JournalError::NotFound {
                        resource: "turn",
                        id: turn_id,
                    });
                };
                (turn_id, depth)
            }
            _ => (ROOT_TURN_ID.to_string(), 0),
        };

        let context_id = state.allocate_context_id();
        state.contexts.insert(
            context_id.clone(),
            ContextHead {
                head_turn_id: head_turn_id.clone(),
                head_depth,
            },
        );

        Ok(ContextInfo {
            context_id,
            head_turn_id,
            head_depth,
        })
    }

    async fn append_turn(&self, request: AppendTurnRequest) -> JournalResult<Turn> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| JournalError::Backend("memory turnstore mutex poisoned".to_string()))?;

        let head = state
            .contexts
            .get(&request.context_id)
            .cloned()
            .ok_or_else(|| JournalError::NotFound {
                resource: "context",
                id: request.context_id.clone(),
            })?;

        let key = if request.idempotency_key.is_empty() {
            None
        } else {
            Some(format!("{}|{}", request.context_id, request.idempotency_key))
        };

        if let Some(existing_key) = &key {
            if let Some(turn_id) = state.idempotency.get(existing_key) {
                if let Some(turn) = state.turns.get(turn_id) {
                    return Ok(turn.clone());
                }
            }
        }

        let parent_turn_id = request
            .parent_turn_id
            .clone()
            .unwrap_or_else(|| head.head_turn_id.clone());
        let parent_depth = if parent_turn_id == ROOT_TURN_ID {
            0
        } else {
            state
                .turn_depth(&parent_turn_id)
                .ok_or_else(|| JournalError::NotFound {
                    resource: "turn",
                    id: parent_turn_id.clone(),
                })?
        };

        let turn_id = state.allocate_turn_id();
        let turn = Turn {
            turn_id: turn_id.clone(),
            parent_turn_id,
            depth: parent_depth + 1,
            type_id: request.type_id,
            type_version: request.type_version,
            payload_hash: payload_hash(&request.payload),
            payload: request.payload,
            created_at: timestamp_now(),
            idempotency_key: Some(request.idempotency_key).filter(|value| !value.is_empty()),
        };

        state.turns.insert(turn_id.clone(), turn.clone());
        if let Some(existing_key) = key {
            state.idempotency.insert(existing_key, turn_id.clone());
        }
        if let Some(context) = state.contexts.get_mut(&request.context_id) {
            context.head_turn_id = turn_id;
            context.head_depth = turn.depth;
        }

        Ok(turn)
    }

    async fn get_head(&self, context_id: &ContextId) -> JournalResult<ContextInfo> {
        let state = self
            .inner
            .lock()
            .map_err(|_| JournalError::Backend("memory turnstore mutex poisoned".to_string()))?;
        let context = state
            .contexts
            .get(context_id)
            .ok_or_else(|| JournalError::NotFound {
                resource: "context",
                id: context_id.clone(),
            })?;
        Ok(ContextInfo {
            context_id: context_id.clone(),
            head_turn_id: context.head_turn_id.clone(),
            head_depth: context.head_depth,
        })
    }

    async fn list_turns(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> JournalResult<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let state = self
            .inner
            .lock()
            .map_err(|_| JournalError::Backend("memory turnstore mutex poisoned".to_string()))?;
        let context = state
            .contexts
            .get(context_id)
            .ok_or_else(|| JournalError::NotFound {
                resource: "context",
                id: context_id.clone(),
            })?;

        let mut cursor = if let Some(before) = before_turn_id {
            if before == ROOT_TURN_ID {
                return Ok(Vec::new());
            }
            let turn = state
                .turns
                .get(before)
                .ok_or_else(|| JournalError::NotFound {
                    resource: "turn",
                    id: before.clone(),
                })?;
            turn.parent_turn_id.clone()
        } else {
            context.head_turn_id.clone()
        };

        let mut turns = Vec::new();
        while cursor != ROOT_TURN_ID && turns.len() < limit {
            let turn = state
                .turns
                .get(&cursor)
                .ok_or_else(|| JournalError::NotFound {
                    resource: "turn",
                    id: cursor.clone(),
                })?;
            turns.push(turn.clone());
            cursor = turn.parent_turn_id.clone();
        }
        turns.reverse();
        Ok(turns)
    }
}

fn timestamp_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:09}Z", now.as_secs(), now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(flavor = "current_thread")]
    async fn append_turn_with_same_idempotency_key_expected_single_turn() {
        let store = MemoryTurnStore::new();
        let context = store
            .create_context(None)
            .await
            .expect("context should be created");

        let request = AppendTurnRequest {
            context_id: context.context_id.clone(),
            parent_turn_id: None,
            type_id: "attractor.run_started".to_string(),
            type_version: 1,
            payload: json!({"run_id": "run-1"}),
            idempotency_key: "k1".to_string(),
        };

        let first = store
            .append_turn(request.clone())
            .await
            .expect("append should succeed");
        let second = store
            .append_turn(request)
            .await
            .expect("idempotent append should succeed");

        assert_eq!(first.turn_id, second.turn_id);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_turn_depth_expected_parent_plus_one() {
        let store = MemoryTurnStore::new();
        let context = store
            .create_context(None)
            .await
            .expect("context should be created");

        let first = store
            .append_turn(AppendTurnRequest {
                context_id: context.context_id.clone(),
                parent_turn_id: None,
                type_id: "attractor.run_started".to_string(),
                type_version: 1,
                payload: json!({}),
                idempotency_key: "a".to_string(),
            })
            .await
            .expect("append should succeed");
        let second = store
            .append_turn(AppendTurnRequest {
                context_id: context.context_id.clone(),
                parent_turn_id: None,
                type_id: "attractor.node_entered".to_string(),
                type_version: 1,
                payload: json!({"node_id": "plan"}),
                idempotency_key: "b".to_string(),
            })
            .await
            .expect("append should succeed");

        assert_eq!(first.depth, 1);
        assert_eq!(second.depth, 2);
        assert_eq!(second.parent_turn_id, first.turn_id);

        let head = store
            .get_head(&context.context_id)
            .await
            .expect("head lookup should succeed");
        assert_eq!(head.head_turn_id, second.turn_id);
        assert_eq!(head.head_depth, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn list_turns_pagination_expected_oldest_first() {
        let store = MemoryTurnStore::new();
        let context = store
            .create_context(None)
            .await
            .expect("context should be created");
        for index in 0..3 {
            store
                .append_turn(AppendTurnRequest {
                    context_id: context.context_id.clone(),
                    parent_turn_id: None,
                    type_id: "attractor.context_put".to_string(),
                    type_version: 1,
                    payload: json!({"index": index}),
                    idempotency_key: format!("k{index}"),
                })
                .await
                .expect("append should succeed");
        }

        let turns = store
            .list_turns(&context.context_id, None, 10)
            .await
            .expect("list should succeed");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].payload, json!({"index": 0}));
        assert_eq!(turns[2].payload, json!({"index": 2}));
    }
}
