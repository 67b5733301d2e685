use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use offset_common::{types::STATE_UNKNOWN, EntityState};

#[derive(Debug, Deserialize)]
struct StatePayload {
    #[serde(default)]
    state: Value,
    #[serde(default)]
    attributes: HashMap<String, Value>,
    #[serde(default)]
    last_changed: Option<DateTime<Utc>>,
}

/// Latest state of every entity seen on `offset/state/<entity_id>`.
#[derive(Clone, Default)]
pub struct StateCache {
    entities: Arc<Mutex<HashMap<String, EntityState>>>,
}

impl StateCache {
    pub async fn update(
        &self,
        entity_id: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<(), serde_json::Error> {
        let mut entities = self.entities.lock().await;
        apply_state_message(&mut entities, entity_id, payload, now)
    }

    pub async fn snapshot(&self) -> HashMap<String, EntityState> {
        self.entities.lock().await.clone()
    }
}

/// Accepts either a JSON object `{state, attributes, last_changed}` or a bare
/// state string. Without an explicit `last_changed` the previous timestamp is
/// kept while the state value stays the same.
pub fn apply_state_message(
    entities: &mut HashMap<String, EntityState>,
    entity_id: &str,
    payload: &str,
    now: DateTime<Utc>,
) -> Result<(), serde_json::Error> {
    let trimmed = payload.trim();
    let parsed = if trimmed.starts_with('{') {
        serde_json::from_str::<StatePayload>(trimmed)?
    } else if trimmed.starts_with('"') {
        StatePayload {
            state: Value::String(serde_json::from_str::<String>(trimmed)?),
            attributes: HashMap::new(),
            last_changed: None,
        }
    } else {
        StatePayload {
            state: Value::String(trimmed.to_string()),
            attributes: HashMap::new(),
            last_changed: None,
        }
    };

    let state = state_string(parsed.state);
    let last_changed = parsed.last_changed.unwrap_or_else(|| {
        entities
            .get(entity_id)
            .filter(|previous| previous.state == state)
            .map(|previous| previous.last_changed)
            .unwrap_or(now)
    });

    entities.insert(
        entity_id.to_string(),
        EntityState {
            state,
            attributes: parsed.attributes,
            last_changed,
        },
    );
    Ok(())
}

fn state_string(value: Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        _ => STATE_UNKNOWN.to_string(),
    }
}
