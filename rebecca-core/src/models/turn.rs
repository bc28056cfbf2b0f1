use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted prompt/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: i64,
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub response: String,
    pub metadata: Option<serde_json::Value>,
}

/// Row shape of the `conversations` table; metadata is serialized JSON text.
#[derive(Debug, sqlx::FromRow)]
pub struct TurnRow {
    pub id: i64,
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub response: String,
    pub metadata: Option<String>,
}

impl From<TurnRow> for Turn {
    fn from(row: TurnRow) -> Self {
        let metadata = row.metadata.map(|raw| {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        });
        Self {
            id: row.id,
            user_id: row.user_id,
            timestamp: row.timestamp,
            prompt: row.prompt,
            response: row.response,
            metadata,
        }
    }
}
