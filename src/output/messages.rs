use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bookmarks::State;

/// One line of the output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Schema {
        stream: String,
        schema: Value,
        key_properties: Vec<String>,
    },
    Record {
        stream: String,
        record: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<i64>,
        time_extracted: DateTime<Utc>,
    },
    ActivateVersion {
        stream: String,
        version: i64,
    },
    State {
        value: State,
    },
}

impl Message {
    pub fn schema(stream: &str, schema: &Value) -> Self {
        Message::Schema {
            stream: stream.to_string(),
            schema: schema.clone(),
            key_properties: vec!["_id".to_string()],
        }
    }

    pub fn record(stream: &str, record: Map<String, Value>, version: Option<i64>) -> Self {
        Message::Record {
            stream: stream.to_string(),
            record,
            version,
            time_extracted: Utc::now(),
        }
    }

    pub fn activate_version(stream: &str, version: i64) -> Self {
        Message::ActivateVersion {
            stream: stream.to_string(),
            version,
        }
    }

    pub fn state(state: &State) -> Self {
        Message::State {
            value: state.clone(),
        }
    }
}
