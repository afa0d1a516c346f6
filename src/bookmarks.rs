//! Per-stream bookmarks and the persisted run state.
//!
//! The state is a single owned value: the orchestrator and the strategies
//! mutate it in place through `&mut State`, and every checkpoint emits a
//! clone of it so that the persisted copy never aliases the working one.
//!
//! Replication-key values are stored as a string plus a type tag, see
//! [`encode_key_value`] and [`decode_key_value`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{self, Binary, Bson, Timestamp, Uuid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::catalog::ReplicationMethod;
use crate::mongo::transform::format_datetime;
use crate::mongo::OplogPosition;
use crate::{Error, Result};

pub const VERSION: &str = "version";
pub const INITIAL_FULL_TABLE_COMPLETE: &str = "initial_full_table_complete";
pub const MAX_ID_VALUE: &str = "max_id_value";
pub const MAX_ID_TYPE: &str = "max_id_type";
pub const LAST_ID_FETCHED: &str = "last_id_fetched";
pub const LAST_ID_FETCHED_TYPE: &str = "last_id_fetched_type";
pub const OPLOG_TS_TIME: &str = "oplog_ts_time";
pub const OPLOG_TS_INC: &str = "oplog_ts_inc";
pub const REPLICATION_KEY_VALUE: &str = "replication_key_value";
pub const REPLICATION_KEY_TYPE: &str = "replication_key_type";
pub const REPLICATION_KEY_NAME: &str = "replication_key_name";
pub const LAST_REPLICATION_METHOD: &str = "last_replication_method";

const FULL_TABLE_KEYS: &[&str] = &[
    VERSION,
    INITIAL_FULL_TABLE_COMPLETE,
    MAX_ID_VALUE,
    MAX_ID_TYPE,
    LAST_ID_FETCHED,
    LAST_ID_FETCHED_TYPE,
    LAST_REPLICATION_METHOD,
];

const LOG_BASED_KEYS: &[&str] = &[
    VERSION,
    INITIAL_FULL_TABLE_COMPLETE,
    MAX_ID_VALUE,
    MAX_ID_TYPE,
    LAST_ID_FETCHED,
    LAST_ID_FETCHED_TYPE,
    LAST_REPLICATION_METHOD,
    OPLOG_TS_TIME,
    OPLOG_TS_INC,
];

const INCREMENTAL_KEYS: &[&str] = &[
    VERSION,
    REPLICATION_KEY_VALUE,
    REPLICATION_KEY_TYPE,
    REPLICATION_KEY_NAME,
    LAST_REPLICATION_METHOD,
];

/// Bookmark keys a stream may keep under `method`.
pub fn bookmark_keys(method: ReplicationMethod) -> &'static [&'static str] {
    match method {
        ReplicationMethod::FullTable => FULL_TABLE_KEYS,
        ReplicationMethod::LogBased => LOG_BASED_KEYS,
        ReplicationMethod::Incremental => INCREMENTAL_KEYS,
    }
}

/// `{ currently_syncing, bookmarks }`, as read from and written to the
/// state file and STATE messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub currently_syncing: Option<String>,
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bookmark(&self, stream_id: &str) -> Option<&Bookmark> {
        self.bookmarks.get(stream_id)
    }

    /// Returns the stream's bookmark, creating an empty one if needed.
    pub fn bookmark_mut(&mut self, stream_id: &str) -> &mut Bookmark {
        self.bookmarks.entry(stream_id.to_string()).or_default()
    }

    /// True when the stream has a non-empty bookmark.
    pub fn has_bookmark(&self, stream_id: &str) -> bool {
        self.bookmark(stream_id).map(|b| !b.is_empty()).unwrap_or(false)
    }

    /// Drops everything recorded for the stream.
    pub fn reset_stream(&mut self, stream_id: &str) {
        self.bookmarks.remove(stream_id);
    }

    pub fn set_currently_syncing(&mut self, stream_id: Option<&str>) {
        self.currently_syncing = stream_id.map(str::to_string);
    }

    /// Removes keys outside `whitelist` from the stream's bookmark.
    pub fn whitelist_bookmark_keys(&mut self, stream_id: &str, whitelist: &[&str]) {
        if let Some(bookmark) = self.bookmarks.get_mut(stream_id) {
            bookmark.retain_keys(whitelist);
        }
    }
}

/// One stream's checkpoint: a string-keyed JSON map with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bookmark(BTreeMap<String, Value>);

impl Bookmark {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn clear(&mut self, key: &str) {
        self.0.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn retain_keys(&mut self, whitelist: &[&str]) {
        self.0.retain(|key, _| {
            let keep = whitelist.contains(&key.as_str());
            if !keep {
                debug!(key = %key, "Clearing non-whitelisted bookmark key");
            }
            keep
        });
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn version(&self) -> Option<i64> {
        self.get(VERSION).and_then(Value::as_i64)
    }

    pub fn set_version(&mut self, version: i64) {
        self.set(VERSION, version);
    }

    pub fn initial_full_table_complete(&self) -> bool {
        self.get(INITIAL_FULL_TABLE_COMPLETE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn oplog_position(&self) -> Option<OplogPosition> {
        let time = self.get(OPLOG_TS_TIME)?.as_u64()?;
        let inc = self.get(OPLOG_TS_INC)?.as_u64()?;
        Some(OplogPosition::new(
            u32::try_from(time).ok()?,
            u32::try_from(inc).ok()?,
        ))
    }

    pub fn set_oplog_position(&mut self, position: OplogPosition) {
        self.set(OPLOG_TS_TIME, position.time);
        self.set(OPLOG_TS_INC, position.inc);
    }

    /// Reads a value stored with [`Bookmark::set_typed`].
    pub fn typed(&self, value_key: &str, type_key: &str) -> Result<Option<Bson>> {
        let Some(value) = self.get(value_key) else {
            return Ok(None);
        };
        let value = value.as_str().ok_or_else(|| Error::InvalidBookmark {
            key: value_key.to_string(),
            message: format!("expected a string, found {}", value),
        })?;
        let key_type = self.get_str(type_key).ok_or_else(|| Error::InvalidBookmark {
            key: type_key.to_string(),
            message: "missing type tag".to_string(),
        })?;
        decode_key_value(value, key_type).map(Some)
    }

    /// Stores `value` under `value_key` and its type tag under `type_key`.
    /// Nothing is written when the type is unsupported.
    pub fn set_typed(&mut self, value_key: &str, type_key: &str, value: &Bson) -> Result<()> {
        let (text, key_type) = encode_key_value(value)?;
        self.set(value_key, text);
        self.set(type_key, key_type.as_str());
        Ok(())
    }
}

/// Types a replication-key or identifier bookmark may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    ObjectId,
    Int,
    Int32,
    Str,
    Datetime,
    Timestamp,
    Uuid,
    Bytes,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::ObjectId => "ObjectId",
            KeyType::Int => "int",
            KeyType::Int32 => "int32",
            KeyType::Str => "str",
            KeyType::Datetime => "datetime",
            KeyType::Timestamp => "Timestamp",
            KeyType::Uuid => "UUID",
            KeyType::Bytes => "bytes",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ObjectId" => Ok(KeyType::ObjectId),
            "int" => Ok(KeyType::Int),
            "int32" => Ok(KeyType::Int32),
            "str" => Ok(KeyType::Str),
            "datetime" => Ok(KeyType::Datetime),
            "Timestamp" => Ok(KeyType::Timestamp),
            "UUID" => Ok(KeyType::Uuid),
            "bytes" => Ok(KeyType::Bytes),
            other => Err(Error::UnsupportedKeyType {
                key_type: other.to_string(),
            }),
        }
    }
}

/// Renders a native value as `(text, type tag)`.
pub fn encode_key_value(value: &Bson) -> Result<(String, KeyType)> {
    let encoded = match value {
        Bson::ObjectId(oid) => (oid.to_hex(), KeyType::ObjectId),
        Bson::Int64(n) => (n.to_string(), KeyType::Int),
        Bson::Int32(n) => (n.to_string(), KeyType::Int32),
        Bson::String(s) => (s.clone(), KeyType::Str),
        Bson::DateTime(dt) => {
            let utc = DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
                .ok_or_else(|| Error::InvalidBookmark {
                    key: KeyType::Datetime.to_string(),
                    message: format!("{} is outside the supported range", dt),
                })?;
            (format_datetime(&utc), KeyType::Datetime)
        }
        Bson::Timestamp(ts) => (format!("{}.{}", ts.time, ts.increment), KeyType::Timestamp),
        Bson::Binary(binary) if binary.subtype == BinarySubtype::Uuid => {
            let bytes: [u8; 16] =
                binary
                    .bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidBookmark {
                        key: KeyType::Uuid.to_string(),
                        message: format!("UUID must be 16 bytes, found {}", binary.bytes.len()),
                    })?;
            (Uuid::from_bytes(bytes).to_string(), KeyType::Uuid)
        }
        Bson::Binary(binary) => (BASE64.encode(&binary.bytes), KeyType::Bytes),
        other => {
            return Err(Error::UnsupportedKeyType {
                key_type: format!("{:?}", other.element_type()),
            })
        }
    };
    Ok(encoded)
}

/// Parses a value written by [`encode_key_value`].
pub fn decode_key_value(text: &str, key_type: &str) -> Result<Bson> {
    let key_type: KeyType = key_type.parse()?;
    let invalid = |message: String| Error::InvalidBookmark {
        key: key_type.to_string(),
        message,
    };

    let value = match key_type {
        KeyType::ObjectId => Bson::ObjectId(
            ObjectId::parse_str(text).map_err(|e| invalid(format!("{}: {}", text, e)))?,
        ),
        KeyType::Int => Bson::Int64(text.parse().map_err(|e| invalid(format!("{}: {}", text, e)))?),
        KeyType::Int32 => Bson::Int32(text.parse().map_err(|e| invalid(format!("{}: {}", text, e)))?),
        KeyType::Str => Bson::String(text.to_string()),
        KeyType::Datetime => {
            let parsed = DateTime::parse_from_rfc3339(text)
                .map_err(|e| invalid(format!("{}: {}", text, e)))?;
            Bson::DateTime(bson::DateTime::from_millis(parsed.timestamp_millis()))
        }
        KeyType::Timestamp => {
            let (time, increment) = text
                .split_once('.')
                .ok_or_else(|| invalid(format!("{} is not <time>.<inc>", text)))?;
            Bson::Timestamp(Timestamp {
                time: time.parse().map_err(|e| invalid(format!("{}: {}", text, e)))?,
                increment: increment
                    .parse()
                    .map_err(|e| invalid(format!("{}: {}", text, e)))?,
            })
        }
        KeyType::Uuid => {
            let uuid = Uuid::parse_str(text).map_err(|e| invalid(format!("{}: {}", text, e)))?;
            Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: uuid.bytes().to_vec(),
            })
        }
        KeyType::Bytes => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: BASE64
                .decode(text)
                .map_err(|e| invalid(format!("{}: {}", text, e)))?,
        }),
    };
    Ok(value)
}
