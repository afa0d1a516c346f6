use mongodb::bson::{Bson, Document, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Position in the oplog: seconds plus an ordinal within that second.
///
/// Ordering follows the field order, which matches how the server orders
/// BSON timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OplogPosition {
    pub time: u32,
    pub inc: u32,
}

impl OplogPosition {
    pub fn new(time: u32, inc: u32) -> Self {
        Self { time, inc }
    }
}

impl From<Timestamp> for OplogPosition {
    fn from(ts: Timestamp) -> Self {
        Self {
            time: ts.time,
            inc: ts.increment,
        }
    }
}

impl From<OplogPosition> for Timestamp {
    fn from(position: OplogPosition) -> Self {
        Timestamp {
            time: position.time,
            increment: position.inc,
        }
    }
}

impl fmt::Display for OplogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.time, self.inc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OplogOp {
    Insert,
    Update,
    Delete,
    /// No-ops, commands and anything else the tailer does not replicate.
    Other(String),
}

impl OplogOp {
    pub fn from_code(code: &str) -> Self {
        match code {
            "i" => OplogOp::Insert,
            "u" => OplogOp::Update,
            "d" => OplogOp::Delete,
            other => OplogOp::Other(other.to_string()),
        }
    }
}

/// One decoded `local.oplog.rs` entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub position: OplogPosition,
    pub op: OplogOp,
    pub namespace: String,
    /// The `o` field: full document for inserts, `{_id}` for deletes.
    pub payload: Document,
    /// `_id` of the affected document, absent for `Other` ops.
    pub document_id: Option<Bson>,
}

impl LogEntry {
    /// Reads the position alone, so that a malformed entry can still move
    /// the bookmark forward.
    pub fn position_of(raw: &Document) -> Option<OplogPosition> {
        raw.get_timestamp("ts").ok().map(OplogPosition::from)
    }

    pub fn from_document(mut raw: Document) -> Result<Self> {
        let position = Self::position_of(&raw).ok_or_else(|| Error::InvalidLogEntry {
            message: "missing ts".to_string(),
        })?;

        let op = match raw.get_str("op") {
            Ok(code) => OplogOp::from_code(code),
            Err(_) => {
                return Err(Error::InvalidLogEntry {
                    message: format!("missing op at {}", position),
                })
            }
        };

        let namespace = raw.get_str("ns").unwrap_or_default().to_string();

        let payload = match raw.remove("o") {
            Some(Bson::Document(doc)) => doc,
            _ => Document::new(),
        };

        let document_id = match &op {
            OplogOp::Insert | OplogOp::Delete => payload.get("_id").cloned(),
            OplogOp::Update => raw
                .get_document("o2")
                .ok()
                .and_then(|target| target.get("_id").cloned()),
            OplogOp::Other(_) => None,
        };

        if document_id.is_none() && !matches!(op, OplogOp::Other(_)) {
            return Err(Error::InvalidLogEntry {
                message: format!("{:?} at {} carries no _id", op, position),
            });
        }

        Ok(Self {
            position,
            op,
            namespace,
            payload,
            document_id,
        })
    }
}
