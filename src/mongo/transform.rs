//! Conversion of native BSON values into transport-safe JSON.
//!
//! [`transform_value`] is total over [`Bson`]: every variant has an explicit
//! arm, and kinds without a dedicated rendering fall through to relaxed
//! extended JSON. The only failure is a datetime chrono cannot represent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Datelike, Timelike, Utc};
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{Bson, Document, Uuid};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::{Error, Result};

/// Field injected into delete tombstones.
pub const SDC_DELETED_AT: &str = "_sdc_deleted_at";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Found invalid datetime at [{path}]: {millis}ms since epoch")]
    InvalidDateTime { path: String, millis: i64 },
}

/// Transforms a whole document into the record body of a RECORD message.
///
/// Datetime failures are reported against `stream_id` and the document's
/// `_id` so the offending row can be found.
pub fn row_to_record(stream_id: &str, row: &Document) -> Result<Map<String, Value>> {
    let mut path = Vec::new();
    transform_document(row, &mut path).map_err(|e| Error::InvalidDateTime {
        stream: stream_id.to_string(),
        id: row.get("_id").map(render_id).unwrap_or_default(),
        message: e.to_string(),
    })
}

/// Transforms a single value.
pub fn transform_value(value: &Bson) -> std::result::Result<Value, TransformError> {
    transform_at(value, &mut Vec::new())
}

fn transform_document(
    doc: &Document,
    path: &mut Vec<String>,
) -> std::result::Result<Map<String, Value>, TransformError> {
    let mut out = Map::new();
    for (key, value) in doc {
        if is_extremum(value) {
            continue;
        }
        path.push(key.clone());
        let transformed = transform_at(value, path);
        path.pop();
        out.insert(key.clone(), transformed?);
    }
    Ok(out)
}

fn transform_at(value: &Bson, path: &mut Vec<String>) -> std::result::Result<Value, TransformError> {
    let transformed = match value {
        Bson::Document(doc) => match as_dbref(doc) {
            Some(reference) => Value::Object(reference),
            None => Value::Object(transform_document(doc, path)?),
        },
        Bson::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                if is_extremum(item) {
                    continue;
                }
                path.push(index.to_string());
                let transformed = transform_at(item, path);
                path.pop();
                out.push(transformed?);
            }
            Value::Array(out)
        }
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => transform_datetime(dt.timestamp_millis(), path)?,
        Bson::Timestamp(ts) => transform_datetime(i64::from(ts.time) * 1000, path)?,
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        Bson::Double(n) => Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(n.to_string())),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Binary(binary) => match uuid_bytes(&binary.bytes) {
            Some(bytes) if binary.subtype == BinarySubtype::Uuid => {
                Value::String(Uuid::from_bytes(bytes).to_string())
            }
            _ => Value::String(BASE64.encode(&binary.bytes)),
        },
        Bson::RegularExpression(regex) => serde_json::json!({
            "pattern": regex.pattern,
            "flags": regex.options,
        }),
        Bson::JavaScriptCode(code) => Value::String(code.clone()),
        Bson::JavaScriptCodeWithScope(code) => serde_json::json!({
            "value": code.code,
            "scope": Value::Object(transform_document(&code.scope, path)?),
        }),
        Bson::DbPointer(_) => db_pointer(value),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null => Value::Null,
        // MinKey/MaxKey only reach here as a bare top-level value.
        Bson::MinKey | Bson::MaxKey => Value::Null,
        other => other.clone().into_relaxed_extjson(),
    };
    Ok(transformed)
}

/// Renders a datetime as `YYYY-MM-DDTHH:MM:SS.ffffffZ` in UTC.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn transform_datetime(millis: i64, path: &[String]) -> std::result::Result<Value, TransformError> {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) if (1..=9999).contains(&dt.year()) => Ok(Value::String(format_datetime(&dt))),
        // Years outside the ISO range still carry information downstream.
        Some(dt) => Ok(Value::String(format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second(),
            dt.timestamp_subsec_micros()
        ))),
        None => Err(TransformError::InvalidDateTime {
            path: path.join("."),
            millis,
        }),
    }
}

/// Renders a document identifier the way bookmarks and log lines show it.
pub fn render_id(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

fn is_extremum(value: &Bson) -> bool {
    matches!(value, Bson::MinKey | Bson::MaxKey)
}

fn uuid_bytes(bytes: &[u8]) -> Option<[u8; 16]> {
    bytes.try_into().ok()
}

/// `{"$ref": .., "$id": .., "$db": ..}` documents are DBRefs.
fn as_dbref(doc: &Document) -> Option<Map<String, Value>> {
    let collection = doc.get_str("$ref").ok()?;
    let id = doc.get("$id")?;

    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(render_id(id)));
    out.insert("collection".to_string(), Value::String(collection.to_string()));
    out.insert(
        "database".to_string(),
        doc.get_str("$db")
            .map(|db| Value::String(db.to_string()))
            .unwrap_or(Value::Null),
    );
    Some(out)
}

// The driver keeps DbPointer fields private; extended JSON exposes them.
fn db_pointer(value: &Bson) -> Value {
    let ext = value.clone().into_relaxed_extjson();
    let pointer = &ext["$dbPointer"];
    let id = match &pointer["$id"] {
        Value::Object(oid) => oid.get("$oid").cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    serde_json::json!({
        "id": id,
        "collection": pointer["$ref"].clone(),
    })
}
