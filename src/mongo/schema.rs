//! Incremental JSON-schema inference over raw documents.
//!
//! Each property that has carried a datetime, decimal, document or array
//! gets an `anyOf` list whose last entry is the permissive `{}`. Shapes are
//! only ever added, so the accumulated schema grows monotonically and the
//! caller re-emits it exactly when [`SchemaAccumulator::observe`] says so.

use mongodb::bson::{Bson, Document};
use serde_json::{json, Map, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaAccumulator {
    schema: Value,
}

impl SchemaAccumulator {
    /// Starts from the catalog schema, normalized to an object schema with
    /// a `properties` map.
    pub fn new(initial: &Value) -> Self {
        let mut schema = match initial {
            Value::Object(map) => Value::Object(map.clone()),
            _ => json!({}),
        };
        ensure_object_schema(&mut schema);
        Self { schema }
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Folds one document in. Returns `true` when the schema grew.
    pub fn observe(&mut self, row: &Document) -> bool {
        row_to_schema(&mut self.schema, row)
    }
}

impl Default for SchemaAccumulator {
    fn default() -> Self {
        Self::new(&json!({}))
    }
}

/// Returns `true` when `type` or `properties` had to be added.
fn ensure_object_schema(schema: &mut Value) -> bool {
    let Value::Object(map) = schema else {
        return false;
    };
    let mut changed = false;
    if !map.contains_key("type") {
        map.insert("type".to_string(), json!("object"));
        changed = true;
    }
    if !map.get("properties").map(Value::is_object).unwrap_or(false) {
        map.insert("properties".to_string(), json!({}));
        changed = true;
    }
    changed
}

fn row_to_schema(schema: &mut Value, row: &Document) -> bool {
    let mut changed = ensure_object_schema(schema);
    let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) else {
        return changed;
    };

    for (field, value) in row {
        if !is_tracked(value) {
            continue;
        }
        changed |= ensure_any_of(properties, field);
        if let Some(any_of) = properties
            .get_mut(field)
            .and_then(|entry| entry.get_mut("anyOf"))
            .and_then(Value::as_array_mut)
        {
            changed |= add_to_any_of(any_of, value);
        }
    }
    changed
}

fn is_tracked(value: &Bson) -> bool {
    matches!(
        value,
        Bson::DateTime(_)
            | Bson::Timestamp(_)
            | Bson::Decimal128(_)
            | Bson::Document(_)
            | Bson::Array(_)
    )
}

/// Gives `field` an `anyOf` list, creating it when absent. A property
/// declared without `anyOf` keeps its declaration as the first alternative.
/// Returns `true` when the property schema was rewritten.
fn ensure_any_of(properties: &mut Map<String, Value>, field: &str) -> bool {
    let Some(entry) = properties.get_mut(field) else {
        properties.insert(field.to_string(), json!({ "anyOf": [{}] }));
        return true;
    };

    if entry.get("anyOf").map(Value::is_array).unwrap_or(false) {
        return false;
    }
    debug!(field, "Wrapping declared property schema in anyOf");
    let declared = entry.take();
    *entry = json!({ "anyOf": [declared, {}] });
    true
}

fn has_entry(any_of: &[Value], predicate: impl Fn(&Value) -> bool) -> bool {
    any_of.iter().any(predicate)
}

fn format_is(entry: &Value, format: &str) -> bool {
    entry.get("format").and_then(Value::as_str) == Some(format)
}

fn type_is(entry: &Value, ty: &str) -> bool {
    entry.get("type").and_then(Value::as_str) == Some(ty)
}

/// Index just before the trailing catch-all.
fn before_catch_all(any_of: &[Value]) -> usize {
    any_of.len().saturating_sub(1)
}

fn add_to_any_of(any_of: &mut Vec<Value>, value: &Bson) -> bool {
    let mut changed = false;
    match value {
        Bson::DateTime(_) | Bson::Timestamp(_) => {
            if !has_entry(any_of, |e| format_is(e, "date-time")) {
                any_of.insert(0, json!({ "type": "string", "format": "date-time" }));
                changed = true;
            }
        }
        Bson::Decimal128(_) => {
            if !has_entry(any_of, |e| format_is(e, "singer.decimal")) {
                any_of.insert(0, json!({ "type": "string", "format": "singer.decimal" }));
                changed = true;
            }
        }
        Bson::Document(doc) => {
            if !has_entry(any_of, |e| type_is(e, "object")) {
                let at = before_catch_all(any_of);
                any_of.insert(at, json!({ "type": "object", "properties": {} }));
                changed = true;
            }
            for entry in any_of.iter_mut().filter(|e| type_is(e, "object")) {
                changed |= row_to_schema(entry, doc);
            }
        }
        Bson::Array(items) => {
            if !has_entry(any_of, |e| type_is(e, "array")) {
                let at = before_catch_all(any_of);
                any_of.insert(at, json!({ "type": "array", "items": { "anyOf": [{}] } }));
                changed = true;
            }
            for entry in any_of.iter_mut().filter(|e| type_is(e, "array")) {
                let Some(item_any_of) = entry
                    .pointer_mut("/items/anyOf")
                    .and_then(Value::as_array_mut)
                else {
                    continue;
                };
                for item in items.iter().filter(|item| is_tracked(item)) {
                    changed |= add_to_any_of(item_any_of, item);
                }
            }
        }
        _ => {}
    }
    changed
}
