//! Field projections: the stream projection applied to scans, and its
//! oplog counterpart.

use mongodb::bson::{Bson, Document};

/// True when the projection lists fields to keep rather than fields to drop.
pub fn is_inclusion(projection: &Document) -> bool {
    let includes_field = projection
        .iter()
        .filter(|(field, _)| field.as_str() != "_id")
        .any(|(_, value)| is_truthy(value));
    let only_id = projection.len() == 1 && projection.get("_id").map(is_truthy) == Some(true);
    includes_field || only_id
}

pub fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

/// Applies a projection client-side. Dotted paths address nested fields.
pub fn apply_projection(doc: &Document, projection: &Document) -> Document {
    if is_inclusion(projection) {
        let mut out = Document::new();
        let keep_id = projection.get("_id").map(is_truthy).unwrap_or(true);
        if keep_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (path, value) in projection {
            if path != "_id" && is_truthy(value) {
                include_path(doc, &mut out, path);
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (path, value) in projection {
            if !is_truthy(value) {
                exclude_path(&mut out, path);
            }
        }
        out
    }
}

fn include_path(src: &Document, dst: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            if let Some(value) = src.get(path) {
                dst.insert(path, value.clone());
            }
        }
        Some((head, rest)) => {
            let Ok(nested) = src.get_document(head) else {
                return;
            };
            if !matches!(dst.get(head), Some(Bson::Document(_))) {
                dst.insert(head, Document::new());
            }
            if let Ok(nested_out) = dst.get_document_mut(head) {
                include_path(nested, nested_out, rest);
            }
        }
    }
}

fn exclude_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Ok(nested) = doc.get_document_mut(head) {
                exclude_path(nested, rest);
            }
        }
    }
}

/// Builds the oplog projection: the entry envelope plus, for inclusion
/// projections, the stream projection re-rooted under `o.`.
///
/// Exclusions cannot be mixed into the inclusion envelope, so they fetch
/// the whole payload and are applied by the reader.
pub fn oplog_projection(stream_projection: Option<&Document>) -> Document {
    let mut projection = Document::new();
    for field in ["ts", "ns", "op", "o2"] {
        projection.insert(field, 1);
    }
    match stream_projection {
        Some(fields) if is_inclusion(fields) => {
            for (field, value) in fields {
                projection.insert(format!("o.{}", field), value.clone());
            }
            if !fields.contains_key("_id") {
                projection.insert("o._id", 1);
            }
        }
        _ => {
            projection.insert("o", 1);
        }
    }
    projection
}
