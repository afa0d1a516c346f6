//! In-memory [`DocumentSource`] for tests and dry runs.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mongodb::bson::{Bson, Document, Timestamp};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::RwLock;

use crate::mongo::{
    apply_projection, compare_bson, same_type_bracket, LogEntry, Namespace, OplogPosition,
};
use crate::sync::source::{DocumentSource, DocumentStream, IdRange};
use crate::Result;

/// Collections plus an oplog, all held in memory.
///
/// Oplog reads filter by position only; namespace and op filtering is left
/// to the reader.
#[derive(Default)]
pub struct MemorySource {
    collections: RwLock<HashMap<Namespace, Vec<Document>>>,
    oplog: RwLock<Vec<Document>>,
    keep_alive_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces documents by `_id`.
    pub async fn upsert(&self, namespace: &Namespace, docs: impl IntoIterator<Item = Document>) {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(namespace.clone()).or_default();
        for doc in docs {
            let id = doc.get("_id").cloned();
            match collection.iter_mut().find(|d| d.get("_id") == id.as_ref()) {
                Some(existing) => *existing = doc,
                None => collection.push(doc),
            }
        }
    }

    pub async fn remove(&self, namespace: &Namespace, id: &Bson) {
        if let Some(collection) = self.collections.write().await.get_mut(namespace) {
            collection.retain(|d| d.get("_id") != Some(id));
        }
    }

    /// Appends raw oplog entries. Callers keep them in `ts` order.
    pub async fn append_oplog(&self, entries: impl IntoIterator<Item = Document>) {
        self.oplog.write().await.extend(entries);
    }

    /// Drops oplog entries older than `position`, as a capped oplog does.
    pub async fn truncate_oplog_before(&self, position: OplogPosition) {
        self.oplog
            .write()
            .await
            .retain(|entry| LogEntry::position_of(entry).map_or(true, |p| p >= position));
    }

    pub fn keep_alive_calls(&self) -> usize {
        self.keep_alive_calls.load(AtomicOrdering::SeqCst)
    }

    /// Number of `find_by_ids` round trips served.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(AtomicOrdering::SeqCst)
    }

    async fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        self.collections
            .read()
            .await
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }
}

fn project(docs: Vec<Document>, projection: Option<&Document>) -> Vec<Document> {
    match projection {
        Some(projection) => docs
            .iter()
            .map(|doc| apply_projection(doc, projection))
            .collect(),
        None => docs,
    }
}

fn into_stream(docs: Vec<Document>) -> DocumentStream {
    stream::iter(docs.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn max_id(&self, namespace: &Namespace) -> Result<Option<Bson>> {
        Ok(self
            .documents(namespace)
            .await
            .iter()
            .filter_map(|doc| doc.get("_id"))
            .max_by(|a, b| compare_bson(a, b))
            .cloned())
    }

    async fn scan_ids(
        &self,
        namespace: &Namespace,
        range: &IdRange,
        projection: Option<&Document>,
    ) -> Result<DocumentStream> {
        let mut docs: Vec<Document> = self
            .documents(namespace)
            .await
            .into_iter()
            .filter(|doc| doc.get("_id").map_or(false, |id| range.contains(id)))
            .collect();
        docs.sort_by(|a, b| match (a.get("_id"), b.get("_id")) {
            (Some(x), Some(y)) => compare_bson(x, y),
            _ => Ordering::Equal,
        });
        Ok(into_stream(project(docs, projection)))
    }

    async fn scan_by_key(
        &self,
        namespace: &Namespace,
        key: &str,
        from: Option<&Bson>,
        projection: Option<&Document>,
    ) -> Result<DocumentStream> {
        let mut docs: Vec<Document> = self
            .documents(namespace)
            .await
            .into_iter()
            .filter(|doc| match (from, doc.get(key)) {
                (None, _) => true,
                // `$gte` only matches within the bound's type bracket.
                (Some(from), Some(value)) => {
                    same_type_bracket(value, from) && compare_bson(value, from) != Ordering::Less
                }
                (Some(_), None) => false,
            })
            .collect();
        // Documents without the key sort first, like nulls on the server.
        docs.sort_by(|a, b| match (a.get(key), b.get(key)) {
            (Some(x), Some(y)) => compare_bson(x, y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Ok(into_stream(project(docs, projection)))
    }

    async fn find_by_ids(
        &self,
        namespace: &Namespace,
        ids: &[Bson],
        projection: Option<&Document>,
    ) -> Result<Vec<Document>> {
        self.fetch_calls.fetch_add(1, AtomicOrdering::SeqCst);
        let docs = self
            .documents(namespace)
            .await
            .into_iter()
            .filter(|doc| doc.get("_id").map_or(false, |id| ids.contains(id)))
            .collect();
        Ok(project(docs, projection))
    }

    async fn read_oplog(
        &self,
        _namespace: &Namespace,
        from: OplogPosition,
        projection: &Document,
    ) -> Result<DocumentStream> {
        let entries: Vec<Document> = self
            .oplog
            .read()
            .await
            .iter()
            // Entries without a position are passed through for the reader to reject.
            .filter(|entry| LogEntry::position_of(entry).map_or(true, |p| p >= from))
            .map(|entry| apply_projection(entry, projection))
            .collect();
        Ok(into_stream(entries))
    }

    async fn earliest_oplog_position(&self) -> Result<Option<OplogPosition>> {
        Ok(self
            .oplog
            .read()
            .await
            .iter()
            .filter_map(LogEntry::position_of)
            .min())
    }

    async fn latest_oplog_position(&self) -> Result<Option<OplogPosition>> {
        Ok(self
            .oplog
            .read()
            .await
            .iter()
            .filter_map(LogEntry::position_of)
            .max())
    }

    async fn keep_alive(&self) -> Result<()> {
        self.keep_alive_calls.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Builds a raw oplog entry as the server records it.
pub fn oplog_entry(
    position: OplogPosition,
    op: &str,
    namespace: &Namespace,
    payload: Document,
) -> Document {
    let mut entry = Document::new();
    entry.insert("ts", Timestamp::from(position));
    entry.insert("op", op);
    entry.insert("ns", namespace.to_string());
    if op == "u" {
        let mut target = Document::new();
        if let Some(id) = payload.get("_id") {
            target.insert("_id", id.clone());
        }
        entry.insert("o2", target);
        let mut diff = payload;
        diff.remove("_id");
        let mut update = Document::new();
        update.insert("$set", diff);
        entry.insert("o", update);
    } else {
        entry.insert("o", payload);
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mongodb::bson::doc;
    use mongodb::bson::oid::ObjectId;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[tokio::test]
    async fn test_scan_ids_is_bounded_and_sorted() {
        let source = MemorySource::new();
        source
            .upsert(&ns(), (0..10).rev().map(|i| doc! { "_id": i, "n": i * 10 }))
            .await;

        assert_eq!(source.max_id(&ns()).await.unwrap(), Some(Bson::Int32(9)));

        let range = IdRange {
            max: Bson::Int32(7),
            min: Some(Bson::Int32(3)),
        };
        let docs: Vec<Document> = source
            .scan_ids(&ns(), &range, Some(&doc! { "n": 0 }))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<i32> = docs.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![3, 4, 5, 6, 7]);
        assert!(docs.iter().all(|d| !d.contains_key("n")));
    }

    #[tokio::test]
    async fn test_scan_ids_walks_mixed_types_in_index_order() {
        let source = MemorySource::new();
        let oid = ObjectId::parse_str("5f1e9b2c8e4b0a1d2c3b4a59").unwrap();
        source
            .upsert(
                &ns(),
                [
                    doc! { "_id": oid },
                    doc! { "_id": "b" },
                    doc! { "_id": 7 },
                    doc! { "_id": "a" },
                ],
            )
            .await;

        let max = source.max_id(&ns()).await.unwrap().unwrap();
        assert_eq!(max, Bson::ObjectId(oid));

        let range = IdRange {
            max,
            min: Some(Bson::String("b".to_string())),
        };
        let docs: Vec<Document> = source
            .scan_ids(&ns(), &range, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&Bson> = docs.iter().filter_map(|d| d.get("_id")).collect();
        assert_eq!(ids, vec![&Bson::String("b".to_string()), &Bson::ObjectId(oid)]);
    }

    #[tokio::test]
    async fn test_scan_by_key_matches_within_type_bracket() {
        let source = MemorySource::new();
        source
            .upsert(
                &ns(),
                [
                    doc! { "_id": 1, "k": 5 },
                    doc! { "_id": 2, "k": "x" },
                    doc! { "_id": 3, "k": 2 },
                ],
            )
            .await;

        let docs: Vec<Document> = source
            .scan_by_key(&ns(), "k", Some(&Bson::Int32(3)), None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(docs, vec![doc! { "_id": 1, "k": 5 }]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let source = MemorySource::new();
        source.upsert(&ns(), [doc! { "_id": 1, "v": "a" }]).await;
        source.upsert(&ns(), [doc! { "_id": 1, "v": "b" }]).await;

        let docs = source
            .find_by_ids(&ns(), &[Bson::Int32(1), Bson::Int32(2)], None)
            .await
            .unwrap();
        assert_eq!(docs, vec![doc! { "_id": 1, "v": "b" }]);
        assert_eq!(source.fetch_calls(), 1);

        source.remove(&ns(), &Bson::Int32(1)).await;
        assert_eq!(source.max_id(&ns()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oplog_positions() {
        let source = MemorySource::new();
        assert_eq!(source.latest_oplog_position().await.unwrap(), None);

        source
            .append_oplog([
                oplog_entry(OplogPosition::new(10, 1), "i", &ns(), doc! { "_id": 1 }),
                oplog_entry(OplogPosition::new(10, 2), "u", &ns(), doc! { "_id": 1, "v": 2 }),
                oplog_entry(OplogPosition::new(11, 1), "d", &ns(), doc! { "_id": 1 }),
            ])
            .await;

        assert_eq!(
            source.earliest_oplog_position().await.unwrap(),
            Some(OplogPosition::new(10, 1))
        );
        assert_eq!(
            source.latest_oplog_position().await.unwrap(),
            Some(OplogPosition::new(11, 1))
        );

        source.truncate_oplog_before(OplogPosition::new(10, 2)).await;
        let entries: Vec<Document> = source
            .read_oplog(&ns(), OplogPosition::new(0, 0), &doc! { "ts": 1, "op": 1, "o2": 1 })
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].get_document("o2").unwrap(), &doc! { "_id": 1 });
        assert!(!entries[0].contains_key("o"));
    }
}
