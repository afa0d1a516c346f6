#![allow(dead_code)]

use mongo_capture::bookmarks::State;
use mongo_capture::catalog::{Catalog, CatalogEntry};
use mongo_capture::config::ReplicationConfig;
use mongo_capture::mongo::{Namespace, OplogPosition};
use mongo_capture::output::{MemorySink, Message};
use mongo_capture::sync::MemorySource;
use mongo_capture::Replicator;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Document};
use serde_json::{json, Value};

pub type TestReplicator = Replicator<MemorySource, MemorySink>;

pub fn ns(collection: &str) -> Namespace {
    Namespace::new("shop", collection)
}

pub fn pos(time: u32, inc: u32) -> OplogPosition {
    OplogPosition::new(time, inc)
}

/// Catalog entry for `shop.<collection>` with stream id `shop-<collection>`.
pub fn stream(collection: &str, method: &str) -> StreamBuilder {
    StreamBuilder {
        collection: collection.to_string(),
        metadata: json!({
            "selected": true,
            "replication-method": method,
            "database-name": "shop",
        }),
    }
}

pub struct StreamBuilder {
    collection: String,
    metadata: Value,
}

impl StreamBuilder {
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.metadata[key] = value;
        self
    }

    pub fn build(self) -> CatalogEntry {
        serde_json::from_value(json!({
            "tap_stream_id": format!("shop-{}", self.collection),
            "table_name": self.collection,
            "stream": self.collection,
            "schema": { "type": "object" },
            "metadata": [{ "breadcrumb": [], "metadata": self.metadata }]
        }))
        .expect("valid catalog entry")
    }
}

pub fn catalog(entries: Vec<CatalogEntry>) -> Catalog {
    Catalog { streams: entries }
}

pub fn settings() -> ReplicationConfig {
    ReplicationConfig::default()
}

pub fn replicator(source: MemorySource) -> TestReplicator {
    Replicator::new(settings(), source, MemorySink::new())
}

/// `count` documents with ascending ObjectIds, as inserts would create them.
pub fn object_id_docs(count: usize) -> Vec<Document> {
    let mut ids: Vec<ObjectId> = (0..count).map(|_| ObjectId::new()).collect();
    ids.sort_by_key(|id| id.bytes());
    ids.into_iter()
        .enumerate()
        .map(|(i, id)| doc! { "_id": id, "n": i as i32 })
        .collect()
}

/// Message kinds in order.
pub fn kinds(messages: &[Message]) -> Vec<&'static str> {
    messages
        .iter()
        .map(|m| match m {
            Message::Schema { .. } => "SCHEMA",
            Message::Record { .. } => "RECORD",
            Message::ActivateVersion { .. } => "ACTIVATE_VERSION",
            Message::State { .. } => "STATE",
        })
        .collect()
}

/// Every STATE value emitted, in order.
pub fn states(messages: &[Message]) -> Vec<&State> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::State { value } => Some(value),
            _ => None,
        })
        .collect()
}

pub fn count_kind(messages: &[Message], kind: &str) -> usize {
    kinds(messages).into_iter().filter(|k| *k == kind).count()
}
