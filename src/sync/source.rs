use async_trait::async_trait;
use futures::stream::BoxStream;
use mongodb::bson::{doc, Bson, Document};
use std::cmp::Ordering;
use std::fmt;

use crate::mongo::{compare_bson, Namespace, OplogPosition};
use crate::Result;

/// Documents in the order the query asked for.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// Identifier bounds of a full scan: `min <= _id <= max` in index order.
///
/// Ids of different types compare by type bracket first, so a range whose
/// ends are an ObjectId and a string still covers both kinds of document.
#[derive(Debug, Clone, PartialEq)]
pub struct IdRange {
    pub max: Bson,
    /// Resume point; inclusive so the last acknowledged document is re-read.
    pub min: Option<Bson>,
}

impl IdRange {
    pub fn contains(&self, id: &Bson) -> bool {
        compare_bson(id, &self.max) != Ordering::Greater
            && self
                .min
                .as_ref()
                .map_or(true, |min| compare_bson(id, min) != Ordering::Less)
    }

    /// Inclusive lower index bound for a cursor walking `{_id: 1}`.
    pub fn lower_bound(&self) -> Option<Document> {
        self.min.as_ref().map(|min| doc! { "_id": min.clone() })
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.min {
            Some(min) => write!(f, "{} <= _id <= {}", min, self.max),
            None => write!(f, "_id <= {}", self.max),
        }
    }
}

/// Everything the engine reads from the database.
///
/// Implementations own their connection; the engine holds `&dyn
/// DocumentSource` and processes one stream at a time.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Largest `_id` in the collection, `None` when it is empty.
    async fn max_id(&self, namespace: &Namespace) -> Result<Option<Bson>>;

    /// Documents within `range`, ascending by `_id` across types.
    async fn scan_ids(
        &self,
        namespace: &Namespace,
        range: &IdRange,
        projection: Option<&Document>,
    ) -> Result<DocumentStream>;

    /// Documents with `key >= from` (all documents when `from` is `None`),
    /// ascending by `key`.
    async fn scan_by_key(
        &self,
        namespace: &Namespace,
        key: &str,
        from: Option<&Bson>,
        projection: Option<&Document>,
    ) -> Result<DocumentStream>;

    /// Current versions of the given documents. Missing ids are skipped.
    async fn find_by_ids(
        &self,
        namespace: &Namespace,
        ids: &[Bson],
        projection: Option<&Document>,
    ) -> Result<Vec<Document>>;

    /// Oplog entries for `namespace` at or after `from`, in log order.
    async fn read_oplog(
        &self,
        namespace: &Namespace,
        from: OplogPosition,
        projection: &Document,
    ) -> Result<DocumentStream>;

    async fn earliest_oplog_position(&self) -> Result<Option<OplogPosition>>;

    async fn latest_oplog_position(&self) -> Result<Option<OplogPosition>>;

    /// Cheap round trip that keeps the session of a long scan alive.
    async fn keep_alive(&self) -> Result<()>;
}
