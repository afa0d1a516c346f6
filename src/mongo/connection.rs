use async_trait::async_trait;
use futures::future;
use futures::stream::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson, Document, Timestamp};
use mongodb::options::Hint;
use mongodb::{Client, Collection};
use std::cmp::Ordering;
use tracing::{debug, info};

use crate::config::Config;
use crate::mongo::{compare_bson, Namespace, OplogPosition};
use crate::sync::source::{DocumentSource, DocumentStream, IdRange};
use crate::{Error, Result};

const OPLOG_DATABASE: &str = "local";
const OPLOG_COLLECTION: &str = "oplog.rs";

/// [`DocumentSource`] backed by a live deployment.
pub struct MongoSource {
    client: Client,
}

impl MongoSource {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!(
            host = %config.mongodb.host,
            port = config.mongodb.port,
            replica_set = ?config.mongodb.replica_set,
            "Connecting to MongoDB"
        );
        let client = Client::with_options(config.client_options())?;
        let source = Self { client };
        source.keep_alive().await?;
        info!("Connected to MongoDB");
        Ok(source)
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn collection(&self, namespace: &Namespace) -> Collection<Document> {
        self.client
            .database(&namespace.database)
            .collection(&namespace.collection)
    }

    fn oplog(&self) -> Collection<Document> {
        self.client
            .database(OPLOG_DATABASE)
            .collection(OPLOG_COLLECTION)
    }

    async fn oplog_edge(&self, direction: i32) -> Result<Option<OplogPosition>> {
        let row = self
            .oplog()
            .find_one(doc! {})
            .sort(doc! { "$natural": direction })
            .projection(doc! { "ts": 1 })
            .await?;

        match row {
            None => Ok(None),
            Some(row) => row
                .get_timestamp("ts")
                .map(|ts| Some(OplogPosition::from(ts)))
                .map_err(|e| Error::InvalidLogEntry {
                    message: format!("oplog edge has no ts: {}", e),
                }),
        }
    }
}

fn into_stream(cursor: mongodb::Cursor<Document>) -> DocumentStream {
    cursor.map_err(Error::from).boxed()
}

#[async_trait]
impl DocumentSource for MongoSource {
    async fn max_id(&self, namespace: &Namespace) -> Result<Option<Bson>> {
        let row = self
            .collection(namespace)
            .find_one(doc! {})
            .sort(doc! { "_id": -1 })
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(row.and_then(|mut row| row.remove("_id")))
    }

    async fn scan_ids(
        &self,
        namespace: &Namespace,
        range: &IdRange,
        projection: Option<&Document>,
    ) -> Result<DocumentStream> {
        debug!(namespace = %namespace, range = %range, "Querying by _id range");

        // Walk the _id index between cursor bounds: a `$lte`/`$gte` filter
        // would skip ids whose type differs from the bound's.
        let collection = self.collection(namespace);
        let mut find = collection
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .hint(Hint::Keys(doc! { "_id": 1 }))
            .no_cursor_timeout(true);
        if let Some(lower) = range.lower_bound() {
            find = find.min(lower);
        }
        if let Some(projection) = projection {
            find = find.projection(projection.clone());
        }

        let max = range.max.clone();
        let rows = find
            .await?
            .map_err(Error::from)
            .try_take_while(move |row| {
                let within = row
                    .get("_id")
                    .map_or(false, |id| compare_bson(id, &max) != Ordering::Greater);
                future::ready(Ok(within))
            });
        Ok(rows.boxed())
    }

    async fn scan_by_key(
        &self,
        namespace: &Namespace,
        key: &str,
        from: Option<&Bson>,
        projection: Option<&Document>,
    ) -> Result<DocumentStream> {
        let mut filter = Document::new();
        if let Some(value) = from {
            filter.insert(key, doc! { "$gte": value.clone() });
        }
        let mut sort = Document::new();
        sort.insert(key, 1);
        debug!(namespace = %namespace, filter = %filter, "Querying by replication key");

        let collection = self.collection(namespace);
        let mut find = collection
            .find(filter)
            .sort(sort)
            .no_cursor_timeout(true);
        if let Some(projection) = projection {
            find = find.projection(projection.clone());
        }
        Ok(into_stream(find.await?))
    }

    async fn find_by_ids(
        &self,
        namespace: &Namespace,
        ids: &[Bson],
        projection: Option<&Document>,
    ) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let collection = self.collection(namespace);
        let mut find = collection.find(doc! { "_id": { "$in": ids.to_vec() } });
        if let Some(projection) = projection {
            find = find.projection(projection.clone());
        }
        Ok(find.await?.try_collect().await?)
    }

    async fn read_oplog(
        &self,
        namespace: &Namespace,
        from: OplogPosition,
        projection: &Document,
    ) -> Result<DocumentStream> {
        let filter = doc! {
            "ts": { "$gte": Timestamp::from(from) },
            "op": { "$in": ["i", "u", "d"] },
            "ns": namespace.to_string(),
        };
        debug!(namespace = %namespace, position = %from, "Querying oplog");

        let cursor = self
            .oplog()
            .find(filter)
            .sort(doc! { "$natural": 1 })
            .projection(projection.clone())
            .no_cursor_timeout(true)
            .await?;
        Ok(into_stream(cursor))
    }

    async fn earliest_oplog_position(&self) -> Result<Option<OplogPosition>> {
        self.oplog_edge(1).await
    }

    async fn latest_oplog_position(&self) -> Result<Option<OplogPosition>> {
        self.oplog_edge(-1).await
    }

    async fn keep_alive(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        debug!("Sent keep-alive ping");
        Ok(())
    }
}
