//! The three replication strategies and the context they share.

pub mod full_table;
pub mod incremental;
pub mod memory;
pub mod oplog;
pub mod source;

use chrono::Utc;
use mongodb::bson::Document;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::bookmarks::{Bookmark, State};
use crate::catalog::CatalogEntry;
use crate::checkpoint::CheckpointManager;
use crate::config::ReplicationConfig;
use crate::mongo::{row_to_record, Namespace, SchemaAccumulator};
use crate::output::{Message, MessageSink};
use crate::stats::SyncStats;
use crate::Result;

pub use memory::MemorySource;
pub use source::{DocumentSource, DocumentStream, IdRange};

/// Mints a generation id: wall-clock milliseconds.
pub fn new_version() -> i64 {
    Utc::now().timestamp_millis()
}

/// Everything a strategy reads and writes while syncing one stream.
pub struct SyncContext<'a> {
    pub source: &'a dyn DocumentSource,
    pub sink: &'a mut dyn MessageSink,
    pub state: &'a mut State,
    pub settings: &'a ReplicationConfig,
    /// Write-through target for checkpoints, if a state file is configured.
    pub checkpoints: Option<&'a CheckpointManager>,
    pub stats: &'a mut SyncStats,
}

impl<'a> SyncContext<'a> {
    pub async fn emit(&mut self, message: Message) -> Result<()> {
        self.sink.send(message).await
    }

    pub fn bookmark(&mut self, stream_id: &str) -> &mut Bookmark {
        self.state.bookmark_mut(stream_id)
    }

    /// Emits a STATE message carrying a snapshot of the current state.
    pub async fn checkpoint(&mut self) -> Result<()> {
        let snapshot = self.state.clone();
        if let Some(checkpoints) = self.checkpoints {
            checkpoints.save(&snapshot).await?;
        }
        self.sink.send(Message::State { value: snapshot }).await?;
        debug!("Checkpoint written");
        Ok(())
    }

    /// Folds `row` into the stream schema, re-emitting it on change, then
    /// emits the transformed row as a RECORD.
    pub async fn emit_record(
        &mut self,
        target: &mut SyncTarget,
        row: &Document,
        version: Option<i64>,
    ) -> Result<()> {
        let started = Instant::now();
        let changed = target.schema.observe(row);
        self.stats
            .record_schema_inference(&target.stream_id, started.elapsed(), changed);
        if changed {
            self.emit(Message::schema(&target.destination, target.schema.schema()))
                .await?;
        }

        let record = row_to_record(&target.stream_id, row)?;
        self.emit(Message::record(&target.destination, record, version))
            .await?;
        self.stats.record_rows(&target.stream_id, 1);
        Ok(())
    }
}

/// The resolved description of the stream being synced.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    /// Bookmark key.
    pub stream_id: String,
    /// Stream name on output messages.
    pub destination: String,
    pub namespace: Namespace,
    pub projection: Option<Document>,
    pub replication_key: Option<String>,
    pub schema: SchemaAccumulator,
}

impl SyncTarget {
    pub fn from_entry(entry: &CatalogEntry, settings: &ReplicationConfig) -> Result<Self> {
        Ok(Self {
            stream_id: entry.tap_stream_id.clone(),
            destination: entry
                .destination_name(settings.include_schemas_in_destination_stream_name)?,
            namespace: entry.namespace()?,
            projection: entry.projection()?,
            replication_key: entry.replication_key().map(str::to_string),
            schema: SchemaAccumulator::new(&entry.schema),
        })
    }
}

/// Time-gated keep-alive for long cursors.
pub struct KeepAlive {
    interval: Duration,
    last: Instant,
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Pings the source when `interval` has passed since the last ping.
    pub async fn tick(&mut self, source: &dyn DocumentSource) -> Result<bool> {
        if self.last.elapsed() < self.interval {
            return Ok(false);
        }
        source.keep_alive().await?;
        self.last = Instant::now();
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::output::MemorySink;

    /// Owns everything a [`SyncContext`] borrows.
    pub(crate) struct Harness {
        pub source: MemorySource,
        pub sink: MemorySink,
        pub state: State,
        pub settings: ReplicationConfig,
        pub stats: SyncStats,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                source: MemorySource::new(),
                sink: MemorySink::new(),
                state: State::new(),
                settings: ReplicationConfig::default(),
                stats: SyncStats::new(),
            }
        }

        pub fn ctx(&mut self) -> SyncContext<'_> {
            SyncContext {
                source: &self.source,
                sink: &mut self.sink,
                state: &mut self.state,
                settings: &self.settings,
                checkpoints: None,
                stats: &mut self.stats,
            }
        }
    }

    pub(crate) fn target(namespace: Namespace) -> SyncTarget {
        SyncTarget {
            stream_id: format!("{}-{}", namespace.database, namespace.collection),
            destination: namespace.collection.clone(),
            namespace,
            projection: None,
            replication_key: None,
            schema: SchemaAccumulator::default(),
        }
    }

    /// Message kinds in order, for compact assertions.
    pub(crate) fn kinds(messages: &[Message]) -> Vec<&'static str> {
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
}
