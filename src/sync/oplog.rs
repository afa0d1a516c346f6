//! Oplog tailing for LOG_BASED streams.
//!
//! Changes are staged in a [`ChangeBuffer`] keyed by document identity and
//! emitted in log order when the buffer is flushed: inserts from their log
//! payload, updates re-fetched from the collection, deletes as tombstones.
//! A delete replaces whatever is staged for the document. Checkpoints are
//! only written right after a flush.

use futures::StreamExt;
use mongodb::bson::{Bson, Document, Timestamp};
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{new_version, KeepAlive, SyncContext, SyncTarget};
use crate::mongo::{
    apply_projection, oplog_projection, LogEntry, OplogOp, OplogPosition, SDC_DELETED_AT,
};
use crate::output::Message;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Pending {
    /// Full document taken from an insert entry.
    Inserted(Document),
    /// Identifier whose current version must be fetched.
    Updated(Bson),
    /// Tombstone for a removed document.
    Deleted(Document),
}

/// Pending changes, at most one per document, in first-seen order.
#[derive(Debug, Default)]
pub struct ChangeBuffer {
    order: Vec<String>,
    entries: HashMap<String, Pending>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(id: &Bson) -> String {
        id.clone().into_canonical_extjson().to_string()
    }

    fn stage(&mut self, id: &Bson, change: Pending) {
        let key = Self::key(id);
        if self.entries.insert(key.clone(), change).is_none() {
            self.order.push(key);
        }
    }

    pub fn stage_insert(&mut self, id: &Bson, document: Document) {
        self.stage(id, Pending::Inserted(document));
    }

    /// An update supersedes a staged insert: the fetch returns the newer state.
    pub fn stage_update(&mut self, id: &Bson) {
        self.stage(id, Pending::Updated(id.clone()));
    }

    /// Replaces whatever is staged for `id` with its tombstone, placed at
    /// the delete's position in the log. Returns `true` if something was
    /// staged before.
    pub fn stage_delete(&mut self, id: &Bson, tombstone: Document) -> bool {
        let key = Self::key(id);
        let superseded = self.entries.remove(&key).is_some();
        if superseded {
            self.order.retain(|k| k != &key);
        }
        self.entries.insert(key.clone(), Pending::Deleted(tombstone));
        self.order.push(key);
        superseded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain(&mut self) -> Vec<Pending> {
        let mut entries = std::mem::take(&mut self.entries);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }
}

/// Emits everything staged in `buffer`, re-fetching updated documents in a
/// single round trip. Documents deleted since are skipped.
async fn flush(
    ctx: &mut SyncContext<'_>,
    target: &mut SyncTarget,
    buffer: &mut ChangeBuffer,
    version: i64,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let pending = buffer.drain();

    let ids: Vec<Bson> = pending
        .iter()
        .filter_map(|change| match change {
            Pending::Updated(id) => Some(id.clone()),
            Pending::Inserted(_) | Pending::Deleted(_) => None,
        })
        .collect();
    let mut current: HashMap<String, Document> = HashMap::new();
    if !ids.is_empty() {
        let fetched = ctx
            .source
            .find_by_ids(&target.namespace, &ids, target.projection.as_ref())
            .await?;
        for doc in fetched {
            if let Some(id) = doc.get("_id") {
                current.insert(ChangeBuffer::key(id), doc);
            }
        }
    }

    debug!(
        stream = %target.stream_id,
        staged = pending.len(),
        fetched = current.len(),
        "Flushing change buffer"
    );
    for change in pending {
        match change {
            Pending::Inserted(doc) | Pending::Deleted(doc) => {
                ctx.emit_record(target, &doc, Some(version)).await?
            }
            Pending::Updated(id) => match current.remove(&ChangeBuffer::key(&id)) {
                Some(doc) => ctx.emit_record(target, &doc, Some(version)).await?,
                None => debug!(
                    stream = %target.stream_id,
                    id = %id,
                    "Updated document no longer exists, skipping"
                ),
            },
        }
    }
    Ok(())
}

fn project(target: &SyncTarget, payload: Document) -> Document {
    match &target.projection {
        Some(projection) => apply_projection(&payload, projection),
        None => payload,
    }
}

/// Tails the oplog from the stream's bookmarked position to the current
/// end of the log.
pub async fn sync_collection(ctx: &mut SyncContext<'_>, target: &mut SyncTarget) -> Result<()> {
    let stream_id = target.stream_id.clone();
    let started = Instant::now();

    let bookmark = ctx.bookmark(&stream_id);
    let start = bookmark
        .oplog_position()
        .ok_or_else(|| Error::Assertion {
            message: format!("stream {} has no oplog position to resume from", stream_id),
        })?;
    let version = match bookmark.version() {
        Some(version) => version,
        None => {
            let version = new_version();
            bookmark.set_version(version);
            version
        }
    };

    ctx.emit(Message::activate_version(&target.destination, version))
        .await?;

    let namespace = target.namespace.to_string();
    info!(stream = %stream_id, position = %start, "Starting oplog sync");

    let projection = oplog_projection(target.projection.as_ref());
    let mut entries = ctx
        .source
        .read_oplog(&target.namespace, start, &projection)
        .await?;

    let period = ctx.settings.update_bookmark_period.max(1);
    let capacity = ctx.settings.max_update_buffer_length.max(1);
    let mut keep_alive = KeepAlive::new(ctx.settings.keepalive_interval());
    let mut buffer = ChangeBuffer::new();
    let mut rows_since_checkpoint = 0usize;
    let mut entries_read: u64 = 0;

    while let Some(raw) = entries.next().await {
        let raw = raw?;
        entries_read += 1;

        let Some(position) = LogEntry::position_of(&raw) else {
            warn!(stream = %stream_id, "Skipping oplog entry without ts");
            continue;
        };
        let bookmarked = ctx.bookmark(&stream_id).oplog_position().unwrap_or(start);
        if position < start || position < bookmarked {
            return Err(Error::Assertion {
                message: format!(
                    "oplog entry at {} precedes the resume position {} (bookmark {})",
                    position, start, bookmarked
                ),
            });
        }

        match LogEntry::from_document(raw) {
            Err(e) => warn!(
                stream = %stream_id,
                position = %position,
                error = %e,
                "Skipping malformed oplog entry"
            ),
            Ok(entry) if entry.namespace != namespace => {}
            Ok(entry) => {
                if apply_entry(ctx, target, &mut buffer, entry, version).await? {
                    rows_since_checkpoint += 1;
                }
            }
        }

        ctx.bookmark(&stream_id).set_oplog_position(position);

        if buffer.len() >= capacity {
            flush(ctx, target, &mut buffer, version).await?;
        }
        if rows_since_checkpoint >= period {
            flush(ctx, target, &mut buffer, version).await?;
            ctx.checkpoint().await?;
            rows_since_checkpoint = 0;
        }
        keep_alive.tick(ctx.source).await?;
    }

    flush(ctx, target, &mut buffer, version).await?;
    ctx.checkpoint().await?;
    ctx.emit(Message::activate_version(&target.destination, version))
        .await?;

    let elapsed = started.elapsed();
    ctx.stats.record_sync_time(&stream_id, elapsed);
    info!(
        stream = %stream_id,
        entries = entries_read,
        position = ?ctx.bookmark(&stream_id).oplog_position(),
        elapsed_secs = elapsed.as_secs_f64(),
        "Finished oplog sync"
    );
    Ok(())
}

/// Applies one entry of the stream's namespace. Returns `true` when the
/// entry counts towards the checkpoint period.
async fn apply_entry(
    ctx: &mut SyncContext<'_>,
    target: &mut SyncTarget,
    buffer: &mut ChangeBuffer,
    entry: LogEntry,
    version: i64,
) -> Result<bool> {
    let Some(id) = entry.document_id.clone() else {
        info!(stream = %target.stream_id, op = ?entry.op, "Skipping oplog entry");
        return Ok(false);
    };

    match entry.op {
        OplogOp::Insert => {
            buffer.stage_insert(&id, project(target, entry.payload));
        }
        OplogOp::Update => {
            buffer.stage_update(&id);
        }
        OplogOp::Delete => {
            let mut tombstone = project(target, entry.payload);
            tombstone.insert("_id", id.clone());
            tombstone.insert(SDC_DELETED_AT, Timestamp::from(entry.position));
            if buffer.stage_delete(&id, tombstone) {
                debug!(stream = %target.stream_id, id = %id, "Delete supersedes staged change");
            }
        }
        OplogOp::Other(code) => {
            info!(stream = %target.stream_id, op = %code, "Skipping oplog entry");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Position of the newest oplog entry, used as the starting point of a
/// LOG_BASED stream before its initial full scan.
pub async fn latest_position(ctx: &SyncContext<'_>) -> Result<OplogPosition> {
    ctx.source
        .latest_oplog_position()
        .await?
        .ok_or_else(|| Error::OplogUnavailable {
            message: "local.oplog.rs is empty or missing; LOG_BASED replication needs a replica set"
                .to_string(),
        })
}
