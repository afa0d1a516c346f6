use tracing::{info, warn};

use crate::bookmarks::{bookmark_keys, State, LAST_REPLICATION_METHOD, REPLICATION_KEY_NAME};
use crate::catalog::{Catalog, CatalogEntry, ReplicationMethod};
use crate::checkpoint::CheckpointManager;
use crate::config::ReplicationConfig;
use crate::output::{Message, MessageSink};
use crate::scheduler::streams_to_sync;
use crate::stats::SyncStats;
use crate::sync::{full_table, incremental, oplog, DocumentSource, SyncContext, SyncTarget};
use crate::{Error, Result};

/// Drives one sync run: schedules the selected streams and runs the
/// matching strategy for each, one stream at a time.
pub struct Replicator<S, K> {
    settings: ReplicationConfig,
    source: S,
    sink: K,
    checkpoints: Option<CheckpointManager>,
    stats: SyncStats,
}

impl<S: DocumentSource, K: MessageSink> Replicator<S, K> {
    /// Checkpoints are written through to `settings.state_file` when set.
    pub fn new(settings: ReplicationConfig, source: S, sink: K) -> Self {
        let checkpoints = settings.state_file.as_ref().map(CheckpointManager::new);
        Self {
            settings,
            source,
            sink,
            checkpoints,
            stats: SyncStats::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Checks every selected stream's configuration without touching state.
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        for entry in catalog.streams.iter().filter(|e| e.is_selected()) {
            resolve(entry, &self.settings)?;
        }
        Ok(())
    }

    /// Syncs every selected stream, mutating `state` in place.
    pub async fn run(&mut self, catalog: &Catalog, state: &mut State) -> Result<()> {
        self.validate(catalog)?;

        let streams = streams_to_sync(&catalog.streams, state);
        info!(
            streams = streams.len(),
            currently_syncing = ?state.currently_syncing,
            "Starting sync"
        );

        for entry in streams {
            self.sync_stream(entry, state).await?;
        }

        self.stats.log_summary();
        self.sink.flush().await?;
        Ok(())
    }

    fn context<'a>(&'a mut self, state: &'a mut State) -> SyncContext<'a> {
        SyncContext {
            source: &self.source,
            sink: &mut self.sink,
            state,
            settings: &self.settings,
            checkpoints: self.checkpoints.as_ref(),
            stats: &mut self.stats,
        }
    }

    async fn sync_stream(&mut self, entry: &CatalogEntry, state: &mut State) -> Result<()> {
        let (method, mut target) = resolve(entry, &self.settings)?;
        let stream_id = target.stream_id.clone();
        info!(
            stream = %stream_id,
            method = %method,
            namespace = %target.namespace,
            "Syncing stream"
        );

        state.whitelist_bookmark_keys(&stream_id, bookmark_keys(method));
        clear_state_on_replication_change(state, &stream_id, method, target.replication_key.as_deref());
        record_replication_method(state, &stream_id, method, target.replication_key.as_deref());
        state.set_currently_syncing(Some(&stream_id));

        let mut ctx = self.context(state);
        ctx.checkpoint().await?;
        ctx.emit(Message::schema(&target.destination, target.schema.schema()))
            .await?;

        match method {
            ReplicationMethod::LogBased => {
                if missing_oplog_position(ctx.state, &stream_id)
                    || oplog_has_aged_out(&mut ctx, &stream_id).await?
                {
                    ctx.state.reset_stream(&stream_id);
                    record_replication_method(ctx.state, &stream_id, method, None);
                }
                if !ctx.bookmark(&stream_id).initial_full_table_complete() {
                    info!(
                        stream = %stream_id,
                        "Must complete full table sync before starting oplog replication"
                    );
                    if ctx.bookmark(&stream_id).oplog_position().is_none() {
                        let position = oplog::latest_position(&ctx).await?;
                        info!(stream = %stream_id, position = %position, "Captured oplog start position");
                        ctx.bookmark(&stream_id).set_oplog_position(position);
                    }
                    full_table::sync_collection(&mut ctx, &mut target).await?;
                }
                oplog::sync_collection(&mut ctx, &mut target).await?;
            }
            ReplicationMethod::FullTable => {
                full_table::sync_collection(&mut ctx, &mut target).await?;
            }
            ReplicationMethod::Incremental => {
                incremental::sync_collection(&mut ctx, &mut target).await?;
            }
        }

        ctx.state.set_currently_syncing(None);
        ctx.checkpoint().await?;
        Ok(())
    }
}

/// Method and target for a stream, or the configuration error that keeps
/// it from syncing.
fn resolve(entry: &CatalogEntry, settings: &ReplicationConfig) -> Result<(ReplicationMethod, SyncTarget)> {
    let method = entry.replication_method()?;
    if method == ReplicationMethod::LogBased && entry.is_view() {
        return Err(Error::Config(format!(
            "stream {} is a view and cannot be replicated LOG_BASED",
            entry.tap_stream_id
        )));
    }
    let target = SyncTarget::from_entry(entry, settings)?;
    if method == ReplicationMethod::Incremental && target.replication_key.is_none() {
        return Err(Error::Config(format!(
            "stream {} is INCREMENTAL but has no replication-key",
            entry.tap_stream_id
        )));
    }
    Ok((method, target))
}

/// Drops the stream's bookmark when its method, or its INCREMENTAL
/// replication key, differs from the previous run.
fn clear_state_on_replication_change(
    state: &mut State,
    stream_id: &str,
    method: ReplicationMethod,
    replication_key: Option<&str>,
) {
    let Some(bookmark) = state.bookmark(stream_id) else {
        return;
    };

    if let Some(last_method) = bookmark.get_str(LAST_REPLICATION_METHOD) {
        if last_method != method.as_str() {
            info!(
                stream = %stream_id,
                from = %last_method,
                to = %method,
                "Replication method changed, will re-replicate entire collection"
            );
            state.reset_stream(stream_id);
            return;
        }
    }

    if method == ReplicationMethod::Incremental {
        if let Some(last_key) = bookmark.get_str(REPLICATION_KEY_NAME) {
            if Some(last_key) != replication_key {
                info!(
                    stream = %stream_id,
                    from = %last_key,
                    to = ?replication_key,
                    "Replication key changed, will re-replicate entire collection"
                );
                state.reset_stream(stream_id);
            }
        }
    }
}

fn record_replication_method(
    state: &mut State,
    stream_id: &str,
    method: ReplicationMethod,
    replication_key: Option<&str>,
) {
    let bookmark = state.bookmark_mut(stream_id);
    if method == ReplicationMethod::Incremental {
        if let Some(key) = replication_key {
            bookmark.set(REPLICATION_KEY_NAME, key);
        }
    }
    bookmark.set(LAST_REPLICATION_METHOD, method.as_str());
}

/// True when a finished initial scan left no complete position to tail from.
fn missing_oplog_position(state: &State, stream_id: &str) -> bool {
    let Some(bookmark) = state.bookmark(stream_id) else {
        return false;
    };
    if bookmark.initial_full_table_complete() && bookmark.oplog_position().is_none() {
        warn!(
            stream = %stream_id,
            "No oplog position for a completed stream, will re-replicate entire collection"
        );
        return true;
    }
    false
}

/// True when the oplog no longer reaches back to the stream's position.
async fn oplog_has_aged_out(ctx: &mut SyncContext<'_>, stream_id: &str) -> Result<bool> {
    let Some(bookmarked) = ctx.bookmark(stream_id).oplog_position() else {
        return Ok(false);
    };
    let Some(earliest) = ctx.source.earliest_oplog_position().await? else {
        return Ok(false);
    };
    if earliest > bookmarked {
        warn!(
            stream = %stream_id,
            bookmarked = %bookmarked,
            earliest = %earliest,
            "Clearing state because the oplog has aged out"
        );
        return Ok(true);
    }
    Ok(false)
}
