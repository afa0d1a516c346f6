//! Snapshot-bounded, resumable scan of a whole collection in `_id` order.

use futures::StreamExt;
use tokio::time::Instant;
use tracing::info;

use super::{new_version, IdRange, KeepAlive, SyncContext, SyncTarget};
use crate::bookmarks::{
    INITIAL_FULL_TABLE_COMPLETE, LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE, MAX_ID_TYPE, MAX_ID_VALUE,
};
use crate::output::Message;
use crate::Result;

/// Emits every document up to the bookmarked (or current) maximum `_id`.
///
/// A fresh generation announces its version before the first record; a
/// resumed one only at the end. Bounds are cleared and
/// `initial_full_table_complete` set once the scan finishes.
pub async fn sync_collection(ctx: &mut SyncContext<'_>, target: &mut SyncTarget) -> Result<()> {
    let stream_id = target.stream_id.clone();
    let started = Instant::now();

    let bookmark = ctx.bookmark(&stream_id);
    let was_interrupted = bookmark.contains(LAST_ID_FETCHED);
    let version = match bookmark.version() {
        Some(version) if was_interrupted => version,
        _ => new_version(),
    };
    bookmark.set_version(version);
    ctx.checkpoint().await?;

    if !was_interrupted {
        ctx.emit(Message::activate_version(&target.destination, version))
            .await?;
    }

    let max_id = match ctx.bookmark(&stream_id).typed(MAX_ID_VALUE, MAX_ID_TYPE)? {
        Some(max_id) => Some(max_id),
        None => {
            let max_id = ctx.source.max_id(&target.namespace).await?;
            if let Some(max_id) = &max_id {
                ctx.bookmark(&stream_id)
                    .set_typed(MAX_ID_VALUE, MAX_ID_TYPE, max_id)?;
            }
            max_id
        }
    };

    let mut rows_saved: u64 = 0;
    match max_id {
        None => info!(stream = %stream_id, "Collection is empty, nothing to scan"),
        Some(max_id) => {
            let range = IdRange {
                max: max_id,
                min: ctx
                    .bookmark(&stream_id)
                    .typed(LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE)?,
            };
            info!(
                stream = %stream_id,
                range = %range,
                resumed = was_interrupted,
                "Querying collection"
            );

            let period = ctx.settings.update_bookmark_period.max(1) as u64;
            let mut keep_alive = KeepAlive::new(ctx.settings.keepalive_interval());
            let mut rows = ctx
                .source
                .scan_ids(&target.namespace, &range, target.projection.as_ref())
                .await?;

            while let Some(row) = rows.next().await {
                let row = row?;
                ctx.emit_record(target, &row, Some(version)).await?;
                rows_saved += 1;

                if let Some(id) = row.get("_id") {
                    ctx.bookmark(&stream_id)
                        .set_typed(LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE, id)?;
                }
                if rows_saved % period == 0 {
                    ctx.checkpoint().await?;
                }
                keep_alive.tick(ctx.source).await?;
            }
        }
    }

    let bookmark = ctx.bookmark(&stream_id);
    for key in [MAX_ID_VALUE, MAX_ID_TYPE, LAST_ID_FETCHED, LAST_ID_FETCHED_TYPE] {
        bookmark.clear(key);
    }
    bookmark.set(INITIAL_FULL_TABLE_COMPLETE, true);
    ctx.checkpoint().await?;

    ctx.emit(Message::activate_version(&target.destination, version))
        .await?;

    let elapsed = started.elapsed();
    ctx.stats.record_sync_time(&stream_id, elapsed);
    info!(
        stream = %stream_id,
        rows = rows_saved,
        elapsed_secs = elapsed.as_secs_f64(),
        "Finished full table sync"
    );
    Ok(())
}
