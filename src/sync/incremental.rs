//! Key-ordered scans for INCREMENTAL streams.

use futures::StreamExt;
use mongodb::bson::Bson;
use tokio::time::Instant;
use tracing::info;

use super::{new_version, KeepAlive, SyncContext, SyncTarget};
use crate::bookmarks::{REPLICATION_KEY_TYPE, REPLICATION_KEY_VALUE};
use crate::output::Message;
use crate::{Error, Result};

/// Emits every document whose replication key is at or past the bookmark,
/// in key order. The boundary row is re-emitted on every run.
pub async fn sync_collection(ctx: &mut SyncContext<'_>, target: &mut SyncTarget) -> Result<()> {
    let stream_id = target.stream_id.clone();
    let started = Instant::now();
    let key = target.replication_key.clone().ok_or_else(|| {
        Error::Config(format!(
            "stream {} is INCREMENTAL but has no replication-key",
            stream_id
        ))
    })?;

    let bookmark = ctx.bookmark(&stream_id);
    let (version, first_run) = match bookmark.version() {
        Some(version) => (version, false),
        None => (new_version(), true),
    };
    bookmark.set_version(version);
    let from = bookmark.typed(REPLICATION_KEY_VALUE, REPLICATION_KEY_TYPE)?;

    if first_run {
        ctx.emit(Message::activate_version(&target.destination, version))
            .await?;
    }
    ctx.checkpoint().await?;

    info!(
        stream = %stream_id,
        replication_key = %key,
        from = ?from,
        "Querying collection by replication key"
    );
    let mut rows = ctx
        .source
        .scan_by_key(&target.namespace, &key, from.as_ref(), target.projection.as_ref())
        .await?;

    let period = ctx.settings.update_bookmark_period.max(1) as u64;
    let mut keep_alive = KeepAlive::new(ctx.settings.keepalive_interval());
    let mut rows_saved: u64 = 0;

    while let Some(row) = rows.next().await {
        let row = row?;
        ctx.emit_record(target, &row, Some(version)).await?;
        rows_saved += 1;

        match row.get(&key) {
            Some(Bson::Null) | None => {}
            Some(value) => {
                ctx.bookmark(&stream_id)
                    .set_typed(REPLICATION_KEY_VALUE, REPLICATION_KEY_TYPE, value)?;
            }
        }
        if rows_saved % period == 0 {
            ctx.checkpoint().await?;
        }
        keep_alive.tick(ctx.source).await?;
    }

    ctx.checkpoint().await?;

    let elapsed = started.elapsed();
    ctx.stats.record_sync_time(&stream_id, elapsed);
    info!(
        stream = %stream_id,
        rows = rows_saved,
        elapsed_secs = elapsed.as_secs_f64(),
        "Finished incremental sync"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mongo::Namespace;
    use crate::sync::test_support::{kinds, target, Harness};
    use mongodb::bson::{doc, DateTime};
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("shop", "orders")
    }

    fn keyed_target() -> SyncTarget {
        let mut t = target(ns());
        t.replication_key = Some("updated_at".to_string());
        t
    }

    fn ids(h: &Harness) -> Vec<i64> {
        h.sink
            .records("orders")
            .iter()
            .map(|r| r["_id"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_first_run_activates_and_bookmarks_max_key() {
        let mut h = Harness::new();
        h.source
            .upsert(
                &ns(),
                [
                    doc! { "_id": 1, "updated_at": DateTime::from_millis(3_000) },
                    doc! { "_id": 2, "updated_at": DateTime::from_millis(1_000) },
                    doc! { "_id": 3 },
                    doc! { "_id": 4, "updated_at": DateTime::from_millis(2_000) },
                ],
            )
            .await;
        let mut t = keyed_target();

        sync_collection(&mut h.ctx(), &mut t).await.unwrap();

        assert_eq!(ids(&h), vec![3, 2, 4, 1]);
        assert_eq!(
            kinds(h.sink.messages())[..2],
            ["ACTIVATE_VERSION", "STATE"]
        );
        let bookmark = h.state.bookmark("shop-orders").unwrap();
        assert_eq!(
            bookmark.typed(REPLICATION_KEY_VALUE, REPLICATION_KEY_TYPE).unwrap(),
            Some(Bson::DateTime(DateTime::from_millis(3_000)))
        );
        assert_eq!(
            serde_json::to_value(bookmark).unwrap()[REPLICATION_KEY_TYPE],
            json!("datetime")
        );
    }

    #[tokio::test]
    async fn test_resume_is_inclusive_and_keeps_version() {
        let mut h = Harness::new();
        h.source
            .upsert(&ns(), (1..=5).map(|i| doc! { "_id": i, "updated_at": i * 10 }))
            .await;
        let bookmark = h.state.bookmark_mut("shop-orders");
        bookmark.set_version(42);
        bookmark
            .set_typed(REPLICATION_KEY_VALUE, REPLICATION_KEY_TYPE, &Bson::Int32(30))
            .unwrap();
        let mut t = keyed_target();

        sync_collection(&mut h.ctx(), &mut t).await.unwrap();

        assert_eq!(ids(&h), vec![3, 4, 5]);
        assert!(!kinds(h.sink.messages()).contains(&"ACTIVATE_VERSION"));
        assert_eq!(
            h.state
                .bookmark("shop-orders")
                .unwrap()
                .typed(REPLICATION_KEY_VALUE, REPLICATION_KEY_TYPE)
                .unwrap(),
            Some(Bson::Int32(50))
        );
    }

    #[tokio::test]
    async fn test_missing_replication_key_is_configuration_error() {
        let mut h = Harness::new();
        let mut t = target(ns());

        let err = sync_collection(&mut h.ctx(), &mut t).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(h.sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_key_type_is_fatal() {
        let mut h = Harness::new();
        h.source
            .upsert(&ns(), [doc! { "_id": 1, "updated_at": 1.5 }])
            .await;
        let mut t = keyed_target();

        let err = sync_collection(&mut h.ctx(), &mut t).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType { .. }));
    }
}
