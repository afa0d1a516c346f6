//! Run order of the selected streams.

use tracing::{debug, warn};

use crate::bookmarks::{State, LAST_ID_FETCHED, MAX_ID_VALUE};
use crate::catalog::{CatalogEntry, ReplicationMethod};

/// True when the stream can continue from its bookmark without a
/// historical sync.
fn has_state(entry: &CatalogEntry, state: &State) -> bool {
    let Some(bookmark) = state.bookmark(&entry.tap_stream_id) else {
        return false;
    };
    if bookmark.is_empty() {
        return false;
    }
    match entry.replication_method() {
        Ok(ReplicationMethod::LogBased) => {
            bookmark.oplog_position().is_some()
                && !bookmark.contains(MAX_ID_VALUE)
                && !bookmark.contains(LAST_ID_FETCHED)
        }
        _ => true,
    }
}

/// Selected streams, never-synced ones first, with the interrupted stream
/// (if any) moved to the front.
pub fn streams_to_sync<'a>(streams: &'a [CatalogEntry], state: &State) -> Vec<&'a CatalogEntry> {
    let selected = streams.iter().filter(|entry| {
        let selected = entry.is_selected();
        if !selected {
            debug!(stream = %entry.tap_stream_id, "Skipping unselected stream");
        }
        selected
    });

    let (with_state, without_state): (Vec<&CatalogEntry>, Vec<&CatalogEntry>) =
        selected.partition(|entry| has_state(entry, state));
    let mut ordered: Vec<&CatalogEntry> = without_state.into_iter().chain(with_state).collect();

    if let Some(current) = state.currently_syncing.as_deref() {
        match ordered.iter().position(|entry| entry.tap_stream_id == current) {
            Some(index) => {
                let entry = ordered.remove(index);
                ordered.insert(0, entry);
            }
            None => warn!(stream = %current, "Interrupted stream is no longer selected"),
        }
    }
    ordered
}
