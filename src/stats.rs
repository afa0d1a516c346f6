use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Counters for one stream within a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamStats {
    pub rows_emitted: u64,
    pub sync_time: Duration,
    pub schema_emissions: u64,
    pub schema_inference_time: Duration,
}

/// Per-stream counters for a whole run, owned by the replicator.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    streams: BTreeMap<String, StreamStats>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self, stream_id: &str) -> Option<&StreamStats> {
        self.streams.get(stream_id)
    }

    fn entry(&mut self, stream_id: &str) -> &mut StreamStats {
        self.streams.entry(stream_id.to_string()).or_default()
    }

    pub fn record_rows(&mut self, stream_id: &str, rows: u64) {
        self.entry(stream_id).rows_emitted += rows;
    }

    pub fn record_sync_time(&mut self, stream_id: &str, elapsed: Duration) {
        self.entry(stream_id).sync_time += elapsed;
    }

    pub fn record_schema_inference(&mut self, stream_id: &str, elapsed: Duration, emitted: bool) {
        let stats = self.entry(stream_id);
        stats.schema_inference_time += elapsed;
        if emitted {
            stats.schema_emissions += 1;
        }
    }

    pub fn total_rows(&self) -> u64 {
        self.streams.values().map(|s| s.rows_emitted).sum()
    }

    pub fn log_summary(&self) {
        for (stream_id, stats) in &self.streams {
            info!(
                stream = %stream_id,
                rows = stats.rows_emitted,
                sync_secs = stats.sync_time.as_secs_f64(),
                schema_emissions = stats.schema_emissions,
                schema_secs = stats.schema_inference_time.as_secs_f64(),
                "Stream summary"
            );
        }
        info!(
            streams = self.streams.len(),
            rows = self.total_rows(),
            "Sync summary"
        );
    }
}
