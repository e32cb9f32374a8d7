//! Stats Collector (C8): per-layer wall time and per-worker timing,
//! printed as a summary once inference completes.

use std::time::Duration;
use tracing::info;

/// Timing for one worker's share of one layer.
#[derive(Debug, Clone, Copy)]
pub struct WorkerStat {
    pub worker_id: u8,
    pub send_time: Duration,
    pub recv_time: Duration,
    pub compute_time: Duration,
}

/// Timing for one completed layer.
#[derive(Debug, Clone)]
pub struct LayerStats {
    pub layer_idx: u32,
    pub wall_time: Duration,
    pub workers: Vec<WorkerStat>,
}

/// Accumulates `LayerStats` across an inference run.
#[derive(Debug, Default)]
pub struct StatsCollector {
    layers: Vec<LayerStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_layer(&mut self, stats: LayerStats) {
        self.layers.push(stats);
    }

    pub fn into_vec(self) -> Vec<LayerStats> {
        self.layers
    }

    /// Emit one summary line per layer via `tracing::info!`.
    pub fn log_summary(&self) {
        for layer in &self.layers {
            info!(
                layer_idx = layer.layer_idx,
                wall_time_ms = layer.wall_time.as_secs_f64() * 1000.0,
                worker_count = layer.workers.len(),
                "layer complete"
            );
            for w in &layer.workers {
                info!(
                    layer_idx = layer.layer_idx,
                    worker_id = w.worker_id,
                    send_ms = w.send_time.as_secs_f64() * 1000.0,
                    recv_ms = w.recv_time.as_secs_f64() * 1000.0,
                    compute_ms = w.compute_time.as_secs_f64() * 1000.0,
                    "worker timing"
                );
            }
        }
    }
}
