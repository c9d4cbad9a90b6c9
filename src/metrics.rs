//! Pool gauges and byte counters published through the `metrics` facade.

use crate::buffer::PoolStats;

/// Publish a pool snapshot under `bytepump.pool.*`, labelled by owner kind.
pub fn record_pool(kind: &'static str, stats: &PoolStats) {
    metrics::gauge!("bytepump.pool.buffers", "kind" => kind).set(stats.buffers as f64);
    metrics::gauge!("bytepump.pool.free", "kind" => kind).set(stats.free as f64);
    metrics::gauge!("bytepump.pool.high_water", "kind" => kind).set(stats.high_water as f64);
}

/// Count bytes moved by a pump or pipe.
pub fn record_bytes(kind: &'static str, bytes: usize) {
    metrics::counter!("bytepump.bytes", "kind" => kind).increment(bytes as u64);
}
