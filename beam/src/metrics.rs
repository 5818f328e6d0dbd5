//! Metrics for beams.

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics shared by any number of beams (attach via
/// [Config::with_metrics](crate::Config::with_metrics)).
#[derive(Default)]
pub struct Metrics {
    /// Bytes admitted into send queues.
    pub sent_bytes: Counter,
    /// Bytes handed to consumers (file lengths excluded).
    pub received_bytes: Counter,
    /// File handles re-homed into consumer arenas.
    pub files_beamed: Counter,
    /// Beams aborted.
    pub aborts: Counter,
    /// Emitted proxies whose source chunk was not found in hold. Any nonzero
    /// value indicates a bookkeeping bug.
    pub emitted_orphans: Counter,
    /// Bytes buffered in the send queue of the most recently active beam.
    pub buffered_bytes: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "beam_sent_bytes",
            "Bytes admitted into beam send queues",
            metrics.sent_bytes.clone(),
        );
        registry.register(
            "beam_received_bytes",
            "Bytes handed to beam consumers",
            metrics.received_bytes.clone(),
        );
        registry.register(
            "beam_files_beamed",
            "File handles re-homed into consumer arenas",
            metrics.files_beamed.clone(),
        );
        registry.register(
            "beam_aborts",
            "Beams aborted",
            metrics.aborts.clone(),
        );
        registry.register(
            "beam_emitted_orphans",
            "Emitted proxies whose source chunk was not in hold",
            metrics.emitted_orphans.clone(),
        );
        registry.register(
            "beam_buffered_bytes",
            "Bytes buffered in the send queue of the most recently active beam",
            metrics.buffered_bytes.clone(),
        );
        metrics
    }
}
