use std::time::Duration;

/// Tunables for the credential reconciler.
///
/// The well-known names locating the aggregate object are explicit
/// configuration rather than process-wide constants, so an embedding can
/// run reconcilers against distinct aggregates.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Name of the per-namespace aggregate config map.
    pub aggregate_name: String,
    /// Data key holding the serialized credentials document.
    pub document_key: String,
    /// Resync attempts per reconcile once a write conflicts.
    pub conflict_retries: u32,
    /// Backoff before the first resync attempt; doubles per attempt.
    pub conflict_backoff: Duration,
    /// Deliveries of a key before a persistently failing reconcile is dropped.
    pub delivery_attempts: u32,
    /// Backoff before the first redelivery; doubles per delivery.
    pub delivery_backoff: Duration,
    /// Number of keys reconciled concurrently.
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            aggregate_name: "estafette-external-credentials".to_string(),
            document_key: "credentials-config.yaml".to_string(),
            conflict_retries: 4,
            conflict_backoff: Duration::from_millis(200),
            delivery_attempts: 3,
            delivery_backoff: Duration::from_millis(500),
            workers: 4,
        }
    }
}
