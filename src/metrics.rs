use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing gateway activity.
#[derive(Default)]
pub struct GatewayMetrics {
    documents_ingested: AtomicU64,
    questions_answered: AtomicU64,
}

impl GatewayMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successfully ingested document.
    pub fn record_ingest(&self) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one answered question.
    pub fn record_chat(&self) {
        self.questions_answered.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            questions_answered: self.questions_answered.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of gateway counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Number of documents ingested since startup.
    pub documents_ingested: u64,
    /// Number of questions answered since startup.
    pub questions_answered: u64,
}
