use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Non-fatal problem recorded while processing one unit (entry, chunk, class file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub scope: String,
    pub message: String,
}

impl Warning {
    pub fn new(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.scope, self.message)
    }
}

/// Output of one leaf transformation.
#[derive(Debug, Clone, Default)]
pub struct Rewrite {
    pub bytes: Vec<u8>,
    pub replacements: u64,
    pub warnings: Vec<Warning>,
}

impl Rewrite {
    pub fn unchanged(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Summary of one processing call.
#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    pub bytes_processed: u64,
    pub replacement_count: u64,
    pub placeholder_count: usize,
    pub entries_processed: usize,
    pub entries_rewritten: usize,
    pub elapsed: Duration,
    pub warnings: Vec<Warning>,
}

impl ProcessingResult {
    pub fn new(bytes_processed: u64, replacement_count: u64, placeholder_count: usize) -> Self {
        Self {
            bytes_processed,
            replacement_count,
            placeholder_count,
            ..Self::default()
        }
    }

    pub fn throughput_mb_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes_processed as f64 / (1024.0 * 1024.0)) / secs
    }
}

impl Serialize for ProcessingResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ProcessingResult", 8)?;
        state.serialize_field("bytes_processed", &self.bytes_processed)?;
        state.serialize_field("replacement_count", &self.replacement_count)?;
        state.serialize_field("placeholder_count", &self.placeholder_count)?;
        state.serialize_field("entries_processed", &self.entries_processed)?;
        state.serialize_field("entries_rewritten", &self.entries_rewritten)?;
        state.serialize_field("duration_ms", &(self.elapsed.as_millis() as u64))?;
        state.serialize_field("throughput_mb_s", &self.throughput_mb_s())?;
        state.serialize_field("warnings", &self.warnings)?;
        state.end()
    }
}

/// Cumulative counters across every call made through one engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    operations: AtomicU64,
    bytes_processed: AtomicU64,
    replacements: AtomicU64,
    total_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub operations: u64,
    pub bytes_processed: u64,
    pub replacements: u64,
    pub total_time_ms: u64,
    pub average_time_us: u64,
}

impl EngineMetrics {
    pub fn record(&self, bytes: u64, replacements: u64, elapsed: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
        self.replacements.fetch_add(replacements, Ordering::Relaxed);
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self.operations.load(Ordering::Relaxed);
        let total_nanos = self.total_nanos.load(Ordering::Relaxed);
        MetricsSnapshot {
            operations,
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            total_time_ms: total_nanos / 1_000_000,
            average_time_us: total_nanos.checked_div(operations).unwrap_or(0) / 1_000,
        }
    }

    pub fn reset(&self) {
        self.operations.store(0, Ordering::Relaxed);
        self.bytes_processed.store(0, Ordering::Relaxed);
        self.replacements.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
    }
}
