// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handle and log sinks

use super::{Facility, Severity};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// A single formatted log record handed to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub facility: Facility,
    pub message: String,
    pub kvs: Vec<(String, String)>,
}

/// Destination for log records
pub trait LogSink: Send + Sync {
    fn write(&self, record: LogRecord);
}

/// Writes one JSON object per line to stderr
pub struct StderrJsonSink;

impl LogSink for StderrJsonSink {
    fn write(&self, record: LogRecord) {
        let mut log_msg = serde_json::json!({
            "timestamp": record.timestamp.to_rfc3339(),
            "level": record.severity.as_str(),
            "facility": record.facility.as_str(),
            "message": record.message,
        });
        if let Some(obj) = log_msg.as_object_mut() {
            for (key, value) in record.kvs {
                obj.insert(key, serde_json::Value::String(value));
            }
        }
        eprintln!("{}", log_msg);
    }
}

/// Discards everything
pub struct NullSink;

impl LogSink for NullSink {
    fn write(&self, _record: LogRecord) {}
}

/// Keeps records in memory so tests can assert on them
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records at or above `severity` whose message contains `needle`
    pub fn count_matching(&self, severity: Severity, needle: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.severity <= severity && r.message.contains(needle))
            .count()
    }
}

impl LogSink for MemorySink {
    fn write(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Logger handle for writing log records
///
/// This is a lightweight handle that can be cloned and passed around.
/// The sink and the level filters are shared via Arc, so changing a level
/// on one clone affects all of them.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    /// Global minimum log level (default: Info)
    global_min_level: Arc<AtomicU8>,
    /// Per-facility minimum log levels
    facility_min_levels: Arc<RwLock<HashMap<Facility, Severity>>>,
}

impl Logger {
    pub fn with_sink(sink: Arc<dyn LogSink>, level: Severity) -> Self {
        Self {
            sink,
            global_min_level: Arc::new(AtomicU8::new(level.as_u8())),
            facility_min_levels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a logger that writes JSON lines to stderr
    pub fn stderr_json(level: Severity) -> Self {
        Self::with_sink(Arc::new(StderrJsonSink), level)
    }

    /// Create a logger that drops every record
    pub fn null() -> Self {
        Self::with_sink(Arc::new(NullSink), Severity::Error)
    }

    /// Create a logger backed by a `MemorySink`, capturing everything up to Debug
    pub fn memory() -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let logger = Self::with_sink(sink.clone(), Severity::Debug);
        (logger, sink)
    }

    #[inline]
    fn should_log(&self, severity: Severity, facility: Facility) -> bool {
        // Facility-specific level overrides the global one
        let levels = self
            .facility_min_levels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(&min_level) = levels.get(&facility) {
            return severity <= min_level;
        }
        drop(levels);

        severity.as_u8() <= self.global_min_level.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        self.log_kv(severity, facility, message, &[]);
    }

    /// Write a log record with key-value context
    pub fn log_kv(
        &self,
        severity: Severity,
        facility: Facility,
        message: &str,
        kvs: &[(&str, &str)],
    ) {
        if !self.should_log(severity, facility) {
            return;
        }

        self.sink.write(LogRecord {
            timestamp: Utc::now(),
            severity,
            facility,
            message: message.to_string(),
            kvs: kvs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }

    pub fn set_global_level(&self, level: Severity) {
        self.global_min_level.store(level.as_u8(), Ordering::Relaxed);
    }

    pub fn global_level(&self) -> Severity {
        Severity::from_u8(self.global_min_level.load(Ordering::Relaxed)).unwrap_or(Severity::Info)
    }

    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        self.facility_min_levels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(facility, level);
    }

    /// Clear the facility-specific log level (fall back to global)
    pub fn clear_facility_level(&self, facility: Facility) {
        self.facility_min_levels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&facility);
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("global_min_level", &self.global_level())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_filters_by_global_level() {
        let (logger, sink) = Logger::memory();
        logger.set_global_level(Severity::Info);

        logger.info(Facility::Proxy, "kept");
        logger.debug(Facility::Proxy, "dropped");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "kept");
    }

    #[test]
    fn test_facility_level_overrides_global() {
        let (logger, sink) = Logger::memory();
        logger.set_global_level(Severity::Warning);
        logger.set_facility_level(Facility::Membership, Severity::Debug);

        logger.debug(Facility::Membership, "transition");
        logger.debug(Facility::Proxy, "hidden");
        assert_eq!(sink.records().len(), 1);

        logger.clear_facility_level(Facility::Membership);
        logger.debug(Facility::Membership, "hidden too");
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_logger_with_kvs() {
        let (logger, sink) = Logger::memory();
        logger.log_kv(
            Severity::Info,
            Facility::Proxy,
            "Join",
            &[("device", "of:0001"), ("group", "239.1.1.1")],
        );

        let records = sink.records();
        assert_eq!(records[0].kvs.len(), 2);
        assert_eq!(records[0].kvs[1], ("group".to_string(), "239.1.1.1".to_string()));
    }

    #[test]
    fn test_clones_share_levels() {
        let (logger, sink) = Logger::memory();
        let clone = logger.clone();
        logger.set_global_level(Severity::Error);

        clone.info(Facility::Proxy, "suppressed");
        clone.error(Facility::Proxy, "visible");
        assert_eq!(sink.count_matching(Severity::Debug, ""), 1);
    }
}
