//! Audit trail for rule transactions and store divergences
//!
//! Every settled transaction and every known divergence between the
//! mirror and the remote store is recorded as an [`AuditEvent`]. Sinks are
//! pluggable; framework users implement [`AuditSink`] to send events to
//! their preferred destination.

use rulesync_api::{Rule, Setting};
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

use crate::error::{Outcome, SyncError};
use crate::notify::Operation;
use crate::primary::PrimaryError;

/// Timestamp type (RFC 3339 string)
pub type Timestamp = String;

fn now_rfc3339() -> Timestamp {
    chrono::Utc::now().to_rfc3339()
}

/// Audit event
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Timestamp of the event
    pub timestamp: Timestamp,
    /// Type of event
    pub event_type: AuditEventType,
    /// Scope the event concerns
    pub scope: String,
    /// Pattern the event concerns (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Additional details
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(event_type: AuditEventType, scope: impl Into<String>, details: AuditDetails) -> Self {
        Self {
            timestamp: now_rfc3339(),
            event_type,
            scope: scope.into(),
            pattern: None,
            details,
        }
    }

    /// Attach the pattern the event concerns
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

/// Type of audit event
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A top-level operation settled
    TransactionSettled,
    /// The remote store was cleared for a rebuild
    RemoteCleared,
    /// The remote clear failed; remote state is unknown
    ClearFailed,
    /// A rule failed to replay and was dropped from the mirror
    ReplayDropped,
    /// A rename's restore failed after its new rule failed
    RestoreFailed,
}

/// Details about the audit event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    /// Settled transaction
    Transaction {
        operation: Operation,
        outcome: Outcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Divergence between the mirror and the remote store
    Divergence {
        #[serde(skip_serializing_if = "Option::is_none")]
        setting: Option<Setting>,
        reason: String,
    },
    /// Remote store cleared as part of removing a rule
    Rebuild,
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize audit event: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Audit sink not available: {0}")]
    Unavailable(String),
}

/// Trait for audit event sinks
///
/// # Example
///
/// ```rust
/// use rulesync_engine::audit::{AuditSink, AuditEvent, AuditError};
///
/// struct StderrAuditSink;
///
/// impl AuditSink for StderrAuditSink {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("{:?}", event);
///         Ok(())
///     }
///
///     fn flush(&self) -> Result<(), AuditError> {
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    /// Record an audit event
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Flush any buffered events
    fn flush(&self) -> Result<(), AuditError>;

    /// Check if the sink is healthy/available
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Record an event, logging instead of failing if the sink errors.
///
/// Auditing never changes the outcome of a rule operation.
pub fn record(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(event) {
        tracing::warn!(error = %e, "Failed to record audit event");
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

/// File-based audit sink (JSONL format)
///
/// Lines are buffered; call [`AuditSink::flush`] to force them to disk.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    /// Create a new file audit sink
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Get the log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.path.parent().map(|p| p.exists()).unwrap_or(true)
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory audit sink for testing
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Create a new memory sink with default capacity (1000 events)
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new memory sink with specified capacity
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::with_capacity(max_events.min(1000))),
            max_events,
        }
    }

    /// Get all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get event count
    pub fn count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Find events by type
    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Find events by scope
    pub fn find_by_scope(&self, scope: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.scope == scope)
            .collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.max_events == 0 {
            return Ok(());
        }
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.max_events {
            events.remove(0); // FIFO eviction
        }
        events.push(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("count", &self.count())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Null audit sink (discards all events)
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Composite audit sink that writes to multiple sinks
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl AuditSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn with_shared_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for CompositeAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        for sink in &self.sinks {
            sink.record(event.clone())?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        for sink in &self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.sinks.iter().all(|s| s.is_healthy())
    }
}

impl fmt::Debug for CompositeAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAuditSink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Event for a settled top-level operation
pub fn transaction_settled(
    scope: &str,
    operation: Operation,
    outcome: Outcome,
    error: Option<&SyncError>,
) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::TransactionSettled,
        scope,
        AuditDetails::Transaction {
            operation,
            outcome,
            error: error.map(ToString::to_string),
        },
    )
}

/// Event for a successful remote clear during a rebuild
pub fn remote_cleared(scope: &str, pattern: &str) -> AuditEvent {
    AuditEvent::new(AuditEventType::RemoteCleared, scope, AuditDetails::Rebuild).with_pattern(pattern)
}

/// Event for a failed remote clear
pub fn clear_failed(scope: &str, pattern: &str, error: &PrimaryError) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ClearFailed,
        scope,
        AuditDetails::Divergence {
            setting: None,
            reason: error.to_string(),
        },
    )
    .with_pattern(pattern)
}

/// Event for a rule dropped after its replay failed
pub fn replay_dropped(rule: &Rule, error: &PrimaryError) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::ReplayDropped,
        rule.scope.as_str(),
        AuditDetails::Divergence {
            setting: Some(rule.setting),
            reason: error.to_string(),
        },
    )
    .with_pattern(rule.pattern.as_str())
}

/// Event for a failed restore after a failed rename
pub fn restore_failed(rule: &Rule, error: &SyncError) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::RestoreFailed,
        rule.scope.as_str(),
        AuditDetails::Divergence {
            setting: Some(rule.setting),
            reason: error.to_string(),
        },
    )
    .with_pattern(rule.pattern.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink() {
        let sink = MemoryAuditSink::new();

        sink.record(remote_cleared("flash", "p1")).unwrap();
        sink.record(replay_dropped(
            &Rule::allow("java", "p2"),
            &PrimaryError::transport("offline"),
        ))
        .unwrap();

        assert_eq!(sink.count(), 2);
        let events = sink.find_by_type(AuditEventType::ReplayDropped);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope, "java");
        assert_eq!(events[0].pattern.as_deref(), Some("p2"));
        assert_eq!(sink.find_by_scope("flash").len(), 1);
    }

    #[test]
    fn test_memory_sink_eviction() {
        let sink = MemoryAuditSink::with_capacity(2);

        for i in 0..3 {
            sink.record(remote_cleared(&format!("scope-{}", i), "p")).unwrap();
        }

        assert_eq!(sink.count(), 2);
        let events = sink.events();
        assert_eq!(events[0].scope, "scope-1");
        assert_eq!(events[1].scope, "scope-2");
    }

    #[test]
    fn test_zero_capacity_memory_sink_discards() {
        let sink = MemoryAuditSink::with_capacity(0);

        sink.record(remote_cleared("flash", "p1")).unwrap();

        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_composite_sink_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let composite = CompositeAuditSink::new()
            .with_sink(NullAuditSink)
            .with_sink(FileAuditSink::new(&path).unwrap());

        composite.record(remote_cleared("flash", "p1")).unwrap();
        composite.flush().unwrap();
        assert!(composite.is_healthy());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = transaction_settled("flash", Operation::Update, Outcome::PartiallyFailed, None);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("transaction_settled"));
        assert!(json.contains("\"operation\":\"update\""));
        assert!(json.contains("partially_failed"));
        assert!(!json.contains("\"pattern\""));
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let sink = FileAuditSink::new(&path).unwrap();
        sink.record(clear_failed("flash", "p1", &PrimaryError::transport("offline")))
            .unwrap();
        sink.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("clear_failed"));
        assert!(content.contains("offline"));
    }
}
