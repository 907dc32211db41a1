//! Engine configuration and preset setups
//!
//! Provides a serde-loadable [`SyncConfig`], a builder for
//! [`RuleManager`], and ready-to-use presets for common setups.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit::{AuditSink, CompositeAuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
use crate::mirror::{FileMirror, MemoryMirror, Mirror};
use crate::primary::PrimaryStore;
use crate::transaction::RuleManager;

const DEFAULT_APP_NAME: &str = "rulesync";

/// Error type for configuration and preset initialization
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to initialize mirror: {0}")]
    MirrorInit(String),

    #[error("Failed to initialize audit: {0}")]
    AuditInit(String),
}

/// Engine configuration
///
/// ```json
/// {
///   "app_name": "plugin-settings",
///   "mirror_path": "/var/lib/plugin-settings/rules.json",
///   "replay_concurrency": 8
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Application name (used for default paths)
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Mirror file; defaults to `<config dir>/<app_name>/rules.json`
    #[serde(default)]
    pub mirror_path: Option<PathBuf>,

    /// Audit log; defaults to `<config dir>/<app_name>/audit.jsonl`
    #[serde(default)]
    pub audit_path: Option<PathBuf>,

    /// Maximum concurrent replay writes during a rebuild (absent = unbounded)
    #[serde(default)]
    pub replay_concurrency: Option<NonZeroUsize>,
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            mirror_path: None,
            audit_path: None,
            replay_concurrency: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON string
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Configuration directory for the application
    pub fn config_dir(&self) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(&self.app_name)
    }

    /// Resolved mirror file path
    pub fn mirror_file(&self) -> PathBuf {
        self.mirror_path
            .clone()
            .unwrap_or_else(|| self.config_dir().join("rules.json"))
    }

    /// Resolved audit log path
    pub fn audit_file(&self) -> PathBuf {
        self.audit_path
            .clone()
            .unwrap_or_else(|| self.config_dir().join("audit.jsonl"))
    }

    /// Build a file-backed manager from this configuration
    pub fn build(&self, primary: Arc<dyn PrimaryStore>) -> Result<RuleManager, ConfigError> {
        let (mirror, audit) = self.open_files()?;
        Ok(self.builder(primary, mirror).audit(audit).build())
    }

    /// Build a file-backed manager that also keeps the most recent audit
    /// events in memory, e.g. to show divergences in a settings page
    pub fn build_with_recent_events(
        &self,
        primary: Arc<dyn PrimaryStore>,
        capacity: usize,
    ) -> Result<(RuleManager, Arc<MemoryAuditSink>), ConfigError> {
        let (mirror, file_audit) = self.open_files()?;
        let recent = Arc::new(MemoryAuditSink::with_capacity(capacity));
        let audit = CompositeAuditSink::new()
            .with_sink(file_audit)
            .with_shared_sink(recent.clone());

        let manager = self.builder(primary, mirror).audit(audit).build();
        Ok((manager, recent))
    }

    fn open_files(&self) -> Result<(FileMirror, FileAuditSink), ConfigError> {
        let mirror = FileMirror::new(self.mirror_file())
            .map_err(|e| ConfigError::MirrorInit(e.to_string()))?;
        let audit = FileAuditSink::new(self.audit_file())
            .map_err(|e| ConfigError::AuditInit(e.to_string()))?;

        tracing::info!(
            mirror = %mirror.path().display(),
            audit = %audit.path().display(),
            "Rule engine configured"
        );
        Ok((mirror, audit))
    }

    fn builder(&self, primary: Arc<dyn PrimaryStore>, mirror: FileMirror) -> RuleManagerBuilder {
        RuleManagerBuilder::new(primary)
            .mirror(mirror)
            .replay_concurrency(self.replay_concurrency)
    }
}

/// Builder for [`RuleManager`]
///
/// Defaults: in-memory mirror, no audit, unbounded replay fan-out.
pub struct RuleManagerBuilder {
    primary: Arc<dyn PrimaryStore>,
    mirror: Option<Arc<dyn Mirror>>,
    audit: Option<Arc<dyn AuditSink>>,
    replay_concurrency: Option<NonZeroUsize>,
}

impl RuleManagerBuilder {
    /// Create a new builder around a remote store
    pub fn new(primary: Arc<dyn PrimaryStore>) -> Self {
        Self {
            primary,
            mirror: None,
            audit: None,
            replay_concurrency: None,
        }
    }

    /// Set the mirror
    pub fn mirror(mut self, mirror: impl Mirror + 'static) -> Self {
        self.mirror = Some(Arc::new(mirror));
        self
    }

    /// Set a shared mirror
    pub fn shared_mirror(mut self, mirror: Arc<dyn Mirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Set the audit sink
    pub fn audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    /// Set a shared audit sink
    pub fn shared_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Bound the number of concurrent replay writes
    pub fn replay_concurrency(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.replay_concurrency = limit;
        self
    }

    /// Build the manager
    pub fn build(self) -> RuleManager {
        RuleManager::new(
            self.mirror
                .unwrap_or_else(|| Arc::new(MemoryMirror::new())),
            self.primary,
            self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
            self.replay_concurrency,
        )
    }
}

// ============================================================================
// Preset Configurations
// ============================================================================

/// Preset configurations for common use cases
pub struct SyncPresets;

impl SyncPresets {
    /// Persistent mode
    ///
    /// - File mirror at `<config dir>/<app>/rules.json`
    /// - JSONL audit log at `<config dir>/<app>/audit.jsonl`
    /// - Unbounded replay fan-out
    pub fn persistent(
        app_name: &str,
        primary: Arc<dyn PrimaryStore>,
    ) -> Result<RuleManager, ConfigError> {
        SyncConfig {
            app_name: app_name.to_string(),
            ..SyncConfig::default()
        }
        .build(primary)
    }

    /// Testing mode (in-memory, no persistence)
    ///
    /// - In-memory mirror
    /// - Memory audit sink, returned for inspection
    pub fn testing(primary: Arc<dyn PrimaryStore>) -> (RuleManager, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = RuleManagerBuilder::new(primary)
            .shared_audit(audit.clone())
            .build();
        (manager, audit)
    }
}
