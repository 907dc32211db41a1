//! Primary (remote) permission store
//!
//! The remote service enforces rules but offers only two operations:
//! write one rule, or clear every rule in every scope. It cannot be read
//! and has no per-rule delete.

use async_trait::async_trait;
use rulesync_api::{Rule, RuleKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Category of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryErrorKind {
    /// The call did not reach the service or timed out
    Transport,
    /// The service rejected the request (e.g., a malformed pattern)
    Validation,
}

impl fmt::Display for PrimaryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => f.write_str("transport error"),
            Self::Validation => f.write_str("validation error"),
        }
    }
}

/// Error reported by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PrimaryError {
    pub kind: PrimaryErrorKind,
    pub message: String,
}

impl PrimaryError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: PrimaryErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: PrimaryErrorKind::Validation,
            message: message.into(),
        }
    }
}

/// Trait for the remote permission service
///
/// A call either fully applies or fails; there is no partial success.
/// Timeouts belong to the implementation's transport and surface as
/// ordinary errors.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Write (or overwrite) one rule
    async fn set_rule(&self, rule: &Rule) -> Result<(), PrimaryError>;

    /// Remove every rule in every scope
    async fn clear_all(&self) -> Result<(), PrimaryError>;
}

/// Engine-side client for the remote store
#[derive(Clone)]
pub struct PrimaryClient {
    store: Arc<dyn PrimaryStore>,
}

impl PrimaryClient {
    pub fn new(store: Arc<dyn PrimaryStore>) -> Self {
        Self { store }
    }

    pub async fn set_rule(&self, rule: &Rule) -> Result<(), PrimaryError> {
        tracing::debug!(scope = %rule.scope, pattern = %rule.pattern, setting = %rule.setting, "Writing remote rule");
        let result = self.store.set_rule(rule).await;
        if let Err(e) = &result {
            tracing::debug!(scope = %rule.scope, pattern = %rule.pattern, error = %e, "Remote rule write failed");
        }
        result
    }

    pub async fn clear_all(&self) -> Result<(), PrimaryError> {
        tracing::debug!("Clearing all remote rules");
        let result = self.store.clear_all().await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Remote clear failed");
        }
        result
    }
}

impl fmt::Debug for PrimaryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryClient").finish_non_exhaustive()
    }
}

// ============================================================================
// In-Memory Primary Store
// ============================================================================

/// A call observed by [`MemoryPrimaryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryCall {
    SetRule(Rule),
    ClearAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailMode {
    Once,
    Always,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Enforced rules, in write order
    rules: Vec<Rule>,
    calls: Vec<PrimaryCall>,
    set_failures: HashMap<RuleKey, FailMode>,
    clear_failure: Option<FailMode>,
}

impl MemoryState {
    fn take_failure(mode: &mut Option<FailMode>) -> bool {
        match *mode {
            Some(FailMode::Once) => {
                *mode = None;
                true
            }
            Some(FailMode::Always) => true,
            None => false,
        }
    }
}

/// In-process stand-in for the remote permission service
///
/// Enforces rules in memory, records every call in order, and can be told
/// to fail specific writes or clears. An optional latency is applied to
/// every call after it is recorded and before it takes effect, which makes
/// overlapping calls observable.
///
/// The inspection methods (`rules`, `calls`) exist for assertions; the
/// engine never reads remote state.
#[derive(Default)]
pub struct MemoryPrimaryStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryPrimaryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by the given duration
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every write of this rule key until healed
    pub fn fail_set(&self, scope: &str, pattern: &str) {
        self.state()
            .set_failures
            .insert(RuleKey::new(scope, pattern), FailMode::Always);
    }

    /// Fail the next write of this rule key
    pub fn fail_set_once(&self, scope: &str, pattern: &str) {
        self.state()
            .set_failures
            .insert(RuleKey::new(scope, pattern), FailMode::Once);
    }

    /// Fail every clear until healed
    pub fn fail_clear(&self) {
        self.state().clear_failure = Some(FailMode::Always);
    }

    /// Fail the next clear
    pub fn fail_clear_once(&self) {
        self.state().clear_failure = Some(FailMode::Once);
    }

    /// Remove all injected failures
    pub fn heal(&self) {
        let mut state = self.state();
        state.set_failures.clear();
        state.clear_failure = None;
    }

    /// Rules currently enforced, in write order
    pub fn rules(&self) -> Vec<Rule> {
        self.state().rules.clone()
    }

    /// Enforced rules for one scope
    pub fn rules_for(&self, scope: &str) -> Vec<Rule> {
        self.state()
            .rules
            .iter()
            .filter(|r| r.scope == scope)
            .cloned()
            .collect()
    }

    /// Every call received so far, in arrival order
    pub fn calls(&self) -> Vec<PrimaryCall> {
        self.state().calls.clone()
    }

    /// Number of `set_rule` calls received
    pub fn set_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, PrimaryCall::SetRule(_)))
            .count()
    }

    /// Number of `clear_all` calls received
    pub fn clear_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, PrimaryCall::ClearAll))
            .count()
    }

    /// Forget recorded calls (enforced rules are kept)
    pub fn reset_calls(&self) {
        self.state().calls.clear();
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn set_rule(&self, rule: &Rule) -> Result<(), PrimaryError> {
        self.state().calls.push(PrimaryCall::SetRule(rule.clone()));
        self.delay().await;

        let mut state = self.state();
        let mut mode = state.set_failures.get(&rule.key()).copied();
        let failed = MemoryState::take_failure(&mut mode);
        match mode {
            Some(mode) => state.set_failures.insert(rule.key(), mode),
            None => state.set_failures.remove(&rule.key()),
        };
        if failed {
            return Err(PrimaryError::transport(format!("write of {} rejected", rule.key())));
        }

        match state
            .rules
            .iter_mut()
            .find(|r| r.has_key(&rule.scope, &rule.pattern))
        {
            Some(existing) => existing.setting = rule.setting,
            None => state.rules.push(rule.clone()),
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), PrimaryError> {
        self.state().calls.push(PrimaryCall::ClearAll);
        self.delay().await;

        let mut state = self.state();
        if MemoryState::take_failure(&mut state.clear_failure) {
            return Err(PrimaryError::transport("clear rejected"));
        }
        state.rules.clear();
        Ok(())
    }
}

impl fmt::Debug for MemoryPrimaryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryPrimaryStore")
            .field("rules", &state.rules.len())
            .field("calls", &state.calls.len())
            .field("latency", &self.latency)
            .finish()
    }
}
