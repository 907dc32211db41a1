//! Rule transactions
//!
//! [`RuleManager`] is the only component that writes the mirror or the
//! remote store. It composes set, clear and update out of the mirror, the
//! primary client and the rebuild coordinator, serializes operations per
//! scope, and publishes exactly one change event per operation.

use rulesync_api::{Rule, Setting};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::audit::{self, AuditSink};
use crate::error::{Outcome, Result, SyncError};
use crate::mirror::Mirror;
use crate::notify::{ChangeEvent, ChangeNotifier, Operation, SubscriptionId};
use crate::primary::{PrimaryClient, PrimaryStore};
use crate::rebuild::RebuildCoordinator;

/// FIFO queue of operations per scope.
///
/// Holding a scope's guard means no other top-level operation on that
/// scope is running. Waiters are admitted in arrival order.
#[derive(Default)]
struct ScopeQueue {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeQueue {
    async fn acquire(&self, scope: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(scope.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

struct ManagerInner {
    mirror: Arc<dyn Mirror>,
    primary: PrimaryClient,
    rebuild: RebuildCoordinator,
    notifier: ChangeNotifier,
    audit: Arc<dyn AuditSink>,
    queue: ScopeQueue,
    /// Shared by rule writes, exclusive for rebuilds: a whole-store clear
    /// and its replay must not interleave with any write.
    store_gate: RwLock<()>,
}

/// Rule transaction manager
///
/// Cheap to clone; clones share the same stores, queue and subscribers.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use rulesync_api::Setting;
/// use rulesync_engine::{MemoryPrimaryStore, RuleManager};
///
/// # async fn example() -> rulesync_engine::Result<()> {
/// let manager = RuleManager::builder(Arc::new(MemoryPrimaryStore::new())).build();
///
/// manager.set("flash", "*.example.com/*", Setting::Allow).await?;
/// manager.update("flash", "*.example.com/*", "*.example.org/*", Setting::Block).await?;
/// assert_eq!(manager.get("flash", "*.example.org/*"), Some(Setting::Block));
///
/// manager.clear("flash", "*.example.org/*").await?;
/// assert!(manager.get_all("flash").is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RuleManager {
    inner: Arc<ManagerInner>,
}

impl RuleManager {
    /// Create a manager from its components
    pub fn new(
        mirror: Arc<dyn Mirror>,
        primary: Arc<dyn PrimaryStore>,
        audit: Arc<dyn AuditSink>,
        replay_limit: Option<NonZeroUsize>,
    ) -> Self {
        let primary = PrimaryClient::new(primary);
        let rebuild =
            RebuildCoordinator::new(mirror.clone(), primary.clone(), audit.clone(), replay_limit);
        Self {
            inner: Arc::new(ManagerInner {
                mirror,
                primary,
                rebuild,
                notifier: ChangeNotifier::new(),
                audit,
                queue: ScopeQueue::default(),
                store_gate: RwLock::new(()),
            }),
        }
    }

    /// Start building a manager around a remote store
    pub fn builder(primary: Arc<dyn PrimaryStore>) -> crate::config::RuleManagerBuilder {
        crate::config::RuleManagerBuilder::new(primary)
    }

    /// Create or overwrite a rule
    ///
    /// The mirror is written only after the remote store accepts the rule.
    #[tracing::instrument(name = "rule_set", skip(self))]
    pub async fn set(&self, scope: &str, pattern: &str, setting: Setting) -> Result<()> {
        let _turn = self.inner.queue.acquire(scope).await;
        let result = self.write_rule(scope, pattern, setting).await;
        self.settle(scope, Operation::Set, &result);
        result
    }

    /// Remove a rule by rebuilding the remote store without it
    #[tracing::instrument(name = "rule_clear", skip(self))]
    pub async fn clear(&self, scope: &str, pattern: &str) -> Result<()> {
        let _turn = self.inner.queue.acquire(scope).await;
        let result = self.remove_rule(scope, pattern).await;
        self.settle(scope, Operation::Clear, &result);
        result
    }

    /// Change a rule's pattern and/or setting
    ///
    /// Changing only the setting is a plain overwrite. A rename clears the
    /// old rule, writes the new one, and restores the old one if the new
    /// write fails. The caller gets the new write's error; if the restore
    /// also fails the error is [`SyncError::DoubleFailure`]. A failed
    /// rebuild is never hidden: with a successful write it is the result,
    /// with a failed one both come back as [`SyncError::RenameFailed`].
    #[tracing::instrument(name = "rule_update", skip(self))]
    pub async fn update(
        &self,
        scope: &str,
        old_pattern: &str,
        new_pattern: &str,
        setting: Setting,
    ) -> Result<()> {
        let _turn = self.inner.queue.acquire(scope).await;
        let result = if old_pattern == new_pattern {
            self.write_rule(scope, new_pattern, setting).await
        } else {
            self.rename_rule(scope, old_pattern, new_pattern, setting).await
        };
        self.settle(scope, Operation::Update, &result);
        result
    }

    /// Setting for a rule, from the mirror
    pub fn get(&self, scope: &str, pattern: &str) -> Option<Setting> {
        self.inner.mirror.get(scope, pattern)
    }

    /// All rules in a scope, from the mirror
    pub fn get_all(&self, scope: &str) -> Vec<Rule> {
        self.inner.mirror.get_all(scope)
    }

    /// Scopes that currently hold rules
    pub fn scopes(&self) -> Vec<String> {
        self.inner.mirror.scopes()
    }

    /// Handle bound to a single scope
    pub fn scope(&self, scope: impl Into<String>) -> ScopedRules {
        ScopedRules {
            manager: self.clone(),
            scope: scope.into(),
        }
    }

    /// Subscribe to settled operations on a scope
    pub fn subscribe<F>(&self, scope: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(scope, callback)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    /// The change notifier (for channel subscriptions)
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Most recent error message for a scope, if its last operation failed
    pub fn last_error(&self, scope: &str) -> Option<String> {
        self.inner.notifier.last_error(scope)
    }

    /// Maximum concurrent replay writes during a rebuild
    pub fn replay_limit(&self) -> Option<NonZeroUsize> {
        self.inner.rebuild.replay_limit()
    }

    async fn write_rule(&self, scope: &str, pattern: &str, setting: Setting) -> Result<()> {
        let _shared = self.inner.store_gate.read().await;
        let rule = Rule::new(scope, pattern, setting);
        self.inner
            .primary
            .set_rule(&rule)
            .await
            .map_err(|source| SyncError::WriteFailed {
                key: rule.key(),
                source,
            })?;
        self.inner.mirror.put(scope, pattern, setting)?;
        Ok(())
    }

    async fn remove_rule(&self, scope: &str, pattern: &str) -> Result<()> {
        let _exclusive = self.inner.store_gate.write().await;
        let report = self.inner.rebuild.rebuild_except(scope, pattern).await?;
        if report.is_clean() {
            Ok(())
        } else {
            Err(SyncError::ReplayFailed {
                failures: report.failures,
            })
        }
    }

    async fn rename_rule(
        &self,
        scope: &str,
        old_pattern: &str,
        new_pattern: &str,
        setting: Setting,
    ) -> Result<()> {
        let old_setting = self.inner.mirror.get(scope, old_pattern);

        // Rebuild even when the old rule is absent locally; the remote store
        // may still hold it from an earlier failed clear
        let removed = self.remove_rule(scope, old_pattern).await;
        if let Err(SyncError::Mirror(_)) = removed {
            return removed;
        }

        let written = self
            .write_or_restore(scope, old_pattern, old_setting, new_pattern, setting)
            .await;

        match (written, removed) {
            (Ok(()), removed) => removed,
            (Err(write), Ok(())) => Err(write),
            (Err(write), Err(rebuild)) => Err(SyncError::RenameFailed {
                write: Box::new(write),
                rebuild: Box::new(rebuild),
            }),
        }
    }

    /// Write the renamed rule, putting the old one back if that fails
    async fn write_or_restore(
        &self,
        scope: &str,
        old_pattern: &str,
        old_setting: Option<Setting>,
        new_pattern: &str,
        setting: Setting,
    ) -> Result<()> {
        let original = match self.write_rule(scope, new_pattern, setting).await {
            Ok(()) => return Ok(()),
            Err(e @ SyncError::Mirror(_)) => return Err(e),
            Err(e) => e,
        };

        let Some(old_setting) = old_setting else {
            return Err(original);
        };
        let old_rule = Rule::new(scope, old_pattern, old_setting);
        tracing::info!(
            scope = %scope,
            old = %old_pattern,
            new = %new_pattern,
            error = %original,
            "Rename failed, restoring previous rule"
        );

        match self.write_rule(scope, old_pattern, old_setting).await {
            Ok(()) => Err(original),
            Err(restore) => {
                tracing::error!(
                    scope = %scope,
                    pattern = %old_pattern,
                    setting = %old_setting,
                    error = %restore,
                    "Restore failed, rule lost from mirror and remote store"
                );
                audit::record(&*self.inner.audit, audit::restore_failed(&old_rule, &restore));
                Err(SyncError::DoubleFailure {
                    original: Box::new(original),
                    restore: Box::new(restore),
                })
            }
        }
    }

    fn settle(&self, scope: &str, operation: Operation, result: &Result<()>) {
        let outcome = Outcome::of(result);
        let error = result.as_ref().err();

        match error {
            None => tracing::info!(scope = %scope, operation = %operation, "Rule transaction committed"),
            Some(e) => tracing::warn!(scope = %scope, operation = %operation, outcome = %outcome, error = %e, "Rule transaction failed"),
        }
        audit::record(
            &*self.inner.audit,
            audit::transaction_settled(scope, operation, outcome, error),
        );

        self.inner.notifier.publish(&ChangeEvent {
            scope: scope.to_string(),
            operation,
            outcome,
            error: error.map(ToString::to_string),
        });
    }
}

impl std::fmt::Debug for RuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleManager")
            .field("rebuild", &self.inner.rebuild)
            .field("notifier", &self.inner.notifier)
            .finish_non_exhaustive()
    }
}

/// Rule operations bound to one scope
#[derive(Clone, Debug)]
pub struct ScopedRules {
    manager: RuleManager,
    scope: String,
}

impl ScopedRules {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub async fn set(&self, pattern: &str, setting: Setting) -> Result<()> {
        self.manager.set(&self.scope, pattern, setting).await
    }

    pub async fn clear(&self, pattern: &str) -> Result<()> {
        self.manager.clear(&self.scope, pattern).await
    }

    pub async fn update(&self, old_pattern: &str, new_pattern: &str, setting: Setting) -> Result<()> {
        self.manager
            .update(&self.scope, old_pattern, new_pattern, setting)
            .await
    }

    pub fn get(&self, pattern: &str) -> Option<Setting> {
        self.manager.get(&self.scope, pattern)
    }

    pub fn get_all(&self) -> Vec<Rule> {
        self.manager.get_all(&self.scope)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.manager.subscribe(self.scope.clone(), callback)
    }

    pub fn last_error(&self) -> Option<String> {
        self.manager.last_error(&self.scope)
    }
}
