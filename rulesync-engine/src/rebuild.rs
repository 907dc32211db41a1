//! Per-rule deletion on top of a clear-everything remote store
//!
//! The remote store can only delete by clearing every rule in every scope.
//! Removing one rule therefore means: drop it from the mirror, clear the
//! remote store, then replay every surviving mirror rule. Replays run
//! concurrently and are joined; one failed replay never stops the others.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use rulesync_api::{Rule, Setting};
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::audit::{self, AuditSink};
use crate::error::{ReplayFailure, Result, SyncError};
use crate::mirror::Mirror;
use crate::primary::PrimaryClient;

/// Summary of a completed rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Setting of the removed rule, if it was present in the mirror
    pub removed: Option<Setting>,
    /// Number of rules successfully rewritten
    pub replayed: usize,
    /// Rules that could not be rewritten (now dropped from the mirror)
    pub failures: Vec<ReplayFailure>,
}

impl RebuildReport {
    /// True if every surviving rule was replayed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Rebuilds the remote store from the mirror
///
/// The coordinator does not serialize itself; callers must ensure no other
/// rebuild or rule write against the same store runs concurrently.
pub struct RebuildCoordinator {
    mirror: Arc<dyn Mirror>,
    primary: PrimaryClient,
    audit: Arc<dyn AuditSink>,
    replay_limit: Option<NonZeroUsize>,
}

impl RebuildCoordinator {
    pub fn new(
        mirror: Arc<dyn Mirror>,
        primary: PrimaryClient,
        audit: Arc<dyn AuditSink>,
        replay_limit: Option<NonZeroUsize>,
    ) -> Self {
        Self {
            mirror,
            primary,
            audit,
            replay_limit,
        }
    }

    /// Maximum number of concurrent replay writes (`None` = unbounded)
    pub fn replay_limit(&self) -> Option<NonZeroUsize> {
        self.replay_limit
    }

    /// Remove one rule by clearing the remote store and replaying the rest
    ///
    /// The mirror reflects the removal before any remote call is made, so
    /// the caller's intent survives a failed clear. A replay failure drops
    /// that rule from the mirror too and is returned in the report rather
    /// than as an error.
    #[tracing::instrument(name = "rebuild", skip(self))]
    pub async fn rebuild_except(&self, scope: &str, pattern: &str) -> Result<RebuildReport> {
        let removed = self.mirror.remove(scope, pattern)?;

        if let Err(e) = self.primary.clear_all().await {
            tracing::warn!(scope = %scope, pattern = %pattern, error = %e, "Remote clear failed, rebuild aborted");
            audit::record(&*self.audit, audit::clear_failed(scope, pattern, &e));
            return Err(SyncError::ClearFailed(e));
        }
        audit::record(&*self.audit, audit::remote_cleared(scope, pattern));

        let survivors = self.mirror.get_all_scopes_and_rules();
        let total = survivors.len();
        let failures = self.replay(survivors).await;

        for failure in &failures {
            let rule = &failure.rule;
            self.mirror.remove(&rule.scope, &rule.pattern)?;
            tracing::warn!(
                scope = %rule.scope,
                pattern = %rule.pattern,
                setting = %rule.setting,
                error = %failure.error,
                "Rule could not be restored after clear, dropped from mirror"
            );
            audit::record(&*self.audit, audit::replay_dropped(rule, &failure.error));
        }

        let report = RebuildReport {
            removed,
            replayed: total - failures.len(),
            failures,
        };
        tracing::debug!(
            scope = %scope,
            pattern = %pattern,
            replayed = report.replayed,
            failed = report.failures.len(),
            "Rebuild complete"
        );
        Ok(report)
    }

    /// Write every rule, waiting for all writes to settle
    async fn replay(&self, rules: Vec<Rule>) -> Vec<ReplayFailure> {
        if rules.is_empty() {
            return Vec::new();
        }

        let writes = rules.into_iter().map(|rule| async move {
            let result = self.primary.set_rule(&rule).await;
            (rule, result)
        });

        let results: Vec<_> = match self.replay_limit {
            None => join_all(writes).await,
            Some(limit) => stream::iter(writes).buffer_unordered(limit.get()).collect().await,
        };

        results
            .into_iter()
            .filter_map(|(rule, result)| result.err().map(|error| ReplayFailure { rule, error }))
            .collect()
    }
}

impl std::fmt::Debug for RebuildCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildCoordinator")
            .field("replay_limit", &self.replay_limit)
            .finish_non_exhaustive()
    }
}
