//! Change notification
//!
//! Subscribers register per scope and are invoked synchronously, once per
//! settled top-level operation. Events carry only enough to decide whether
//! to re-read; consumers call `get_all` for the full state.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

use crate::error::Outcome;

/// Top-level operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Set,
    Clear,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => f.write_str("set"),
            Self::Clear => f.write_str("clear"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// Published after an operation settles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub scope: String,
    pub operation: Operation,
    pub outcome: Outcome,
    /// Error message, if the operation did not commit
    pub error: Option<String>,
}

impl ChangeEvent {
    pub fn is_committed(&self) -> bool {
        self.outcome == Outcome::Committed
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct NotifierInner {
    next_id: u64,
    subscribers: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    last_errors: HashMap<String, String>,
}

/// Per-scope publish/subscribe hub
#[derive(Default)]
pub struct ChangeNotifier {
    inner: RwLock<NotifierInner>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, NotifierInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NotifierInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for changes to one scope
    pub fn subscribe<F>(&self, scope: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut inner = self.write();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .subscribers
            .entry(scope.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Receive a scope's change events on a channel
    ///
    /// The subscription stays active until unsubscribed, even if the
    /// receiver is dropped.
    pub fn subscribe_channel(
        &self,
        scope: impl Into<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(scope, move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.write();
        let mut found = false;
        inner.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    /// Number of active subscriptions for a scope
    pub fn subscriber_count(&self, scope: &str) -> usize {
        self.read().subscribers.get(scope).map_or(0, Vec::len)
    }

    /// Most recent error for a scope, cleared by the next commit
    pub fn last_error(&self, scope: &str) -> Option<String> {
        self.read().last_errors.get(scope).cloned()
    }

    /// Deliver an event to the scope's subscribers
    ///
    /// Callbacks run after the internal lock is released, so they may
    /// subscribe or unsubscribe.
    pub fn publish(&self, event: &ChangeEvent) {
        let callbacks: Vec<Callback> = {
            let mut inner = self.write();
            match &event.error {
                Some(message) => {
                    inner
                        .last_errors
                        .insert(event.scope.clone(), message.clone());
                }
                None if event.is_committed() => {
                    inner.last_errors.remove(&event.scope);
                }
                None => {}
            }
            inner
                .subscribers
                .get(&event.scope)
                .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback(event);
        }
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("ChangeNotifier")
            .field("scopes", &inner.subscribers.len())
            .field("errors", &inner.last_errors.len())
            .finish()
    }
}
