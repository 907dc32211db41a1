//! rulesync-engine: keeps permission rules consistent across two stores
//!
//! Rules live in two places:
//!
//! - a **mirror**: local, synchronous and enumerable. It records what the
//!   caller intends and answers every read.
//! - a **primary store**: remote and asynchronous. It enforces rules but
//!   can only write one rule or clear everything; it cannot be read.
//!
//! # Architecture
//!
//! ```text
//!   caller ──► RuleManager ──► Mirror            (sync, intent)
//!                  │
//!                  ├─────────► PrimaryClient     (async, effect)
//!                  │
//!                  ├─────────► RebuildCoordinator
//!                  │             clear all, replay survivors (join-all)
//!                  │
//!                  └─────────► ChangeNotifier ──► subscribers
//! ```
//!
//! Deleting one rule is emulated by clearing the remote store and
//! replaying every other rule from the mirror. Operations on one scope run
//! one at a time in arrival order; a rebuild excludes all concurrent writes.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use rulesync_api::Setting;
//! use rulesync_engine::{MemoryPrimaryStore, SyncPresets};
//!
//! # async fn example() -> rulesync_engine::Result<()> {
//! let (manager, _audit) = SyncPresets::testing(Arc::new(MemoryPrimaryStore::new()));
//!
//! let flash = manager.scope("adobe-flash-player");
//! flash.subscribe(|event| println!("{} {}: {}", event.scope, event.operation, event.outcome));
//!
//! flash.set("*.example.com/*", Setting::Allow).await?;
//! flash.clear("*.example.com/*").await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
mod error;
pub mod mirror;
pub mod notify;
pub mod primary;
pub mod rebuild;
pub mod transaction;
#[cfg(feature = "subscriber")]
pub mod tracing_support;

pub use config::{ConfigError, RuleManagerBuilder, SyncConfig, SyncPresets};
pub use error::{Outcome, ReplayFailure, Result, SyncError};
pub use mirror::{FileMirror, MemoryMirror, Mirror, MirrorError};
pub use notify::{ChangeEvent, ChangeNotifier, Operation, SubscriptionId};
pub use primary::{MemoryPrimaryStore, PrimaryCall, PrimaryClient, PrimaryError, PrimaryStore};
pub use rebuild::{RebuildCoordinator, RebuildReport};
pub use rulesync_api::{Rule, RuleKey, Setting};
pub use transaction::{RuleManager, ScopedRules};
