//! Integration tests for rule synchronization against an in-memory remote store

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rulesync_engine::{
    ChangeEvent, MemoryPrimaryStore, Operation, Outcome, PrimaryCall, Rule, RuleManager, Setting,
    SyncError, SyncPresets,
};

fn setup() -> (RuleManager, Arc<MemoryPrimaryStore>) {
    let store = Arc::new(MemoryPrimaryStore::new());
    let (manager, _audit) = SyncPresets::testing(store.clone());
    (manager, store)
}

async fn seed(manager: &RuleManager, store: &MemoryPrimaryStore, rules: &[Rule]) {
    for rule in rules {
        manager
            .set(&rule.scope, &rule.pattern, rule.setting)
            .await
            .expect("seeding should succeed");
    }
    store.reset_calls();
}

fn record_events(manager: &RuleManager, scope: &str) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.subscribe(scope, move |event| sink.lock().unwrap().push(event.clone()));
    events
}

fn patterns(rules: &[Rule]) -> Vec<&str> {
    rules.iter().map(|r| r.pattern.as_str()).collect()
}

#[tokio::test]
async fn test_set_is_idempotent() {
    let (manager, store) = setup();

    manager.set("flash", "p1", Setting::Allow).await.unwrap();
    let mirror_once = manager.get_all("flash");
    let remote_once = store.rules();

    manager.set("flash", "p1", Setting::Allow).await.unwrap();

    assert_eq!(manager.get_all("flash"), mirror_once);
    assert_eq!(store.rules(), remote_once);
}

#[tokio::test]
async fn test_get_all_reflects_set_and_clear_sequence() {
    let (manager, store) = setup();

    manager.set("flash", "a", Setting::Allow).await.unwrap();
    manager.set("flash", "b", Setting::Block).await.unwrap();
    manager.set("flash", "c", Setting::Ask).await.unwrap();
    manager.clear("flash", "b").await.unwrap();
    manager.set("flash", "a", Setting::Block).await.unwrap();
    manager.set("java", "a", Setting::Allow).await.unwrap();

    assert_eq!(
        manager.get_all("flash"),
        vec![Rule::block("flash", "a"), Rule::ask("flash", "c")]
    );
    assert_eq!(manager.get_all("java"), vec![Rule::allow("java", "a")]);

    // Remote converges on the same rule set
    let mut remote = store.rules();
    remote.sort_by(|x, y| x.key().cmp(&y.key()));
    let mut local = manager.get_all("flash");
    local.extend(manager.get_all("java"));
    local.sort_by(|x, y| x.key().cmp(&y.key()));
    assert_eq!(remote, local);
}

#[tokio::test]
async fn test_clear_rebuilds_without_removed_rule() {
    let (manager, store) = setup();
    let rules: Vec<Rule> = (1..=5).map(|i| Rule::allow("flash", format!("p{i}"))).collect();
    seed(&manager, &store, &rules).await;

    manager.clear("flash", "p3").await.unwrap();

    assert_eq!(patterns(&manager.get_all("flash")), vec!["p1", "p2", "p4", "p5"]);
    assert_eq!(store.clear_count(), 1);
    assert_eq!(store.set_count(), 4);
    assert_eq!(store.calls()[0], PrimaryCall::ClearAll);
    assert!(!store.rules().iter().any(|r| r.pattern == "p3"));
}

#[tokio::test]
async fn test_replay_failure_is_contained() {
    let (manager, store) = setup();
    let rules: Vec<Rule> = (1..=5).map(|i| Rule::allow("flash", format!("p{i}"))).collect();
    seed(&manager, &store, &rules).await;
    store.fail_set("flash", "p4");
    let events = record_events(&manager, "flash");

    let err = manager.clear("flash", "p1").await.unwrap_err();

    let failures = err.replay_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].rule, Rule::allow("flash", "p4"));
    assert_eq!(store.set_count(), 4);
    assert_eq!(patterns(&manager.get_all("flash")), vec!["p2", "p3", "p5"]);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, Outcome::Failed);
    assert!(events[0].error.is_some());
}

#[tokio::test]
async fn test_failed_clear_keeps_removal_intent() {
    let (manager, store) = setup();
    seed(&manager, &store, &[Rule::allow("flash", "p1"), Rule::block("flash", "p2")]).await;
    store.fail_clear_once();

    let err = manager.clear("flash", "p1").await.unwrap_err();

    assert!(matches!(err, SyncError::ClearFailed(_)));
    assert_eq!(manager.get_all("flash"), vec![Rule::block("flash", "p2")]);
    assert_eq!(store.calls(), vec![PrimaryCall::ClearAll]);
    assert!(manager.last_error("flash").is_some());
}

#[tokio::test]
async fn test_update_rollback_restores_old_rule() {
    let (manager, store) = setup();
    seed(&manager, &store, &[Rule::ask("flash", "a")]).await;
    store.fail_set("flash", "b");
    let before = manager.get_all("flash");

    let err = manager
        .update("flash", "a", "b", Setting::Allow)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::WriteFailed { ref key, .. } if key.pattern == "b"));
    assert_eq!(manager.get_all("flash"), before);
    assert_eq!(
        store.calls(),
        vec![
            PrimaryCall::ClearAll,
            PrimaryCall::SetRule(Rule::allow("flash", "b")),
            PrimaryCall::SetRule(Rule::ask("flash", "a")),
        ]
    );
    assert_eq!(store.rules(), vec![Rule::ask("flash", "a")]);
}

#[tokio::test]
async fn test_update_double_failure() {
    let (manager, store) = setup();
    seed(&manager, &store, &[Rule::ask("flash", "a")]).await;
    store.fail_set("flash", "b");
    store.fail_set("flash", "a");
    let events = record_events(&manager, "flash");

    let err = manager
        .update("flash", "a", "b", Setting::Allow)
        .await
        .unwrap_err();

    assert!(err.is_double_failure());
    assert_eq!(err.outcome(), Outcome::PartiallyFailed);
    assert!(manager.get("flash", "a").is_none());
    assert!(manager.get("flash", "b").is_none());
    assert!(manager.get_all("flash").is_empty());
    assert!(store.rules().is_empty());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Operation::Update);
    assert_eq!(events[0].outcome, Outcome::PartiallyFailed);
}

#[tokio::test]
async fn test_rename_scenario() {
    let (manager, store) = setup();
    seed(&manager, &store, &[Rule::allow("flash", "p1")]).await;
    let events = record_events(&manager, "flash");

    manager
        .update("flash", "p1", "p2", Setting::Block)
        .await
        .unwrap();

    assert_eq!(manager.get_all("flash"), vec![Rule::block("flash", "p2")]);
    assert_eq!(
        store.calls(),
        vec![
            PrimaryCall::ClearAll,
            PrimaryCall::SetRule(Rule::block("flash", "p2")),
        ]
    );

    // One event for the whole update, not one per internal step
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_committed());
}

#[tokio::test]
async fn test_back_to_back_clears_do_not_interleave() {
    let store = Arc::new(MemoryPrimaryStore::new().with_latency(Duration::from_millis(5)));
    let (manager, _audit) = SyncPresets::testing(store.clone());
    let rules: Vec<Rule> = ["a", "b", "c", "d"]
        .iter()
        .map(|p| Rule::allow("flash", *p))
        .collect();
    seed(&manager, &store, &rules).await;

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.clear("flash", "a").await }
    });
    let second = tokio::spawn({
        let manager = manager.clone();
        async move { manager.clear("flash", "b").await }
    });
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let calls = store.calls();
    assert_eq!(calls.len(), 7);
    assert_eq!(calls[0], PrimaryCall::ClearAll);
    assert!(calls[1..4].iter().all(|c| matches!(c, PrimaryCall::SetRule(_))));
    assert_eq!(calls[4], PrimaryCall::ClearAll);
    assert!(calls[5..].iter().all(|c| matches!(c, PrimaryCall::SetRule(_))));

    assert_eq!(patterns(&manager.get_all("flash")), vec!["c", "d"]);
    assert_eq!(store.rules().len(), 2);
}

#[tokio::test]
async fn test_write_on_other_scope_survives_concurrent_rebuild() {
    let store = Arc::new(MemoryPrimaryStore::new().with_latency(Duration::from_millis(5)));
    let (manager, _audit) = SyncPresets::testing(store.clone());
    seed(&manager, &store, &[Rule::allow("flash", "a"), Rule::allow("flash", "b")]).await;

    let clear = tokio::spawn({
        let manager = manager.clone();
        async move { manager.clear("flash", "a").await }
    });
    let set = tokio::spawn({
        let manager = manager.clone();
        async move { manager.set("java", "j1", Setting::Block).await }
    });
    clear.await.unwrap().unwrap();
    set.await.unwrap().unwrap();

    let mut remote = store.rules();
    remote.sort_by(|x, y| x.key().cmp(&y.key()));
    assert_eq!(
        remote,
        vec![Rule::allow("flash", "b"), Rule::block("java", "j1")]
    );
    assert_eq!(manager.get("java", "j1"), Some(Setting::Block));
}

#[tokio::test]
async fn test_error_message_cleared_by_next_success() {
    let (manager, store) = setup();
    store.fail_set_once("flash", "p1");

    assert!(manager.set("flash", "p1", Setting::Allow).await.is_err());
    let message = manager.last_error("flash").expect("error should be kept");
    assert!(message.contains("p1"));

    manager.set("flash", "p2", Setting::Allow).await.unwrap();
    assert_eq!(manager.last_error("flash"), None);
}

#[tokio::test]
async fn test_channel_subscription_sees_each_operation() {
    let (manager, _store) = setup();
    let (id, mut rx) = manager.notifier().subscribe_channel("flash");

    manager.set("flash", "p1", Setting::Allow).await.unwrap();
    manager.update("flash", "p1", "p1", Setting::Block).await.unwrap();
    manager.clear("flash", "p1").await.unwrap();
    manager.set("java", "p1", Setting::Allow).await.unwrap();

    let ops: Vec<Operation> = [rx.recv().await, rx.recv().await, rx.recv().await]
        .into_iter()
        .map(|e| e.unwrap().operation)
        .collect();
    assert_eq!(ops, vec![Operation::Set, Operation::Update, Operation::Clear]);
    assert!(rx.try_recv().is_err());
    assert!(manager.unsubscribe(id));
}
