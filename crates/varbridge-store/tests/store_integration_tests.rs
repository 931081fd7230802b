use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use varbridge_core::{
    AccessRule, Constraints, DependencyEdge, DependencyKind, LockPolicy, Permission, ProgressReport,
    RegisterOptions, StoreConfig, TypeTag, UpdateKind, VarError, VariableId, VariableService, VariableValue,
    WatchOptions,
};
use varbridge_store::InMemoryVariableService;
use varbridge_test_utils::{
    consumer, init_test_logging, metadata, owner, session, FailingCallback, MockPropagator, RecordingCallback,
    RecordingPropagator,
};

const WAIT: Duration = Duration::from_secs(2);

fn service() -> Arc<InMemoryVariableService> {
    init_test_logging();
    Arc::new(InMemoryVariableService::new(StoreConfig::default()).unwrap())
}

fn bounded(min: f64, max: f64) -> RegisterOptions {
    RegisterOptions::default().constraints(Constraints::new().with("min", min).with("max", max))
}

#[tokio::test]
async fn test_register_get_set_versions() {
    let service = service();
    let session_id = session("basic");
    let owner = owner();

    let id = service
        .register_variable(&session_id, &owner, "temperature", TypeTag::Float, json!(0.7), bounded(0.0, 2.0))
        .await
        .unwrap();

    let info = service.get_variable_info(&session_id, &owner, "temperature").await.unwrap();
    assert_eq!(info.id, id);
    assert_eq!(info.version, 0);

    let version = service
        .set_variable(&session_id, &owner, &id.0, json!(1), metadata(&[("reason", "sweep")]))
        .await
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(
        service.get_variable(&session_id, &owner, "temperature").await.unwrap(),
        VariableValue::Float(1.0)
    );

    let history = service
        .get_history(&session_id, &owner, "temperature", None)
        .await
        .unwrap();
    assert_eq!(history.iter().map(|h| h.version).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(history[1].metadata.get("reason").map(String::as_str), Some("sweep"));
}

#[tokio::test]
async fn test_rejected_writes_leave_variable_untouched() {
    let service = service();
    let session_id = session("reject");
    let owner = owner();

    service
        .register_variable(&session_id, &owner, "temperature", TypeTag::Float, json!(0.7), bounded(0.0, 2.0))
        .await
        .unwrap();
    service
        .register_variable(
            &session_id,
            &owner,
            "model",
            TypeTag::String,
            json!("gpt"),
            RegisterOptions::default().read_only(),
        )
        .await
        .unwrap();

    let err = service
        .set_variable(&session_id, &owner, "temperature", json!(3.5), HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VarError::ValidationFailed(_)));

    let err = service
        .set_variable(&session_id, &owner, "model", json!("other"), HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err, VarError::ReadOnly("model".to_string()));

    let err = service
        .register_variable(&session_id, &owner, "model", TypeTag::String, json!("x"), RegisterOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, VarError::DuplicateName("model".to_string()));

    let info = service.get_variable_info(&session_id, &owner, "temperature").await.unwrap();
    assert_eq!(info.version, 0);
    assert_eq!(info.value, VariableValue::Float(0.7));
}

#[tokio::test]
async fn test_consumer_cannot_create_sessions() {
    let service = service();
    let err = service
        .register_variable(
            &session("missing"),
            &consumer("worker"),
            "x",
            TypeTag::Integer,
            json!(1),
            RegisterOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, VarError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_access_rules_govern_consumers() {
    let service = service();
    let session_id = session("access");
    let owner = owner();
    let reader = consumer("reader-1");
    let stranger = consumer("other");

    service
        .register_variable(
            &session_id,
            &owner,
            "lr",
            TypeTag::Float,
            json!(0.01),
            RegisterOptions::default().rule(AccessRule::glob("reader-*", [Permission::Read])),
        )
        .await
        .unwrap();

    assert!(service.get_variable(&session_id, &reader, "lr").await.is_ok());
    assert!(matches!(
        service.get_variable(&session_id, &stranger, "lr").await,
        Err(VarError::AccessDenied { .. })
    ));
    assert!(!service
        .check_access(&session_id, &reader, "lr", Permission::Write)
        .await
        .unwrap());

    // Only the owner may change the rules
    let err = service
        .set_access_rules(&session_id, &reader, "lr", vec![AccessRule::any([Permission::Write])])
        .await
        .unwrap_err();
    assert!(matches!(err, VarError::AccessDenied { .. }));

    service
        .set_access_rules(
            &session_id,
            &owner,
            "lr",
            vec![AccessRule::any([Permission::Read, Permission::Write])],
        )
        .await
        .unwrap();
    assert_eq!(
        service
            .set_variable(&session_id, &stranger, "lr", json!(0.02), HashMap::new())
            .await
            .unwrap(),
        1
    );

    // Unreadable identifiers are left out of batch reads
    service
        .set_access_rules(&session_id, &owner, "lr", vec![AccessRule::glob("reader-*", [Permission::Read])])
        .await
        .unwrap();
    let values = service
        .get_variables(&session_id, &stranger, &["lr".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert!(values.is_empty());
}

#[tokio::test]
async fn test_atomic_batch_is_all_or_nothing() {
    let service = service();
    let session_id = session("batch");
    let owner = owner();

    service
        .register_variable(&session_id, &owner, "a", TypeTag::Integer, json!(1), RegisterOptions::default())
        .await
        .unwrap();
    service
        .register_variable(&session_id, &owner, "b", TypeTag::Integer, json!(2), RegisterOptions::default())
        .await
        .unwrap();

    let updates = BTreeMap::from([("a".to_string(), json!(10)), ("b".to_string(), json!("nope"))]);
    let err = service
        .set_variables(&session_id, &owner, updates.clone(), HashMap::new(), true)
        .await
        .unwrap_err();
    match err {
        VarError::PartialFailure(failures) => {
            assert_eq!(failures.keys().cloned().collect::<Vec<_>>(), vec!["b".to_string()]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        service.get_variable(&session_id, &owner, "a").await.unwrap(),
        VariableValue::Integer(1)
    );

    let results = service
        .set_variables(&session_id, &owner, updates, HashMap::new(), false)
        .await
        .unwrap();
    assert_eq!(results.get("a"), Some(&Ok(1)));
    assert!(matches!(results.get("b"), Some(Err(VarError::ValidationFailed(_)))));
    assert_eq!(
        service.get_variable(&session_id, &owner, "a").await.unwrap(),
        VariableValue::Integer(10)
    );
}

#[tokio::test]
async fn test_dependencies_guard_delete_and_reject_cycles() {
    let service = service();
    let session_id = session("deps");
    let owner = owner();

    for name in ["base", "derived", "leaf"] {
        service
            .register_variable(&session_id, &owner, name, TypeTag::Float, json!(1.0), RegisterOptions::default())
            .await
            .unwrap();
    }
    service
        .add_dependency(&session_id, &owner, "base", "derived", DependencyKind::Data)
        .await
        .unwrap();
    service
        .add_dependency(&session_id, &owner, "derived", "leaf", DependencyKind::Data)
        .await
        .unwrap();

    let err = service
        .add_dependency(&session_id, &owner, "leaf", "base", DependencyKind::Data)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        VarError::WouldCreateCycle {
            from: "leaf".to_string(),
            to: "base".to_string()
        }
    );

    let order = service.get_update_order(&session_id, "base").await.unwrap();
    let names: Vec<String> = {
        let mut names = Vec::new();
        for id in &order {
            names.push(service.get_variable_info(&session_id, &owner, &id.0).await.unwrap().name);
        }
        names
    };
    assert_eq!(names, vec!["base", "derived", "leaf"]);

    let err = service.delete_variable(&session_id, &owner, "base").await.unwrap_err();
    assert_eq!(
        err,
        VarError::HasDependents {
            variable: "base".to_string(),
            dependents: vec!["derived".to_string()]
        }
    );

    assert!(service
        .remove_dependency(&session_id, &owner, "base", "derived")
        .await
        .unwrap());
    service.delete_variable(&session_id, &owner, "base").await.unwrap();
    assert!(matches!(
        service.get_variable(&session_id, &owner, "base").await,
        Err(VarError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_committed_change_reaches_propagator() {
    init_test_logging();
    let propagator = RecordingPropagator::new();
    let service = InMemoryVariableService::builder()
        .propagator(propagator.clone())
        .build()
        .unwrap();
    let session_id = session("propagate");
    let owner = owner();

    let base = service
        .register_variable(&session_id, &owner, "base", TypeTag::Float, json!(1.0), RegisterOptions::default())
        .await
        .unwrap();
    let derived = service
        .register_variable(&session_id, &owner, "derived", TypeTag::Float, json!(2.0), RegisterOptions::default())
        .await
        .unwrap();
    service
        .add_dependency(&session_id, &owner, "base", "derived", DependencyKind::Data)
        .await
        .unwrap();

    // No dependents, no propagation
    service
        .set_variable(&session_id, &owner, "derived", json!(3.0), HashMap::new())
        .await
        .unwrap();
    service
        .set_variable(&session_id, &owner, "base", json!(5.0), HashMap::new())
        .await
        .unwrap();

    let requests = propagator.wait_for(1, WAIT).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].changed, base);
    assert_eq!(requests[0].order, vec![base, derived]);
    assert_eq!(requests[0].value, VariableValue::Float(5.0));
}

#[tokio::test]
async fn test_propagation_failure_does_not_fail_the_write() {
    init_test_logging();
    let mut propagator = MockPropagator::new();
    propagator
        .expect_propagate()
        .times(1)
        .returning(|_| Err(VarError::Unavailable("evaluator offline".to_string())));
    let service = InMemoryVariableService::builder()
        .propagator(Arc::new(propagator))
        .build()
        .unwrap();
    let session_id = session("mock");
    let owner = owner();

    for name in ["x", "y"] {
        service
            .register_variable(&session_id, &owner, name, TypeTag::Integer, json!(0), RegisterOptions::default())
            .await
            .unwrap();
    }
    service
        .add_dependency(&session_id, &owner, "x", "y", DependencyKind::Data)
        .await
        .unwrap();

    assert_eq!(
        service
            .set_variable(&session_id, &owner, "x", json!(1), HashMap::new())
            .await
            .unwrap(),
        1
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_watch_delivers_initial_then_updates_in_order() {
    let service = service();
    let session_id = session("watch");
    let owner = owner();
    let worker = consumer("worker");

    service
        .register_variable(&session_id, &owner, "step", TypeTag::Integer, json!(0), RegisterOptions::default())
        .await
        .unwrap();

    let mut watch = service
        .watch_variables(&session_id, &worker, &["step".to_string()], WatchOptions::default().include_initial())
        .await
        .unwrap();

    for value in 1..=5 {
        service
            .set_variable(&session_id, &owner, "step", json!(value), HashMap::new())
            .await
            .unwrap();
    }

    let first = timeout(WAIT, watch.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind, UpdateKind::Initial);
    assert_eq!(first.version, 0);

    let versions: Vec<u64> = timeout(WAIT, (&mut watch).take(5).map(|update| update.version).collect())
        .await
        .unwrap();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    // Equal values commit but are not announced
    let version = service
        .set_variable(&session_id, &owner, "step", json!(5), HashMap::new())
        .await
        .unwrap();
    assert_eq!(version, 6);
    assert!(timeout(Duration::from_millis(100), watch.recv()).await.is_err());
}

#[tokio::test]
async fn test_dropping_a_watch_unsubscribes() {
    let service = service();
    let session_id = session("drop");
    let owner = owner();

    service
        .register_variable(&session_id, &owner, "flag", TypeTag::Boolean, json!(false), RegisterOptions::default())
        .await
        .unwrap();
    let store = service.store(&session_id).unwrap();

    let watch = service
        .watch_variables(&session_id, &owner, &["flag".to_string()], WatchOptions::default())
        .await
        .unwrap();
    assert_eq!(store.observer_count(), 1);

    drop(watch);
    assert_eq!(store.observer_count(), 0);
}

#[tokio::test]
async fn test_failing_observer_is_isolated() {
    let service = service();
    let session_id = session("isolation");
    let owner = owner();

    service
        .register_variable(&session_id, &owner, "n", TypeTag::Integer, json!(0), RegisterOptions::default())
        .await
        .unwrap();

    let failing = FailingCallback::new();
    let recording = RecordingCallback::new();
    service
        .add_observer(&session_id, &owner, &["n".to_string()], failing.clone(), Default::default())
        .await
        .unwrap();
    service
        .add_observer(&session_id, &owner, &["n".to_string()], recording.clone(), Default::default())
        .await
        .unwrap();

    for value in 1..=3 {
        service
            .set_variable(&session_id, &owner, "n", json!(value), HashMap::new())
            .await
            .unwrap();
    }

    recording.wait_for(3, WAIT).await;
    assert_eq!(recording.versions(), vec![1, 2, 3]);
    timeout(WAIT, async {
        while failing.calls() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_optimization_lock_gates_writes() {
    let service = service();
    let session_id = session("lock");
    let owner = owner();
    let optimizer = consumer("optimizer-a");
    let rival = consumer("optimizer-b");

    service
        .register_variable(&session_id, &owner, "lr", TypeTag::Float, json!(0.1), RegisterOptions::default())
        .await
        .unwrap();

    let lock = service
        .acquire_lock(&session_id, &optimizer, "lr", LockPolicy::Abort, None)
        .await
        .unwrap();
    assert_eq!(lock.optimizer_id, "optimizer-a");

    assert!(matches!(
        service
            .acquire_lock(&session_id, &rival, "lr", LockPolicy::Abort, None)
            .await,
        Err(VarError::LockHeldBy(holder)) if holder == "optimizer-a"
    ));
    assert!(matches!(
        service
            .set_variable(&session_id, &owner, "lr", json!(0.2), HashMap::new())
            .await,
        Err(VarError::LockHeldBy(_))
    ));
    service
        .set_variable(&session_id, &optimizer, "lr", json!(0.05), HashMap::new())
        .await
        .unwrap();

    assert!(service
        .report_progress(
            &session_id,
            &optimizer,
            "lr",
            ProgressReport::new(1, 0.05).with_metric("loss", 0.4),
        )
        .await
        .unwrap());

    service.release_lock(&session_id, &optimizer, "lr").await.unwrap();
    assert!(service.get_lock(&session_id, "lr").await.unwrap().is_none());
    service
        .set_variable(&session_id, &owner, "lr", json!(0.2), HashMap::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_destroy_session_ends_watches_and_fails_waiters() {
    let service = service();
    let session_id = session("destroy");
    let owner = owner();
    let holder = consumer("holder");
    let waiter = consumer("waiter");

    service
        .register_variable(&session_id, &owner, "x", TypeTag::Integer, json!(0), RegisterOptions::default())
        .await
        .unwrap();
    let mut watch = service
        .watch_variables(&session_id, &owner, &["x".to_string()], WatchOptions::default())
        .await
        .unwrap();
    service
        .acquire_lock(&session_id, &holder, "x", LockPolicy::Abort, None)
        .await
        .unwrap();

    let pending = {
        let service = service.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            service
                .acquire_lock(&session_id, &waiter, "x", LockPolicy::Wait, Some(Duration::from_secs(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    service.destroy_session(&session_id).await.unwrap();

    assert!(timeout(WAIT, watch.recv()).await.unwrap().is_none());
    let result = timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(VarError::SessionNotFound(_))));
    assert!(matches!(
        service.get_variable(&session_id, &owner, "x").await,
        Err(VarError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_persist_and_restore_round_trip() {
    let service = service();
    let session_id = session("persist");
    let owner = owner();

    service
        .register_variable(&session_id, &owner, "a", TypeTag::Float, json!(1.5), bounded(0.0, 10.0))
        .await
        .unwrap();
    service
        .register_variable(
            &session_id,
            &owner,
            "b",
            TypeTag::Float,
            json!(2.5),
            RegisterOptions::default().rule(AccessRule::any([Permission::Read])),
        )
        .await
        .unwrap();
    service
        .add_dependency(&session_id, &owner, "a", "b", DependencyKind::Data)
        .await
        .unwrap();
    service
        .set_variable(&session_id, &owner, "a", json!(3.0), HashMap::new())
        .await
        .unwrap();

    let before = service.export_state(&session_id).await.unwrap();
    service.persist_session(&session_id).await.unwrap();
    service.destroy_session(&session_id).await.unwrap();

    service.restore_session(&session_id).await.unwrap();
    let after = service.export_state(&session_id).await.unwrap();
    assert_eq!(after.variables, before.variables);
    assert_eq!(after.dependencies, before.dependencies);
}

#[tokio::test]
async fn test_import_rejects_cycles_without_changes() {
    let service = service();
    let session_id = session("import");
    let owner = owner();

    for name in ["a", "b"] {
        service
            .register_variable(&session_id, &owner, name, TypeTag::Integer, json!(1), RegisterOptions::default())
            .await
            .unwrap();
    }
    service
        .add_dependency(&session_id, &owner, "a", "b", DependencyKind::Data)
        .await
        .unwrap();

    let mut snapshot = service.export_state(&session_id).await.unwrap();
    let reversed = DependencyEdge {
        from: snapshot.dependencies[0].to.clone(),
        to: snapshot.dependencies[0].from.clone(),
        kind: DependencyKind::Data,
    };
    snapshot.dependencies.push(reversed);

    assert!(matches!(
        service.import_state(snapshot).await,
        Err(VarError::WouldCreateCycle { .. })
    ));
    assert_eq!(service.export_state(&session_id).await.unwrap().dependencies.len(), 1);
}

#[tokio::test]
async fn test_rejected_import_does_not_create_the_session() {
    let service = service();
    let source = session("source");
    let owner = owner();

    service
        .register_variable(&source, &owner, "a", TypeTag::Integer, json!(1), RegisterOptions::default())
        .await
        .unwrap();
    let mut snapshot = service.export_state(&source).await.unwrap();
    let target = session("migrated");
    snapshot.session_id = target.clone();
    snapshot.dependencies.push(DependencyEdge {
        from: snapshot.variables[0].id.clone(),
        to: VariableId("var_missing".to_string()),
        kind: DependencyKind::Data,
    });

    assert_eq!(
        service.import_state(snapshot.clone()).await.unwrap_err(),
        VarError::NotFound("var_missing".to_string())
    );
    assert_eq!(service.list_sessions().await.unwrap(), vec![source.clone()]);
    assert!(matches!(
        service.export_state(&target).await,
        Err(VarError::SessionNotFound(_))
    ));

    snapshot.dependencies.clear();
    service.import_state(snapshot).await.unwrap();
    assert_eq!(
        service.get_variable(&target, &owner, "a").await.unwrap(),
        VariableValue::Integer(1)
    );
}
