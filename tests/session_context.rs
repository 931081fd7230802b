use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use varbridge::prelude::*;
use varbridge_test_utils::{consumer, init_test_logging, owner, session};

async fn setup() -> (Arc<InMemoryVariableService>, SessionId) {
    init_test_logging();
    let service = varbridge::in_memory_service(StoreConfig::default()).unwrap();
    let session_id = session("context");
    for (name, value) in [("batch_size", 32), ("epochs", 10)] {
        service
            .register_variable(&session_id, &owner(), name, TypeTag::Integer, json!(value), RegisterOptions::default())
            .await
            .unwrap();
    }
    (service, session_id)
}

async fn wait_for_empty_cache(context: &SessionContext) {
    timeout(Duration::from_secs(2), async {
        while context.cached_len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cache_serves_reads_until_invalidated() {
    let (service, session_id) = setup().await;
    let context = SessionContext::new(service.clone(), session_id.clone(), consumer("worker"), Duration::from_secs(60));

    assert_eq!(context.get("batch_size").await.unwrap(), VariableValue::Integer(32));
    assert_eq!(context.cached_len(), 1);

    // A write from elsewhere is not seen while the entry is fresh
    service
        .set_variable(&session_id, &owner(), "batch_size", json!(64), HashMap::new())
        .await
        .unwrap();
    assert_eq!(context.get("batch_size").await.unwrap(), VariableValue::Integer(32));

    context.invalidate(Some("batch_size"));
    assert_eq!(context.get("batch_size").await.unwrap(), VariableValue::Integer(64));
}

#[tokio::test]
async fn test_local_writes_drop_the_cached_entry() {
    let (service, session_id) = setup().await;
    let context = SessionContext::new(service, session_id, consumer("worker"), Duration::from_secs(60));

    let values = context
        .get_many(&["batch_size".to_string(), "epochs".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(context.cached_len(), 2);

    assert_eq!(context.set("epochs", 20).await.unwrap(), 1);
    assert_eq!(context.cached_len(), 1);
    assert_eq!(context.get("epochs").await.unwrap(), VariableValue::Integer(20));
}

#[tokio::test]
async fn test_watch_invalidates_on_remote_changes() {
    let (service, session_id) = setup().await;
    let mut context = SessionContext::new(service.clone(), session_id.clone(), consumer("worker"), Duration::from_secs(60));
    context
        .watch_for_invalidation(&["batch_size".to_string()])
        .await
        .unwrap();
    assert!(context.is_watching());

    context.get("batch_size").await.unwrap();
    service
        .set_variable(&session_id, &owner(), "batch_size", json!(128), HashMap::new())
        .await
        .unwrap();

    wait_for_empty_cache(&context).await;
    assert_eq!(context.get("batch_size").await.unwrap(), VariableValue::Integer(128));
}

#[tokio::test]
async fn test_destroyed_session_stops_the_invalidation_watch() {
    let (service, session_id) = setup().await;
    let mut context = SessionContext::new(service.clone(), session_id.clone(), consumer("worker"), Duration::from_secs(60));
    context.watch_for_invalidation(&["epochs".to_string()]).await.unwrap();
    context.get("epochs").await.unwrap();

    service.destroy_session(&session_id).await.unwrap();

    wait_for_empty_cache(&context).await;
    assert!(matches!(
        context.get("epochs").await,
        Err(VarError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_writes_by_name_drop_entries_read_by_id() {
    let (service, session_id) = setup().await;
    let info = service
        .get_variable_info(&session_id, &owner(), "batch_size")
        .await
        .unwrap();
    let id = info.id.0.clone();
    let context = SessionContext::new(service, session_id, consumer("worker"), Duration::from_secs(60));

    assert_eq!(context.get(&id).await.unwrap(), VariableValue::Integer(32));
    assert_eq!(context.get("batch_size").await.unwrap(), VariableValue::Integer(32));
    assert_eq!(context.cached_len(), 1);

    context.set("batch_size", 64).await.unwrap();
    assert_eq!(context.cached_len(), 0);
    assert_eq!(context.get(&id).await.unwrap(), VariableValue::Integer(64));

    context.set(&id, 128).await.unwrap();
    assert_eq!(context.get("batch_size").await.unwrap(), VariableValue::Integer(128));

    context.get(&id).await.unwrap();
    context.invalidate(Some("batch_size"));
    assert_eq!(context.cached_len(), 0);
}
