//! Registry and connection test integration tests

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use fleetd::errors::FleetError;
use fleetd::filesys::file::File;
use fleetd::models::target::TargetStatus;
use fleetd::registry::ServerRegistry;
use fleetd::transport::simulated::SimulatedExecutor;

use crate::common::{app, new_target, temp_dir};

#[tokio::test]
async fn test_bad_host_rejected_before_network() {
    let executor = Arc::new(SimulatedExecutor::new());
    let app = app(executor.clone());

    let err = app
        .registry
        .add(new_target("web", "bad host!"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::ValidationError { field: "host", .. }));
    assert!(app.registry.list().await.is_empty());
    assert!(executor.commands_for("bad host!").is_empty());
}

#[tokio::test]
async fn test_field_specific_validation() {
    let registry = ServerRegistry::in_memory();

    let mut target = new_target("", "10.0.0.1");
    let err = registry.add(target.clone()).await.unwrap_err();
    assert!(matches!(err, FleetError::ValidationError { field: "name", .. }));

    target.name = "web".to_string();
    target.username = "Root User".to_string();
    let err = registry.add(target.clone()).await.unwrap_err();
    assert!(matches!(err, FleetError::ValidationError { field: "username", .. }));

    target.username = "deploy".to_string();
    target.key_locator = "  ".to_string();
    let err = registry.add(target).await.unwrap_err();
    assert!(matches!(err, FleetError::ValidationError { field: "key_locator", .. }));
}

#[tokio::test]
async fn test_registry_persists_in_insertion_order() {
    let dir = temp_dir();
    let path = dir.join("servers.json");

    let registry = ServerRegistry::open(File::new(&path)).await.unwrap();
    let first = registry.add(new_target("one", "10.0.0.1")).await.unwrap();
    let second = registry.add(new_target("two", "10.0.0.2")).await.unwrap();
    let third = registry.add(new_target("three", "host-3.example")).await.unwrap();
    assert!(assert_ok!(registry.remove(&second.id).await));

    // Unknown ids are a no-op
    assert!(!assert_ok!(registry.remove("srv-missing").await));

    let reopened = ServerRegistry::open(File::new(&path)).await.unwrap();
    let names: Vec<String> = reopened.list().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["one", "three"]);
    assert_eq!(reopened.get(&first.id).await.unwrap().id, first.id);
    assert_eq!(reopened.get(&third.id).await.unwrap().host, "host-3.example");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_concurrent_adds_are_serialized() {
    let dir = temp_dir();
    let path = dir.join("servers.json");
    let registry = Arc::new(ServerRegistry::open(File::new(&path)).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..20 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .add(new_target(&format!("node-{i}"), &format!("10.0.1.{i}")))
                .await
        }));
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    assert_eq!(registry.list().await.len(), 20);
    let reopened = ServerRegistry::open(File::new(&path)).await.unwrap();
    assert_eq!(reopened.list().await.len(), 20);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_connection_results_update_status() {
    let executor = SimulatedExecutor::new()
        .deny_auth("denied.example")
        .unreachable("down.example", "Connection timed out");
    let app = app(Arc::new(executor));

    let ok = app.registry.add(new_target("ok", "ok.example")).await.unwrap();
    let denied = app.registry.add(new_target("denied", "denied.example")).await.unwrap();
    let down = app.registry.add(new_target("down", "down.example")).await.unwrap();

    let result = app.test_server(&ok.id).await.unwrap();
    assert!(result.success);
    assert_eq!(
        app.registry.get(&ok.id).await.unwrap().status,
        TargetStatus::Connected
    );

    // Only pending or failed targets are re-tested
    let results = app.test_pending().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.success));
    assert_eq!(
        app.registry.get(&denied.id).await.unwrap().status,
        TargetStatus::Failed
    );
    assert_eq!(
        app.registry.get(&down.id).await.unwrap().status,
        TargetStatus::Failed
    );

    assert_err!(app.test_server("srv-missing").await);
}
