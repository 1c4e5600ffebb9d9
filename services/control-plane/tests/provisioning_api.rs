//! Workload provisioning integration tests.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use support::{DaemonCall, TestHarness};

#[tokio::test]
async fn test_provision_claims_allocation_and_calls_daemon() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n1").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.0.5", "25565")
        .await;

    let workload = harness
        .create_workload("wl-happy", &node.node_id, &ids[0])
        .await;

    assert_eq!(workload["status"], "installing");
    assert_eq!(workload["node_id"], node.node_id.as_str());
    assert_eq!(workload["primary_allocation_id"], ids[0].as_str());

    let uuid: uuid::Uuid = workload["uuid"].as_str().unwrap().parse().unwrap();
    let calls = harness.daemon.calls();
    assert!(calls.iter().any(|c| matches!(
        c,
        DaemonCall::CreateAndInstall { node_id, uuid: u } if node_id == &node.node_id && u == &uuid
    )));

    let listed = harness.list_allocations(&node.node_id).await;
    let allocation = &listed.as_array().unwrap()[0];
    assert_eq!(allocation["is_primary"], true);
    assert_eq!(
        allocation["workload_id"],
        workload["id"].as_str().unwrap()
    );
}

#[tokio::test]
async fn test_daemon_refusal_marks_install_failed_and_keeps_allocation() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n2").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.1.5", "25565")
        .await;

    harness.daemon.fail_create.store(true, Ordering::SeqCst);
    let workload = harness
        .create_workload("wl-failed", &node.node_id, &ids[0])
        .await;

    // Background install must observe the failure.
    let workload_id = workload["id"].as_str().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = harness.get_workload(workload_id).await;
        if current["status"] == "install_failed" {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "workload never reached install_failed: {current}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The claim is retained for a retry, and listings say why it is held.
    let listed = harness.list_allocations(&node.node_id).await;
    let allocation = &listed.as_array().unwrap()[0];
    assert_eq!(allocation["workload_id"], workload_id);
    assert_eq!(allocation["held_by_failed_install"], true);
}

#[tokio::test]
async fn test_claimed_allocation_cannot_be_claimed_again() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n3").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.2.5", "25565")
        .await;
    harness
        .create_workload("wl-first", &node.node_id, &ids[0])
        .await;

    let resp = harness
        .client
        .post(format!("{}/admin/workloads", harness.base_url))
        .json(&serde_json::json!({
            "name": "wl-second",
            "node_id": node.node_id,
            "allocation_id": ids[0],
            "owner_id": "usr_test",
            "image_ref": "ghcr.io/gantry/minecraft:latest",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "allocation_in_use");

    // The rejected claim rolls the whole provision back; only the first
    // workload record survives.
    let resp = harness
        .client
        .get(format!("{}/admin/workloads", harness.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let listed = body.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], "wl-first");
}

#[tokio::test]
async fn test_allocation_on_wrong_node_is_refused() {
    let harness = TestHarness::new().await;
    let node_a = harness.create_node("prov-n4a").await;
    let node_b = harness.create_node("prov-n4b").await;
    let ids = harness
        .create_allocations(&node_b.node_id, "10.1.3.5", "25565")
        .await;

    let resp = harness
        .client
        .post(format!("{}/admin/workloads", harness.base_url))
        .json(&serde_json::json!({
            "name": "wl-wrong-node",
            "node_id": node_a.node_id,
            "allocation_id": ids[0],
            "owner_id": "usr_test",
            "image_ref": "ghcr.io/gantry/minecraft:latest",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // The aborted provision must not leave a workload record behind.
    let resp = harness
        .client
        .get(format!("{}/admin/workloads", harness.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_workload_frees_allocations_and_notifies_daemon() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n5").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.4.5", "25565")
        .await;
    let workload = harness
        .create_workload("wl-doomed", &node.node_id, &ids[0])
        .await;
    let workload_id = workload["id"].as_str().unwrap();

    let resp = harness
        .client
        .delete(format!("{}/admin/workloads/{workload_id}", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let uuid: uuid::Uuid = workload["uuid"].as_str().unwrap().parse().unwrap();
    assert!(harness.daemon.calls().iter().any(|c| matches!(
        c,
        DaemonCall::DeleteWorkload { uuid: u, .. } if u == &uuid
    )));

    let listed = harness.list_allocations(&node.node_id).await;
    let allocation = &listed.as_array().unwrap()[0];
    assert!(allocation["workload_id"].is_null());
    assert_eq!(allocation["is_primary"], false);

    let resp = harness
        .client
        .get(format!("{}/admin/workloads/{workload_id}", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_delete_succeeds_when_daemon_is_down() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n6").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.5.5", "25565")
        .await;
    let workload = harness
        .create_workload("wl-orphan", &node.node_id, &ids[0])
        .await;
    let workload_id = workload["id"].as_str().unwrap();

    harness.daemon.fail_delete.store(true, Ordering::SeqCst);

    let resp = harness
        .client
        .delete(format!("{}/admin/workloads/{workload_id}", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let listed = harness.list_allocations(&node.node_id).await;
    assert!(listed.as_array().unwrap()[0]["workload_id"].is_null());
}

#[tokio::test]
async fn test_reinstall_reuses_held_allocation() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n7").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.6.5", "25565")
        .await;

    harness.daemon.fail_create.store(true, Ordering::SeqCst);
    let workload = harness
        .create_workload("wl-retry", &node.node_id, &ids[0])
        .await;
    let workload_id = workload["id"].as_str().unwrap();

    // Wait for install_failed, then retry with a healthy daemon.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while harness.get_workload(workload_id).await["status"] != "install_failed" {
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    harness.daemon.fail_create.store(false, Ordering::SeqCst);

    let resp = harness
        .client
        .post(format!(
            "{}/admin/workloads/{workload_id}/reinstall",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let current = harness.get_workload(workload_id).await;
    assert_eq!(current["status"], "installing");
    assert_eq!(current["primary_allocation_id"], ids[0].as_str());
}

#[tokio::test]
async fn test_resync_calls_daemon_without_state_change() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("prov-n8").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.1.7.5", "25565")
        .await;
    let workload = harness
        .create_workload("wl-sync", &node.node_id, &ids[0])
        .await;
    let workload_id = workload["id"].as_str().unwrap();

    let resp = harness
        .client
        .post(format!(
            "{}/admin/workloads/{workload_id}/resync",
            harness.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let uuid: uuid::Uuid = workload["uuid"].as_str().unwrap().parse().unwrap();
    assert!(harness.daemon.calls().iter().any(|c| matches!(
        c,
        DaemonCall::Resync { uuid: u, .. } if u == &uuid
    )));
}
