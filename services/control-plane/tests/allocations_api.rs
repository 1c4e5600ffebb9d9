//! Allocation pool API integration tests.

mod support;

use support::TestHarness;

#[tokio::test]
async fn test_bulk_create_expands_cidr_and_ports() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n1").await;

    // /30 yields 2 usable hosts, the port spec 3 ports -> 6 allocations.
    let resp = harness
        .client
        .post(format!(
            "{}/admin/nodes/{}/allocations",
            harness.base_url, node.node_id
        ))
        .json(&serde_json::json!({
            "ip": "10.0.0.0/30",
            "ports": "25565,25570-25571",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["success"], true);
    assert_eq!(body["data"]["created"], 6);
    assert_eq!(body["data"]["allocations"].as_array().unwrap().len(), 6);

    let listed = harness.list_allocations(&node.node_id).await;
    assert_eq!(listed.as_array().unwrap().len(), 6);
    for allocation in listed.as_array().unwrap() {
        assert_eq!(allocation["is_primary"], false);
        assert!(allocation["workload_id"].is_null());
    }
}

#[tokio::test]
async fn test_bulk_create_skips_existing_pairs() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n2").await;

    harness
        .create_allocations(&node.node_id, "10.0.1.5", "25565-25567")
        .await;

    // Overlapping spec: one new port, three existing.
    let resp = harness
        .client
        .post(format!(
            "{}/admin/nodes/{}/allocations",
            harness.base_url, node.node_id
        ))
        .json(&serde_json::json!({ "ip": "10.0.1.5", "ports": "25565-25568" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["created"], 1);
    assert_eq!(body["data"]["allocations"][0]["port"], 25568);
}

#[tokio::test]
async fn test_bulk_create_all_conflicts_is_409() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n3").await;

    harness
        .create_allocations(&node.node_id, "10.0.2.5", "25565")
        .await;

    let resp = harness
        .client
        .post(format!(
            "{}/admin/nodes/{}/allocations",
            harness.base_url, node.node_id
        ))
        .json(&serde_json::json!({ "ip": "10.0.2.5", "ports": "25565" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "allocations_exist");
}

#[tokio::test]
async fn test_invalid_specs_are_400_problem_json() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n4").await;

    for (ip, ports, code) in [
        ("not-an-ip", "25565", "invalid_address_spec"),
        ("10.0.0.0/8", "25565", "invalid_address_spec"), // over the expansion cap
        ("10.0.3.5", "0", "invalid_port_spec"),
        ("10.0.3.5", "25570-25565", "invalid_port_spec"),
        ("10.0.3.5", "26,notaport", "invalid_port_spec"),
    ] {
        let resp = harness
            .client
            .post(format!(
                "{}/admin/nodes/{}/allocations",
                harness.base_url, node.node_id
            ))
            .json(&serde_json::json!({ "ip": ip, "ports": ports }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "spec ip={ip} ports={ports}");
        assert_eq!(
            resp.headers()["content-type"],
            "application/problem+json"
        );

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], code, "spec ip={ip} ports={ports}");
    }
}

#[tokio::test]
async fn test_pair_count_over_cap_is_400() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n4b").await;

    // Each spec stays under the expansion cap, but 16 addresses x 2000
    // ports would insert far more rows than the cap allows.
    let resp = harness
        .client
        .post(format!(
            "{}/admin/nodes/{}/allocations",
            harness.base_url, node.node_id
        ))
        .json(&serde_json::json!({ "ip": "10.0.9.0/28", "ports": "20000-21999" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "allocation_limit_exceeded");

    // Nothing was inserted.
    let resp = harness
        .client
        .get(format!(
            "{}/admin/nodes/{}/allocations",
            harness.base_url, node.node_id
        ))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_free_allocation() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n5").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.0.4.5", "25565")
        .await;

    let resp = harness
        .client
        .delete(format!(
            "{}/admin/nodes/{}/allocations/{}",
            harness.base_url, node.node_id, ids[0]
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let listed = harness.list_allocations(&node.node_id).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_owned_allocation_is_409() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n6").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.0.5.5", "25565")
        .await;
    harness
        .create_workload("wl-owned", &node.node_id, &ids[0])
        .await;

    let resp = harness
        .client
        .delete(format!(
            "{}/admin/nodes/{}/allocations/{}",
            harness.base_url, node.node_id, ids[0]
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn test_release_primary_is_409() {
    let harness = TestHarness::new().await;
    let node = harness.create_node("alloc-n7").await;
    let ids = harness
        .create_allocations(&node.node_id, "10.0.6.5", "25565")
        .await;
    harness
        .create_workload("wl-primary", &node.node_id, &ids[0])
        .await;

    let resp = harness
        .client
        .post(format!(
            "{}/admin/nodes/{}/allocations/{}/release",
            harness.base_url, node.node_id, ids[0]
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "allocation_primary_protected");
}

#[tokio::test]
async fn test_allocation_on_other_node_is_404() {
    let harness = TestHarness::new().await;
    let node_a = harness.create_node("alloc-n8a").await;
    let node_b = harness.create_node("alloc-n8b").await;
    let ids = harness
        .create_allocations(&node_a.node_id, "10.0.7.5", "25565")
        .await;

    let resp = harness
        .client
        .delete(format!(
            "{}/admin/nodes/{}/allocations/{}",
            harness.base_url, node_b.node_id, ids[0]
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
