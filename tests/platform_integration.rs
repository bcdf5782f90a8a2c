//! Integration tests against a mocked Cloud Director endpoint
//!
//! These go through the real HTTP client, so request shapes, task
//! following and owner checks are exercised end to end.

use std::sync::Arc;

use chrono::Utc;
use kube::api::ObjectMeta;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use capvcd::config::{PlatformConfig, ReconcileConfig, TaskPollConfig};
use capvcd::controller::{reconcile_cluster, ClusterContext, Next};
use capvcd::crd::{
    ClusterNetwork, ClusterPhase, LoadBalancerSpec, VCDCluster, VCDClusterSpec, CLUSTER_FINALIZER,
};
use capvcd::vcd::types::{NetworkRequest, ResourceSpec};
use capvcd::vcd::{InfraAdapter, Progress, ResourceKind, ResourceRequest, VcdClient};

const OWNER: &str = "tenant-a/c1";

fn adapter_for(server: &MockServer) -> InfraAdapter {
    let client = VcdClient::new(&PlatformConfig {
        endpoint: server.uri(),
        api_token: Some("integration-token".to_string()),
        ..Default::default()
    })
    .unwrap();
    InfraAdapter::new(
        Arc::new(client),
        &TaskPollConfig {
            poll_min_interval_ms: 10,
            poll_max_interval_ms: 20,
            call_deadline_secs: 5,
        },
    )
}

fn page(objects: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "values": objects }))
}

async fn mount_lookup(server: &MockServer, collection: &str, name: &str, object: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/cloudapi/1.0.0/{collection}")))
        .and(query_param("filter", format!("name=={name}")))
        .respond_with(page(json!([object])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn network_create_follows_task_to_completion() {
    let server = MockServer::start().await;
    let collection = "/cloudapi/1.0.0/orgVdcNetworks";

    Mock::given(method("GET"))
        .and(path(collection))
        .respond_with(page(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(collection))
        .and(body_partial_json(json!({
            "name": "tenant-a-c1-net",
            "metadata": { "capvcd.io/owner": OWNER }
        })))
        .respond_with(
            ResponseTemplate::new(202).insert_header("location", "/api/task/7"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/task/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "running" })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/task/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(collection))
        .respond_with(page(json!([{
            "id": "urn:vcloud:network:1",
            "name": "tenant-a-c1-net",
            "state": "ready",
            "metadata": { "capvcd.io/owner": OWNER }
        }])))
        .mount(&server)
        .await;

    let request = ResourceRequest {
        owner: OWNER.to_string(),
        spec: ResourceSpec::Network(NetworkRequest {
            name: "tenant-a-c1-net".to_string(),
            vdc: "acme-vdc".to_string(),
            gateway_id: "urn:vcloud:gateway:1".to_string(),
            gateway_address: "10.10.0.1".to_string(),
            prefix_length: 24,
            dns_servers: vec![],
        }),
    };

    let progress = adapter_for(&server).ensure_created(&request).await.unwrap();
    match progress {
        Progress::Ready(network) => assert_eq!(network.id, "urn:vcloud:network:1"),
        other => panic!("expected the network to be ready, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_leaves_foreign_objects_alone() {
    let server = MockServer::start().await;
    mount_lookup(
        &server,
        "vms",
        "tenant-a-m1",
        json!({
            "id": "urn:vcloud:vm:1",
            "name": "tenant-a-m1",
            "metadata": { "capvcd.io/owner": "someone-else/m1" }
        }),
    )
    .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let progress = adapter_for(&server)
        .ensure_deleted(ResourceKind::Vm, "tenant-a-m1", "tenant-a/m1")
        .await
        .unwrap();
    assert_eq!(progress, Progress::Ready(()));
}

#[tokio::test]
async fn existing_cluster_infrastructure_is_adopted_without_mutations() {
    let server = MockServer::start().await;
    let owned = json!({ "capvcd.io/owner": OWNER });

    mount_lookup(
        &server,
        "edgeGateways",
        "edge-01",
        json!({ "id": "urn:vcloud:gateway:1", "name": "edge-01" }),
    )
    .await;
    mount_lookup(
        &server,
        "orgVdcNetworks",
        "tenant-a-c1-net",
        json!({ "id": "urn:vcloud:network:1", "name": "tenant-a-c1-net", "metadata": owned }),
    )
    .await;
    mount_lookup(
        &server,
        "vApps",
        "tenant-a-c1",
        json!({ "id": "urn:vcloud:vapp:1", "name": "tenant-a-c1", "metadata": owned }),
    )
    .await;
    mount_lookup(
        &server,
        "loadBalancer/virtualServices",
        "tenant-a-c1-api-lb",
        json!({
            "id": "urn:vcloud:lb:1",
            "name": "tenant-a-c1-api-lb",
            "metadata": owned,
            "virtualIp": "203.0.113.10"
        }),
    )
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let cluster = VCDCluster {
        metadata: ObjectMeta {
            name: Some("c1".to_string()),
            namespace: Some("tenant-a".to_string()),
            generation: Some(1),
            finalizers: Some(vec![CLUSTER_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: VCDClusterSpec {
            org: "acme".to_string(),
            ovdc: "acme-vdc".to_string(),
            edge_gateway: "edge-01".to_string(),
            network: ClusterNetwork {
                cidr: "10.10.0.0/24".to_string(),
                dns_servers: vec![],
            },
            control_plane_endpoint: None,
            load_balancer: LoadBalancerSpec::default(),
        },
        status: None,
    };

    let adapter = adapter_for(&server);
    let config = ReconcileConfig::default();
    let outcome = reconcile_cluster(
        &cluster,
        ClusterContext {
            adapter: &adapter,
            config: &config,
            now: Utc::now(),
            machines: 0,
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.next, Next::Resync);
    assert_eq!(outcome.status.phase, ClusterPhase::Provisioned);
    assert_eq!(outcome.status.network_id.as_deref(), Some("urn:vcloud:network:1"));
    let endpoint = outcome.status.control_plane_endpoint.unwrap();
    assert_eq!(endpoint.host, "203.0.113.10");
    assert_eq!(endpoint.port, 6443);
}
