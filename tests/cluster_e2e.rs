//! End-to-end checks against a live cluster running capvcd-manager
//!
//! Needs a kubeconfig pointing at a cluster with both CRDs installed and
//! the manager deployed. Run with: cargo test --test cluster_e2e -- --ignored

use std::time::Duration;

use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;

use capvcd::crd::{
    ClusterNetwork, ClusterPhase, LoadBalancerSpec, VCDCluster, VCDClusterSpec, CLUSTER_FINALIZER,
};

const NAMESPACE: &str = "capvcd-e2e";

fn invalid_cluster(name: &str) -> VCDCluster {
    VCDCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: VCDClusterSpec {
            org: "e2e".to_string(),
            ovdc: "e2e-vdc".to_string(),
            edge_gateway: "e2e-edge".to_string(),
            network: ClusterNetwork {
                cidr: "not-a-cidr".to_string(),
                dns_servers: vec![],
            },
            control_plane_endpoint: None,
            load_balancer: LoadBalancerSpec::default(),
        },
        status: None,
    }
}

async fn wait_for<F>(api: &Api<VCDCluster>, name: &str, mut done: F) -> Option<VCDCluster>
where
    F: FnMut(&VCDCluster) -> bool,
{
    for _ in 0..60 {
        if let Ok(Some(cluster)) = api.get_opt(name).await {
            if done(&cluster) {
                return Some(cluster);
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    None
}

#[tokio::test]
#[ignore]
async fn invalid_cluster_spec_fails_and_deletes_cleanly() {
    let client = Client::try_default().await.expect("kubeconfig required");
    let api: Api<VCDCluster> = Api::namespaced(client, NAMESPACE);
    let name = "e2e-invalid-cidr";

    let _ = api.delete(name, &DeleteParams::default()).await;
    api.create(&PostParams::default(), &invalid_cluster(name))
        .await
        .expect("create VCDCluster");

    let failed = wait_for(&api, name, |c| {
        c.status.as_ref().map(|s| s.phase) == Some(ClusterPhase::Failed)
    })
    .await
    .expect("cluster never reached Failed");
    let status = failed.status.unwrap();
    assert_eq!(status.failure_reason.as_deref(), Some("InvalidSpec"));
    assert!(failed
        .metadata
        .finalizers
        .unwrap_or_default()
        .contains(&CLUSTER_FINALIZER.to_string()));

    api.delete(name, &DeleteParams::default())
        .await
        .expect("delete VCDCluster");
    let mut gone = false;
    for _ in 0..60 {
        if api.get_opt(name).await.expect("get VCDCluster").is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    assert!(gone, "finalizer was never released");
}
