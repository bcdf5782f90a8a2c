//! Finalizer handling for VCDCluster and VCDMachine
//!
//! The finalizer keeps the Kubernetes object around until every platform
//! object it owns has been torn down. It is added before the first
//! external call and removed only after teardown reports success.

use kube::{
    api::{Api, Patch, PatchParams},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::info;

use super::FIELD_MANAGER;
use crate::error::Result;

/// Add `finalizer` to the object if not present
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if has_finalizer(obj, finalizer) {
        return Ok(());
    }

    let mut finalizers: Vec<String> = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    info!("Added finalizer to {}", obj.name_any());
    Ok(())
}

/// Remove `finalizer` after cleanup is complete
///
/// Once no finalizers remain, Kubernetes completes the deletion.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Removed finalizer from {}", obj.name_any());
    Ok(())
}

/// A deletion timestamp means deletion was requested and finalizers are holding it
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}
