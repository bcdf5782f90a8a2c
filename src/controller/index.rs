use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::crd::VCDMachine;

/// Answers "which machines still reference this cluster"
///
/// Cluster deletion is gated on this, so it must count machines that
/// are themselves being deleted.
pub trait MachineIndex: Send + Sync {
    fn machines_for(&self, namespace: &str, cluster: &str) -> Vec<ObjectRef<VCDMachine>>;

    fn count_for(&self, namespace: &str, cluster: &str) -> usize {
        self.machines_for(namespace, cluster).len()
    }
}

/// Index backed by the reflector cache of VCDMachines
impl MachineIndex for Store<VCDMachine> {
    fn machines_for(&self, namespace: &str, cluster: &str) -> Vec<ObjectRef<VCDMachine>> {
        self.state()
            .iter()
            .filter(|m| m.namespace().as_deref() == Some(namespace) && m.spec.cluster_name == cluster)
            .map(|m| ObjectRef::from_obj(m.as_ref()))
            .collect()
    }
}

/// Fixed index for tests
#[cfg(test)]
#[derive(Default)]
pub struct StaticIndex {
    pub machines: Vec<VCDMachine>,
}

#[cfg(test)]
impl MachineIndex for StaticIndex {
    fn machines_for(&self, namespace: &str, cluster: &str) -> Vec<ObjectRef<VCDMachine>> {
        self.machines
            .iter()
            .filter(|m| m.namespace().as_deref() == Some(namespace) && m.spec.cluster_name == cluster)
            .map(ObjectRef::from_obj)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn machine(namespace: &str, name: &str, cluster: &str) -> VCDMachine {
        let mut machine = VCDMachine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        machine.spec.cluster_name = cluster.to_string();
        machine
    }

    #[test]
    fn test_counts_only_matching_namespace_and_cluster() {
        let index = StaticIndex {
            machines: vec![
                machine("tenant-a", "m1", "c1"),
                machine("tenant-a", "m2", "c1"),
                machine("tenant-a", "m3", "c2"),
                machine("tenant-b", "m1", "c1"),
            ],
        };
        assert_eq!(index.count_for("tenant-a", "c1"), 2);
        assert_eq!(index.count_for("tenant-b", "c1"), 1);
        assert_eq!(index.count_for("tenant-b", "c2"), 0);
    }
}
