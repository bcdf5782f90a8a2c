//! Deterministic names for external objects
//!
//! Names are derived from the owning object's namespace and name so the
//! adapter can find what an earlier reconcile created without persisting
//! any platform identifiers first.

use sha2::{Digest, Sha256};

/// Longest name handed to the platform; also a valid DNS label
pub const MAX_NAME_LEN: usize = 63;

const HASH_LEN: usize = 8;

/// `<namespace>-<name>[-<suffix>]`, shortened with a stable hash when too long
pub fn external_name(namespace: &str, name: &str, suffix: Option<&str>) -> String {
    let mut full = format!("{namespace}-{name}");
    if let Some(suffix) = suffix {
        full.push('-');
        full.push_str(suffix);
    }
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let digest = Sha256::digest(full.as_bytes());
    let hash: String = digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    let keep = MAX_NAME_LEN - HASH_LEN - 1;
    let prefix: String = full.chars().take(keep).collect();
    format!("{}-{hash}", prefix.trim_end_matches('-'))
}

/// Guest host name for a machine: the Kubernetes name, cut to a DNS label
pub fn computer_name(machine: &str) -> String {
    machine
        .chars()
        .take(MAX_NAME_LEN)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Owner metadata value written on every external object
pub fn owner_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_are_readable() {
        assert_eq!(external_name("tenant-a", "c1", Some("net")), "tenant-a-c1-net");
        assert_eq!(external_name("tenant-a", "m1", None), "tenant-a-m1");
    }

    #[test]
    fn test_long_names_are_shortened_stably() {
        let name = "a".repeat(80);
        let first = external_name("tenant-a", &name, Some("lb"));
        let second = external_name("tenant-a", &name, Some("lb"));
        assert_eq!(first, second);
        assert!(first.len() <= MAX_NAME_LEN);
        assert_ne!(first, external_name("tenant-a", &name, Some("net")));
    }

    #[test]
    fn test_owner_key() {
        assert_eq!(owner_key("tenant-a", "c1"), "tenant-a/c1");
    }
}
