//! Annotation protocol
//!
//! Annotations are the only channel between claim authors, the reconciler and
//! the storage backends. This module owns the reserved keys, the translation
//! of claim annotations into the internal working set, and the scope guard
//! that keeps transient keys out of persisted volume metadata.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// Flat annotation map passed between pipeline stages
pub type AnnotationSet = BTreeMap<String, String>;

/// Identity written into `managed-by` when none is configured
pub const DEFAULT_PROVISIONER_NAME: &str = "zfs-pv-provisioner.io";

// =============================================================================
// Cluster Keys
// =============================================================================

pub const KUBE_BETA_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";
pub const KUBE_STORAGE_PROVISIONER: &str = "volume.kubernetes.io/storage-provisioner";
pub const KUBE_BETA_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

// =============================================================================
// Protocol Keys
// =============================================================================

/// Prefix for every protocol and tuning key
pub const ANNOTATION_BASE: &str = "zfs-pv-provisioner.io/";

pub const MANAGED_BY: &str = "managed-by";
pub const VOLUME_UUID: &str = "zfs-pv-provisioner.io/volume-uuid";
pub const PROVIDER_TYPE: &str = "zfs-pv-provisioner.io/managed-provider";
pub const STORAGE_PROVISIONER: &str = "zfs-pv-provisioner.io/storage-provisioner";
pub const STORAGE_CLASS: &str = "zfs-pv-provisioner.io/storage-class";
pub const PVC_NAMESPACE: &str = "zfs-pv-provisioner.io/pvc-namespace";
pub const PVC_NAME: &str = "zfs-pv-provisioner.io/pvc-name";
pub const PV_TAG: &str = "zfs-pv-provisioner.io/pv-tag";
pub const PV_REF: &str = "zfs-pv-provisioner.io/pv-ref";
pub const CLONE_FROM: &str = "zfs-pv-provisioner.io/clone-from";
pub const CLONE_REF: &str = "zfs-pv-provisioner.io/clone-ref";
pub const CLONE_SNAPSHOT: &str = "zfs-pv-provisioner.io/clone-snapshot";
pub const RECLAIM_POLICY: &str = "zfs-pv-provisioner.io/reclaim-policy";
pub const RELEASED_AT: &str = "zfs-pv-provisioner.io/released-at";
pub const VOLUME_MODE: &str = "zfs-pv-provisioner.io/volume-mode";
pub const MOUNT_PROTOCOL: &str = "zfs-pv-provisioner.io/mount-protocol";

// Written by backends
pub const VOLUME_HOST: &str = "zfs-pv-provisioner.io/nfs-host";
pub const VOLUME_PATH: &str = "zfs-pv-provisioner.io/nfs-path";
pub const VOLUME_EXPORT: &str = "zfs-pv-provisioner.io/nfs-export";

// =============================================================================
// Backend Tuning Keys
// =============================================================================

pub const BLOCKSIZE: &str = "zfs-pv-provisioner.io/blocksize";
pub const CHECKSUM: &str = "zfs-pv-provisioner.io/checksum";
pub const COMPRESSION: &str = "zfs-pv-provisioner.io/compression";
pub const ATIME: &str = "zfs-pv-provisioner.io/atime";
pub const EXEC: &str = "zfs-pv-provisioner.io/exec";
pub const SYNC: &str = "zfs-pv-provisioner.io/sync";
pub const SNAPDIR: &str = "zfs-pv-provisioner.io/snapdir";
pub const CASESENSITIVE: &str = "zfs-pv-provisioner.io/casesensitive";
pub const LOGBIAS: &str = "zfs-pv-provisioner.io/logbias";

/// Keys that may only be produced internally, never accepted from a claim
pub const INTERNAL_ONLY: &[&str] = &[CLONE_REF, CLONE_SNAPSHOT];

/// Keys that live only for the duration of one provisioning attempt
pub const TRANSIENT: &[&str] = &[PV_TAG, PV_REF, CLONE_REF];

/// Number of UUID characters used for the human readable tag
pub const PV_TAG_LEN: usize = 8;

/// Qualify a short key name (as used in configuration) with the annotation base
pub fn qualified(name: &str) -> String {
    if name.starts_with(ANNOTATION_BASE) {
        name.to_string()
    } else {
        format!("{}{}", ANNOTATION_BASE, name)
    }
}

/// Build the working annotation set for a claim.
///
/// Injects the claim coordinates, renames the cluster's provisioner and class
/// keys to their internal equivalents and copies everything else through.
pub fn from_claim(namespace: &str, name: &str, claim_annotations: &AnnotationSet) -> AnnotationSet {
    let mut annotations = AnnotationSet::new();
    annotations.insert(PVC_NAMESPACE.to_string(), namespace.to_string());
    annotations.insert(PVC_NAME.to_string(), name.to_string());

    for (key, value) in claim_annotations {
        let key = match key.as_str() {
            KUBE_BETA_STORAGE_PROVISIONER | KUBE_STORAGE_PROVISIONER => STORAGE_PROVISIONER,
            KUBE_BETA_STORAGE_CLASS => STORAGE_CLASS,
            other => other,
        };
        annotations.insert(key.to_string(), value.clone());
    }

    annotations
}

/// Provisioner named by the claim, if any
pub fn claim_provisioner(claim_annotations: &AnnotationSet) -> Option<&str> {
    claim_annotations
        .get(KUBE_STORAGE_PROVISIONER)
        .or_else(|| claim_annotations.get(KUBE_BETA_STORAGE_PROVISIONER))
        .map(String::as_str)
}

/// Remove keys that must never originate from claim input
pub fn strip_internal(annotations: &mut AnnotationSet) {
    for key in INTERNAL_ONLY {
        annotations.remove(*key);
    }
}

/// Remove every key in `blocked`, returning the keys that were present
pub fn strip_blocked<'a, I>(annotations: &mut AnnotationSet, blocked: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    blocked
        .into_iter()
        .filter(|key| annotations.remove(key.as_str()).is_some())
        .cloned()
        .collect()
}

// =============================================================================
// Transient Scope
// =============================================================================

/// Scoped view over a working annotation set.
///
/// Keys inserted through [`TransientScope::insert_transient`] are removed when
/// the scope is dropped, whichever way the enclosing code exits. Keys written
/// through `DerefMut` (for example by a backend) persist.
pub struct TransientScope<'a> {
    annotations: &'a mut AnnotationSet,
    transient: Vec<String>,
}

impl<'a> TransientScope<'a> {
    pub fn new(annotations: &'a mut AnnotationSet) -> Self {
        Self {
            annotations,
            transient: Vec::new(),
        }
    }

    /// Insert a key that must not survive this scope
    pub fn insert_transient(&mut self, key: &str, value: impl Into<String>) {
        self.annotations.insert(key.to_string(), value.into());
        if !self.transient.iter().any(|k| k == key) {
            self.transient.push(key.to_string());
        }
    }
}

impl Deref for TransientScope<'_> {
    type Target = AnnotationSet;

    fn deref(&self) -> &Self::Target {
        self.annotations
    }
}

impl DerefMut for TransientScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.annotations
    }
}

impl Drop for TransientScope<'_> {
    fn drop(&mut self) {
        for key in self.transient.drain(..) {
            self.annotations.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[(&str, &str)]) -> AnnotationSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_claim_renames_cluster_keys() {
        let claim = set(&[
            (KUBE_BETA_STORAGE_PROVISIONER, DEFAULT_PROVISIONER_NAME),
            (KUBE_BETA_STORAGE_CLASS, "zfs-basic"),
            ("team", "storage"),
        ]);

        let working = from_claim("demo", "data", &claim);

        assert_eq!(working.get(PVC_NAMESPACE).unwrap(), "demo");
        assert_eq!(working.get(PVC_NAME).unwrap(), "data");
        assert_eq!(working.get(STORAGE_PROVISIONER).unwrap(), DEFAULT_PROVISIONER_NAME);
        assert_eq!(working.get(STORAGE_CLASS).unwrap(), "zfs-basic");
        assert_eq!(working.get("team").unwrap(), "storage");
        assert!(!working.contains_key(KUBE_BETA_STORAGE_CLASS));
    }

    #[test]
    fn test_claim_provisioner_prefers_ga_key() {
        let claim = set(&[
            (KUBE_STORAGE_PROVISIONER, "ga"),
            (KUBE_BETA_STORAGE_PROVISIONER, "beta"),
        ]);
        assert_eq!(claim_provisioner(&claim), Some("ga"));
        assert_eq!(claim_provisioner(&AnnotationSet::new()), None);
    }

    #[test]
    fn test_strip_internal_and_blocked() {
        let mut working = set(&[
            (CLONE_REF, "nas:/tank/x"),
            (CLONE_SNAPSHOT, "tank/x@snap"),
            (COMPRESSION, "gzip-9"),
            (ATIME, "off"),
        ]);

        strip_internal(&mut working);
        assert!(!working.contains_key(CLONE_REF));
        assert!(!working.contains_key(CLONE_SNAPSHOT));

        let blocked = vec![COMPRESSION.to_string(), RECLAIM_POLICY.to_string()];
        let removed = strip_blocked(&mut working, &blocked);
        assert_eq!(removed, vec![COMPRESSION.to_string()]);
        assert_eq!(working.get(ATIME).unwrap(), "off");
    }

    #[test]
    fn test_transient_scope_removes_only_transient_keys() {
        let mut working = set(&[(VOLUME_UUID, "u")]);
        {
            let mut scope = TransientScope::new(&mut working);
            scope.insert_transient(PV_TAG, "abcdef01");
            scope.insert_transient(CLONE_REF, "nas:tank/pv/u");
            scope.insert(CLONE_SNAPSHOT.to_string(), "tank/pv/u@s".to_string());
            assert_eq!(scope.get(PV_TAG).unwrap(), "abcdef01");
        }
        assert!(!working.contains_key(PV_TAG));
        assert!(!working.contains_key(CLONE_REF));
        assert_eq!(working.get(CLONE_SNAPSHOT).unwrap(), "tank/pv/u@s");
        assert_eq!(working.get(VOLUME_UUID).unwrap(), "u");
    }

    #[test]
    fn test_transient_scope_cleans_up_on_early_return() {
        fn fails(scope: &mut TransientScope<'_>) -> Option<()> {
            scope.insert_transient(PV_REF, "pv-1");
            None
        }

        let mut working = AnnotationSet::new();
        {
            let mut scope = TransientScope::new(&mut working);
            assert!(fails(&mut scope).is_none());
        }
        assert!(working.is_empty());
    }

    #[test]
    fn test_qualified() {
        assert_eq!(qualified("compression"), COMPRESSION);
        assert_eq!(qualified(COMPRESSION), COMPRESSION);
    }
}
