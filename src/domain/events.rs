//! Change Events
//!
//! Immutable snapshots of claim and volume changes delivered by the watch
//! layer and consumed exactly once by the reconciler.

use super::annotations::AnnotationSet;
use super::quantity;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Change Type / Phases
// =============================================================================

/// Kind of change reported by a watch stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Added => write!(f, "ADDED"),
            ChangeType::Modified => write!(f, "MODIFIED"),
            ChangeType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Claim lifecycle phase
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
    Unknown(String),
}

impl From<&str> for ClaimPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => ClaimPhase::Pending,
            "Bound" => ClaimPhase::Bound,
            "Lost" => ClaimPhase::Lost,
            other => ClaimPhase::Unknown(other.to_string()),
        }
    }
}

/// Volume lifecycle phase
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumePhase {
    Pending,
    Available,
    Bound,
    Released,
    Failed,
    Unknown(String),
}

impl From<&str> for VolumePhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => VolumePhase::Pending,
            "Available" => VolumePhase::Available,
            "Bound" => VolumePhase::Bound,
            "Released" => VolumePhase::Released,
            "Failed" => VolumePhase::Failed,
            other => VolumePhase::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Pending => write!(f, "Pending"),
            VolumePhase::Available => write!(f, "Available"),
            VolumePhase::Bound => write!(f, "Bound"),
            VolumePhase::Released => write!(f, "Released"),
            VolumePhase::Failed => write!(f, "Failed"),
            VolumePhase::Unknown(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// Claim Event
// =============================================================================

/// A change to a persistent volume claim
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimEvent {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// Requested storage exactly as the claim stated it
    pub requested_storage: Quantity,
    /// Requested storage in whole bytes
    pub requested_bytes: u64,
    pub access_modes: Vec<String>,
    pub phase: ClaimPhase,
    pub change: ChangeType,
    pub annotations: AnnotationSet,
    pub labels: BTreeMap<String, String>,
    /// `spec.storageClassName`, if set
    pub storage_class_name: Option<String>,
    /// `spec.volumeMode`, if set
    pub volume_mode: Option<String>,
}

impl ClaimEvent {
    /// Translate a watched claim into an event
    pub fn from_claim(change: ChangeType, claim: &PersistentVolumeClaim) -> Result<Self> {
        let meta = &claim.metadata;
        let name = meta.name.clone().ok_or_else(|| Error::Internal("claim without a name".into()))?;
        let namespace = meta.namespace.clone().unwrap_or_default();
        let spec = claim.spec.as_ref();

        let requested_storage = spec
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned()
            .unwrap_or_else(|| Quantity("0".to_string()));
        let requested_bytes = quantity::parse_bytes(&requested_storage.0)?;

        let phase = claim
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(ClaimPhase::from)
            .unwrap_or(ClaimPhase::Pending);

        Ok(Self {
            namespace,
            name,
            uid: meta.uid.clone().unwrap_or_default(),
            requested_storage,
            requested_bytes,
            access_modes: spec.and_then(|s| s.access_modes.clone()).unwrap_or_default(),
            phase,
            change,
            annotations: meta.annotations.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            storage_class_name: spec.and_then(|s| s.storage_class_name.clone()),
            volume_mode: spec.and_then(|s| s.volume_mode.clone()),
        })
    }
}

// =============================================================================
// Volume Event
// =============================================================================

/// A change to a persistent volume
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeEvent {
    pub name: String,
    pub kind: String,
    pub change: ChangeType,
    pub phase: VolumePhase,
    pub phase_message: Option<String>,
    pub phase_reason: Option<String>,
    pub access_modes: Vec<String>,
    pub annotations: AnnotationSet,
    pub labels: BTreeMap<String, String>,
    pub spec: Option<PersistentVolumeSpec>,
    pub reclaim_policy: Option<String>,
}

impl VolumeEvent {
    /// Translate a watched volume into an event
    pub fn from_volume(change: ChangeType, volume: &PersistentVolume) -> Result<Self> {
        let meta = &volume.metadata;
        let name = meta.name.clone().ok_or_else(|| Error::Internal("volume without a name".into()))?;
        let status = volume.status.as_ref();

        Ok(Self {
            name,
            kind: "PersistentVolume".to_string(),
            change,
            phase: status
                .and_then(|s| s.phase.as_deref())
                .map(VolumePhase::from)
                .unwrap_or(VolumePhase::Pending),
            phase_message: status.and_then(|s| s.message.clone()),
            phase_reason: status.and_then(|s| s.reason.clone()),
            access_modes: volume
                .spec
                .as_ref()
                .and_then(|s| s.access_modes.clone())
                .unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            reclaim_policy: volume
                .spec
                .as_ref()
                .and_then(|s| s.persistent_volume_reclaim_policy.clone()),
            spec: volume.spec.clone(),
        })
    }

    /// Whether this volume carries the given `managed-by` identity
    pub fn is_managed_by(&self, identity: &str) -> bool {
        self.annotations
            .get(super::annotations::MANAGED_BY)
            .is_some_and(|v| v == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::annotations::{DEFAULT_PROVISIONER_NAME, MANAGED_BY};
    use serde_json::json;

    fn claim() -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {
                "name": "data",
                "namespace": "demo",
                "uid": "c0ffee",
                "annotations": {"volume.beta.kubernetes.io/storage-class": "zfs-basic"}
            },
            "spec": {
                "accessModes": ["ReadWriteMany"],
                "resources": {"requests": {"storage": "10Gi"}},
                "storageClassName": "zfs-basic",
                "volumeMode": "Filesystem"
            },
            "status": {"phase": "Pending"}
        }))
        .unwrap()
    }

    #[test]
    fn test_claim_event_from_claim() {
        let event = ClaimEvent::from_claim(ChangeType::Added, &claim()).unwrap();
        assert_eq!(event.namespace, "demo");
        assert_eq!(event.name, "data");
        assert_eq!(event.uid, "c0ffee");
        assert_eq!(event.requested_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(event.requested_storage, Quantity("10Gi".into()));
        assert_eq!(event.access_modes, vec!["ReadWriteMany".to_string()]);
        assert_eq!(event.phase, ClaimPhase::Pending);
        assert_eq!(event.storage_class_name.as_deref(), Some("zfs-basic"));
        assert_eq!(event.volume_mode.as_deref(), Some("Filesystem"));
    }

    #[test]
    fn test_claim_event_rejects_bad_quantity() {
        let mut c = claim();
        c.spec
            .as_mut()
            .unwrap()
            .resources
            .as_mut()
            .unwrap()
            .requests
            .as_mut()
            .unwrap()
            .insert("storage".into(), Quantity("lots".into()));
        assert!(ClaimEvent::from_claim(ChangeType::Added, &c).is_err());
    }

    #[test]
    fn test_volume_event_from_volume() {
        let pv: PersistentVolume = serde_json::from_value(json!({
            "metadata": {
                "name": "zfs-basic-demo-data-abcdef01",
                "annotations": {MANAGED_BY: DEFAULT_PROVISIONER_NAME}
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "persistentVolumeReclaimPolicy": "Retain",
                "nfs": {"server": "nas01", "path": "/mnt/tank/pv/x"}
            },
            "status": {"phase": "Released", "message": "claim deleted"}
        }))
        .unwrap();

        let event = VolumeEvent::from_volume(ChangeType::Modified, &pv).unwrap();
        assert_eq!(event.phase, VolumePhase::Released);
        assert_eq!(event.phase_message.as_deref(), Some("claim deleted"));
        assert_eq!(event.reclaim_policy.as_deref(), Some("Retain"));
        assert!(event.is_managed_by(DEFAULT_PROVISIONER_NAME));
        assert!(!event.is_managed_by("someone-else"));
    }

    #[test]
    fn test_phase_parsing() {
        assert_eq!(ClaimPhase::from("Lost"), ClaimPhase::Lost);
        assert_eq!(VolumePhase::from("Failed"), VolumePhase::Failed);
        assert_eq!(
            VolumePhase::from("Weird"),
            VolumePhase::Unknown("Weird".into())
        );
    }
}
