//! Dataset and export layout
//!
//! Both backends place every volume at `{root}/{uuid}` and export it at
//! `{exportRoot}/{uuid}`. This module owns that naming, the ownership checks
//! used for cloning and cleanup, and the annotations a backend writes back.

use crate::domain::annotations::{
    AnnotationSet, MOUNT_PROTOCOL, PROVIDER_TYPE, VOLUME_EXPORT, VOLUME_HOST, VOLUME_MODE,
    VOLUME_PATH, VOLUME_UUID,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Value written into the provider-type annotation
pub const PROVIDER_TYPE_NFS: &str = "nfs";

const SNAPSHOT_PREFIX: &str = "zfspv";

/// Where one backend instance puts datasets and exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLayout {
    pub nfs_host: String,
    pub export_root: String,
    pub dataset_root: String,
}

impl ExportLayout {
    pub fn new(nfs_host: &str, export_root: &str, dataset_root: &str) -> Self {
        Self {
            nfs_host: nfs_host.trim().to_string(),
            export_root: trim_path(export_root),
            dataset_root: trim_path(dataset_root),
        }
    }

    pub fn dataset_path(&self, uuid: &Uuid) -> String {
        format!("{}/{}", self.dataset_root, uuid)
    }

    pub fn export_path(&self, uuid: &Uuid) -> String {
        format!("{}/{}", self.export_root, uuid)
    }

    /// Whether `dataset_path` on `host` is a volume dataset of this layout
    pub fn owns_dataset(&self, host: &str, dataset_path: &str) -> bool {
        if host != self.nfs_host {
            return false;
        }
        dataset_path
            .strip_prefix(self.dataset_root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|leaf| Uuid::parse_str(leaf).is_ok())
    }

    /// Parse a `host:dataset` clone reference, returning the source dataset
    pub fn parse_clone_ref(&self, clone_ref: &str) -> Result<String> {
        let parts: Vec<&str> = clone_ref.split(':').collect();
        if parts.len() != 2 {
            return Err(Error::InvalidAnnotation {
                key: "clone-ref".into(),
                value: format!("expected 2 parts, got {}: {}", parts.len(), clone_ref),
            });
        }
        let (host, dataset) = (parts[0], parts[1]);
        if host != self.nfs_host {
            return Err(Error::InvalidAnnotation {
                key: "clone-ref".into(),
                value: format!("host {} is not {}", host, self.nfs_host),
            });
        }
        if !self.owns_dataset(host, dataset) {
            return Err(Error::InvalidAnnotation {
                key: "clone-ref".into(),
                value: format!("{} is not under {}", dataset, self.dataset_root),
            });
        }
        Ok(dataset.to_string())
    }

    /// Accept a recorded clone snapshot only if it lies under this root
    pub fn validate_snapshot<'a>(&self, snapshot: &'a str) -> Option<&'a str> {
        let (dataset, name) = snapshot.split_once('@')?;
        let under_root = dataset
            .strip_prefix(self.dataset_root.as_str())
            .is_some_and(|rest| rest.starts_with('/') && rest.len() > 1);
        (under_root && !name.is_empty()).then_some(snapshot)
    }

    /// Record the placement of volume `uuid` in `annotations`
    pub fn write_annotations(&self, annotations: &mut AnnotationSet, uuid: &Uuid) {
        annotations.insert(VOLUME_HOST.to_string(), self.nfs_host.clone());
        annotations.insert(VOLUME_PATH.to_string(), self.dataset_path(uuid));
        annotations.insert(VOLUME_EXPORT.to_string(), self.export_path(uuid));
        annotations.insert(PROVIDER_TYPE.to_string(), PROVIDER_TYPE_NFS.to_string());
    }
}

/// Read and parse the volume UUID annotation
pub fn volume_uuid(annotations: &AnnotationSet) -> Result<Uuid> {
    let raw = annotations.get(VOLUME_UUID).ok_or_else(|| Error::MissingAnnotation {
        key: VOLUME_UUID.to_string(),
    })?;
    Uuid::parse_str(raw).map_err(|_| Error::InvalidAnnotation {
        key: VOLUME_UUID.to_string(),
        value: raw.clone(),
    })
}

/// Decline block volumes and non-NFS mounts; default the mount protocol
pub fn check_volume_request(annotations: &mut AnnotationSet) -> Result<()> {
    if let Some(mode) = annotations.get(VOLUME_MODE) {
        if mode.eq_ignore_ascii_case("block") {
            return Err(Error::InvalidAnnotation {
                key: VOLUME_MODE.to_string(),
                value: mode.clone(),
            });
        }
    }
    match annotations.get(MOUNT_PROTOCOL) {
        Some(protocol) if !protocol.eq_ignore_ascii_case(PROVIDER_TYPE_NFS) => {
            Err(Error::InvalidAnnotation {
                key: MOUNT_PROTOCOL.to_string(),
                value: protocol.clone(),
            })
        }
        Some(_) => Ok(()),
        None => {
            annotations.insert(MOUNT_PROTOCOL.to_string(), PROVIDER_TYPE_NFS.to_string());
            Ok(())
        }
    }
}

/// Snapshot name (the part after `@`) for a clone made for `assigned_name`
pub fn snapshot_name(assigned_name: &str, at: DateTime<Utc>) -> String {
    let sanitized: String = assigned_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!(
        "{}-{}-{}",
        SNAPSHOT_PREFIX,
        sanitized,
        at.format("%Y%m%d%H%M%S%3f")
    )
}

fn trim_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
