//! ZFS over Management API Storage Backend
//!
//! Same dataset lifecycle and validation as the shell backend, driven through
//! structured calls to a NAS management API instead of shell commands.

use super::layout::{self, ExportLayout};
use super::options::{round_up_to_record, DatasetOptions, QuotaMode, TRACKING_PROPERTY};
use crate::domain::annotations::{
    AnnotationSet, CLONE_REF, CLONE_SNAPSHOT, PV_REF, VOLUME_EXPORT,
};
use crate::domain::ports::{StorageBackend, VolumeDescriptor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Management API Port
// =============================================================================

/// Dataset, snapshot and share operations of a NAS management API
#[async_trait]
pub trait DatasetApi: Send + Sync {
    async fn create_dataset(&self, request: &CreateDataset) -> Result<DatasetInfo>;

    /// `None` if the dataset does not exist
    async fn get_dataset(&self, id: &str) -> Result<Option<DatasetInfo>>;

    async fn update_quota(&self, id: &str, quota: &DatasetQuota) -> Result<()>;

    async fn delete_dataset(&self, id: &str) -> Result<()>;

    /// Returns the full snapshot id (`dataset@name`)
    async fn create_snapshot(&self, dataset: &str, name: &str, pv_ref: &str) -> Result<String>;

    async fn clone_snapshot(&self, snapshot: &str, dataset: &str) -> Result<()>;

    async fn delete_snapshot(&self, id: &str) -> Result<()>;

    async fn create_nfs_share(&self, path: &str, read_only: bool, comment: &str) -> Result<()>;

    /// Ids of the NFS shares exporting `path`
    async fn find_nfs_shares(&self, path: &str) -> Result<Vec<i64>>;

    async fn delete_nfs_share(&self, id: i64) -> Result<()>;

    /// Set octal permission bits on a path
    async fn set_mode(&self, path: &str, mode: u32) -> Result<()>;
}

pub type DatasetApiRef = Arc<dyn DatasetApi>;

// =============================================================================
// API Payloads
// =============================================================================

/// Request body for a new filesystem dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDataset {
    pub name: String,
    pub pv_ref: String,
    pub quota: DatasetQuota,
    pub options: DatasetOptions,
}

impl CreateDataset {
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("name".into(), json!(self.name));
        body.insert("type".into(), json!("FILESYSTEM"));
        if let Value::Object(quota) = self.quota.to_body() {
            body.extend(quota);
        }
        if let Some(size) = self.options.recordsize {
            body.insert("recordsize".into(), json!(record_size_label(size)));
        }
        let upper = [
            ("checksum", &self.options.checksum),
            ("compression", &self.options.compression),
            ("atime", &self.options.atime),
            ("exec", &self.options.exec),
            ("sync", &self.options.sync),
            ("snapdir", &self.options.snapdir),
            ("casesensitivity", &self.options.casesensitivity),
        ];
        for (name, value) in upper {
            if let Some(value) = value {
                body.insert(name.into(), json!(value.to_ascii_uppercase()));
            }
        }
        if self.options.logbias.is_some() {
            debug!("logbias is not applied through the management API for {}", self.name);
        }
        body.insert(
            "user_properties".into(),
            json!([{ "key": TRACKING_PROPERTY, "value": self.pv_ref }]),
        );
        body.insert("comments".into(), json!(format!("volume {}", self.pv_ref)));
        Value::Object(body)
    }
}

/// Size limit and guarantee for a dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetQuota {
    pub quota: Option<u64>,
    pub reservation: Option<u64>,
}

impl DatasetQuota {
    pub fn new(mode: QuotaMode, size_bytes: u64) -> Self {
        let mut quota = Self::default();
        for (name, value) in mode.properties(size_bytes) {
            match name {
                "quota" => quota.quota = Some(value),
                _ => quota.reservation = Some(value),
            }
        }
        quota
    }

    pub fn is_empty(&self) -> bool {
        self.quota.is_none() && self.reservation.is_none()
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        if let Some(quota) = self.quota {
            body.insert("quota".into(), json!(quota));
        }
        if let Some(reservation) = self.reservation {
            body.insert("reservation".into(), json!(reservation));
        }
        Value::Object(body)
    }
}

/// Fields of a dataset the backend reads back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub id: String,
    pub mountpoint: Option<String>,
    pub read_only: bool,
}

impl DatasetInfo {
    /// Parse a dataset object, accepting both plain and `{parsed, value}` property forms
    pub fn from_value(value: &Value) -> Self {
        let id = value
            .get("id")
            .or_else(|| value.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mountpoint = value
            .get("mountpoint")
            .and_then(Value::as_str)
            .map(str::to_string);
        let read_only = match value.get("readonly") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Object(prop)) => match prop.get("parsed") {
                Some(Value::Bool(b)) => *b,
                _ => prop
                    .get("value")
                    .and_then(Value::as_str)
                    .is_some_and(|v| v.eq_ignore_ascii_case("on")),
            },
            _ => false,
        };
        Self {
            id,
            mountpoint,
            read_only,
        }
    }
}

fn record_size_label(size: u64) -> String {
    if size >= 1024 && size % 1024 == 0 {
        format!("{}K", size / 1024)
    } else {
        size.to_string()
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ZfsRestConfig {
    pub layout: ExportLayout,
    pub quota_mode: QuotaMode,
    pub unix_mode: Option<u32>,
}

// =============================================================================
// ZFS REST Backend
// =============================================================================

pub struct ZfsRestBackend {
    name: String,
    config: ZfsRestConfig,
    api: DatasetApiRef,
}

impl ZfsRestBackend {
    pub fn new(name: impl Into<String>, config: ZfsRestConfig, api: DatasetApiRef) -> Self {
        Self {
            name: name.into(),
            config,
            api,
        }
    }

    async fn try_create(
        &self,
        annotations: &mut AnnotationSet,
        size_bytes: u64,
    ) -> Result<VolumeDescriptor> {
        layout::check_volume_request(annotations)?;
        let uuid = layout::volume_uuid(annotations)?;
        let pv_ref = annotations
            .get(PV_REF)
            .cloned()
            .ok_or_else(|| Error::MissingAnnotation { key: PV_REF.to_string() })?;

        let clone_source = match annotations.get(CLONE_REF) {
            Some(clone_ref) => Some(self.config.layout.parse_clone_ref(clone_ref)?),
            None => None,
        };

        let placement = &self.config.layout;
        let dataset = placement.dataset_path(&uuid);
        placement.write_annotations(annotations, &uuid);

        let options = DatasetOptions::from_annotations(annotations);
        let size_bytes = match options.recordsize {
            Some(record) => round_up_to_record(size_bytes, record),
            None => size_bytes,
        };
        let quota = DatasetQuota::new(self.config.quota_mode, size_bytes);

        let info = match clone_source {
            Some(source) => {
                let name = layout::snapshot_name(&pv_ref, Utc::now());
                let snapshot = self.api.create_snapshot(&source, &name, &pv_ref).await?;
                annotations.insert(CLONE_SNAPSHOT.to_string(), snapshot.clone());

                if let Err(e) = self.api.clone_snapshot(&snapshot, &dataset).await {
                    error!("Clone of {} into {} failed, snapshot left behind: {}", snapshot, dataset, e);
                    return Err(e);
                }
                if !quota.is_empty() {
                    self.api.update_quota(&dataset, &quota).await?;
                }
                info!("Cloned {} from {} for {}", dataset, snapshot, pv_ref);
                self.api.get_dataset(&dataset).await?
            }
            None => {
                let request = CreateDataset {
                    name: dataset.clone(),
                    pv_ref: pv_ref.clone(),
                    quota,
                    options,
                };
                let created = self.api.create_dataset(&request).await?;
                info!("Created dataset {} ({} bytes) for {}", dataset, size_bytes, pv_ref);
                match created.mountpoint {
                    Some(_) => Some(created),
                    None => self.api.get_dataset(&dataset).await?,
                }
            }
        };

        let info = info.ok_or_else(|| Error::BackendOperationFailed {
            backend: self.name.clone(),
            operation: "create".into(),
            reason: format!("dataset {} not found after creation", dataset),
        })?;
        let export_path = info
            .mountpoint
            .clone()
            .unwrap_or_else(|| placement.export_path(&uuid));
        annotations.insert(VOLUME_EXPORT.to_string(), export_path.clone());

        self.api
            .create_nfs_share(&export_path, info.read_only, &format!("volume {}", pv_ref))
            .await?;

        if let Some(mode) = self.config.unix_mode {
            self.api.set_mode(&export_path, mode).await?;
        }

        Ok(VolumeDescriptor {
            export_host: placement.nfs_host.clone(),
            export_path,
            read_only: info.read_only,
            assigned_name: pv_ref,
            reclaim_policy: None,
        })
    }
}

#[async_trait]
impl StorageBackend for ZfsRestBackend {
    async fn create(&self, annotations: &mut AnnotationSet, size_bytes: u64) -> Option<VolumeDescriptor> {
        match self.try_create(annotations, size_bytes).await {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                error!("Backend {} could not create volume: {}", self.name, e);
                None
            }
        }
    }

    async fn remove(&self, annotations: &AnnotationSet) -> Result<()> {
        let uuid = layout::volume_uuid(annotations)?;
        let layout = &self.config.layout;
        let dataset = layout.dataset_path(&uuid);
        let export_path = annotations
            .get(VOLUME_EXPORT)
            .cloned()
            .unwrap_or_else(|| layout.export_path(&uuid));

        match self.api.find_nfs_shares(&export_path).await {
            Ok(ids) => {
                for id in ids {
                    if let Err(e) = self.api.delete_nfs_share(id).await {
                        error!("Failed to delete NFS share {} for {}: {}", id, export_path, e);
                    }
                }
            }
            Err(e) => error!("Failed to list NFS shares for {}: {}", export_path, e),
        }

        match self.api.delete_dataset(&dataset).await {
            Ok(()) => info!("Destroyed {}", dataset),
            Err(e) => error!("Failed to destroy {}: {}", dataset, e),
        }

        if let Some(snapshot) = annotations.get(CLONE_SNAPSHOT) {
            match layout.validate_snapshot(snapshot) {
                Some(snapshot) => match self.api.delete_snapshot(snapshot).await {
                    Ok(()) => info!("Destroyed {}", snapshot),
                    Err(e) => error!("Failed to destroy {}: {}", snapshot, e),
                },
                None => warn!(
                    "Not destroying clone snapshot outside {}: {}",
                    layout.dataset_root, snapshot
                ),
            }
        }
        Ok(())
    }

    fn is_local_dataset(&self, host: &str, dataset_path: &str) -> bool {
        self.config.layout.owns_dataset(host, dataset_path)
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}
