//! Storage Backend Adapters
//!
//! Provides adapters for the supported management providers:
//! - zfscli: ZFS commands over SSH
//! - freenas / truenas: the NAS management REST API

pub mod layout;
pub mod options;
pub mod transport;
pub mod truenas;
pub mod zfs_rest;
pub mod zfs_shell;

pub use layout::ExportLayout;
pub use options::{DatasetOptions, QuotaMode};
pub use transport::{SshExecutor, SshTarget};
pub use truenas::TrueNasClient;
pub use zfs_rest::{DatasetApi, ZfsRestBackend, ZfsRestConfig};
pub use zfs_shell::{ZfsShellBackend, ZfsShellConfig};

use crate::config::{require, BackendSettings, StorageProviderConfig, ZfsSettings};
use crate::domain::ports::StorageBackendRef;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Backend families selectable through `managementProvider`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementProvider {
    ZfsShell,
    ZfsRest,
}

impl ManagementProvider {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "zfscli" | "zfs-shell" | "ssh" => Ok(ManagementProvider::ZfsShell),
            "freenas" | "truenas" | "zfs-rest" => Ok(ManagementProvider::ZfsRest),
            other => Err(Error::Configuration(format!(
                "unknown management provider '{}'",
                other
            ))),
        }
    }
}

/// Factory for creating storage backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Create the backend described by one storage provider entry
    pub fn create(provider: &StorageProviderConfig) -> Result<StorageBackendRef> {
        let class = provider.storage_class_name()?;
        let kind = ManagementProvider::parse(&require(
            &provider.management_provider,
            "managementProvider",
        )?)?;
        let settings = &provider.configuration;
        let layout = export_layout(settings)?;
        let zfs = settings.zfs.clone().unwrap_or_default();
        let quota_mode = quota_mode(&zfs)?;
        let unix_mode = unix_mode(&zfs)?;

        let backend: StorageBackendRef = match kind {
            ManagementProvider::ZfsShell => {
                let ssh = settings.ssh.clone().unwrap_or_default();
                let host = ssh
                    .hostname
                    .clone()
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| layout.nfs_host.clone());
                let executor = Arc::new(SshExecutor::new(SshTarget::from_settings(&host, &ssh)));
                info!(
                    "Storage class {}: zfscli backend on {} (root {}, quota mode {:?})",
                    class, host, layout.dataset_root, quota_mode
                );
                Arc::new(ZfsShellBackend::new(
                    class,
                    ZfsShellConfig {
                        layout,
                        become_root: zfs.become_root,
                        quota_mode,
                        unix_mode,
                    },
                    executor,
                ))
            }
            ManagementProvider::ZfsRest => {
                let api_settings = settings.freenas.clone().ok_or_else(|| {
                    Error::Configuration("missing required field freenas".into())
                })?;
                let endpoint = require(&api_settings.endpoint_uri, "freenas.endpointUri")?;
                let client = Arc::new(TrueNasClient::new(endpoint, &api_settings)?);
                info!(
                    "Storage class {}: management API backend at {} (root {}, quota mode {:?})",
                    class, endpoint, layout.dataset_root, quota_mode
                );
                Arc::new(ZfsRestBackend::new(
                    class,
                    ZfsRestConfig {
                        layout,
                        quota_mode,
                        unix_mode,
                    },
                    client,
                ))
            }
        };
        Ok(backend)
    }
}

fn export_layout(settings: &BackendSettings) -> Result<ExportLayout> {
    let nfs = settings
        .nfs
        .as_ref()
        .ok_or_else(|| Error::Configuration("missing required field nfs".into()))?;
    let zfs = settings
        .zfs
        .as_ref()
        .ok_or_else(|| Error::Configuration("missing required field zfs".into()))?;
    Ok(ExportLayout::new(
        require(&nfs.hostname, "nfs.hostname")?,
        require(&nfs.export_root, "nfs.exportRoot")?,
        require(&zfs.root_path, "zfs.rootPath")?,
    ))
}

fn quota_mode(zfs: &ZfsSettings) -> Result<QuotaMode> {
    match zfs.quota_mode.as_deref() {
        None => Ok(QuotaMode::default()),
        Some(mode) => QuotaMode::parse(mode)
            .ok_or_else(|| Error::Configuration(format!("invalid zfs.quotaMode '{}'", mode))),
    }
}

/// Parse octal permission bits such as "775" or "0775"
fn unix_mode(zfs: &ZfsSettings) -> Result<Option<u32>> {
    let Some(raw) = zfs.unix_mode.as_deref() else {
        return Ok(None);
    };
    let raw = raw.trim();
    match u32::from_str_radix(raw, 8) {
        Ok(mode) if raw.len() <= 4 && mode <= 0o7777 => Ok(Some(mode)),
        _ => Err(Error::Configuration(format!("invalid zfs.unixMode '{}'", raw))),
    }
}
