//! Controller configuration
//!
//! YAML file describing the provisioner identity, the default storage class,
//! the global annotation denylist and one entry per storage class with its
//! backend settings.

use crate::domain::annotations::{self, DEFAULT_PROVISIONER_NAME};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Denylist applied when the file does not set `blockedAnnotations`
pub const DEFAULT_BLOCKED_ANNOTATIONS: &[&str] = &["reclaim-policy", "compression"];

// =============================================================================
// Top Level
// =============================================================================

/// Root of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Identity written into `managed-by`; claims name it as their provisioner
    #[serde(default)]
    pub provisioner_name: Option<String>,
    /// Class used when a claim names none
    #[serde(default)]
    pub default_storage_class: Option<String>,
    /// Keys claims may never set, applied to every class
    #[serde(default)]
    pub blocked_annotations: Option<Vec<String>>,
    #[serde(default)]
    pub storage_providers: Vec<StorageProviderConfig>,
}

impl ControllerConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        info!(
            "Loaded configuration from {} ({} storage providers)",
            path.display(),
            config.storage_providers.len()
        );
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the structural rules that do not depend on a backend
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for provider in &self.storage_providers {
            let class = provider.storage_class_name()?;
            if !seen.insert(class) {
                return Err(Error::Configuration(format!(
                    "duplicate storage class '{}'",
                    class
                )));
            }
        }

        if let Some(default) = self.default_storage_class.as_deref() {
            if !default.is_empty() && !seen.contains(default) {
                return Err(Error::Configuration(format!(
                    "default storage class '{}' is not configured",
                    default
                )));
            }
        }

        Ok(())
    }

    pub fn provisioner_name(&self) -> &str {
        self.provisioner_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PROVISIONER_NAME)
    }

    /// Global denylist as fully qualified annotation keys
    pub fn global_blocked_annotations(&self) -> BTreeSet<String> {
        match &self.blocked_annotations {
            Some(list) => list.iter().map(|k| annotations::qualified(k)).collect(),
            None => {
                warn!(
                    "No blockedAnnotations configured, using defaults: {:?}",
                    DEFAULT_BLOCKED_ANNOTATIONS
                );
                DEFAULT_BLOCKED_ANNOTATIONS
                    .iter()
                    .map(|k| annotations::qualified(k))
                    .collect()
            }
        }
    }
}

// =============================================================================
// Storage Provider Entry
// =============================================================================

/// One storage class and the backend serving it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProviderConfig {
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Delete, Retain or Recycle; defaults to Delete
    #[serde(default)]
    pub reclaim_policy: Option<String>,
    #[serde(default)]
    pub pv_name_format: Option<String>,
    #[serde(default)]
    pub blocked_annotations: Vec<String>,
    #[serde(default)]
    pub management_provider: Option<String>,
    #[serde(default)]
    pub configuration: BackendSettings,
}

impl StorageProviderConfig {
    pub fn storage_class_name(&self) -> Result<&str> {
        match self.storage_class.as_deref() {
            Some(class) if !class.trim().is_empty() => Ok(class),
            _ => Err(Error::Configuration(
                "storage provider entry without a storageClass".into(),
            )),
        }
    }
}

/// Backend settings subtree, interpreted by the selected management provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    #[serde(default)]
    pub nfs: Option<NfsSettings>,
    #[serde(default)]
    pub ssh: Option<SshSettings>,
    #[serde(default)]
    pub zfs: Option<ZfsSettings>,
    #[serde(default, alias = "truenas")]
    pub freenas: Option<ManagementApiSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsSettings {
    pub hostname: Option<String>,
    pub export_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    pub hostname: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Remote user name
    pub identity: Option<String>,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    #[serde(default)]
    pub strict_host_key_checking: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Reuse one multiplexed connection instead of connecting per command
    #[serde(default)]
    pub multiplex: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            hostname: None,
            port: default_ssh_port(),
            identity: None,
            private_key_file: None,
            strict_host_key_checking: false,
            connect_timeout_secs: default_connect_timeout(),
            multiplex: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZfsSettings {
    pub root_path: Option<String>,
    #[serde(default)]
    pub become_root: bool,
    /// ignore, quota, reserve or both; defaults to quota
    #[serde(default)]
    pub quota_mode: Option<String>,
    /// Octal permission bits applied to new exports, e.g. "0775"
    #[serde(default)]
    pub unix_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementApiSettings {
    pub endpoint_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl Default for ManagementApiSettings {
    fn default() -> Self {
        Self {
            endpoint_uri: None,
            client_id: None,
            client_secret: None,
            api_key: None,
            verify_tls: true,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Return a required string field or a configuration error naming it
pub(crate) fn require<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Configuration(format!("missing required field {}", field))),
    }
}
