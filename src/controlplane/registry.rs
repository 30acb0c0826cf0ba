//! Storage Provider Registry
//!
//! Maps storage class names to their backend, default reclaim policy, volume
//! name template and annotation denylist. Built once at startup and read-only
//! afterwards.

use super::backends::BackendFactory;
use crate::config::ControllerConfig;
use crate::domain::annotations::{self, PVC_NAME, PVC_NAMESPACE, PV_TAG, STORAGE_CLASS};
use crate::domain::ports::{ReclaimPolicy, StorageBackendRef};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Name template used when a class does not configure one
pub fn default_name_format() -> String {
    format!("{{{}}}-{{{}}}-{{{}}}-{{{}}}", STORAGE_CLASS, PVC_NAMESPACE, PVC_NAME, PV_TAG)
}

/// Everything the reconciler needs to serve one storage class
#[derive(Clone)]
pub struct StorageProvider {
    pub storage_class: String,
    pub backend: StorageBackendRef,
    pub reclaim_policy: ReclaimPolicy,
    pub pv_name_format: String,
    /// Fully qualified annotation keys claims may not set
    pub blocked_annotations: BTreeSet<String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProvider")
            .field("storage_class", &self.storage_class)
            .field("backend", &self.backend.backend_name())
            .field("reclaim_policy", &self.reclaim_policy)
            .field("pv_name_format", &self.pv_name_format)
            .field("blocked_annotations", &self.blocked_annotations)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct StorageProviderRegistry {
    default_class: Option<String>,
    providers: BTreeMap<String, StorageProvider>,
}

impl StorageProviderRegistry {
    /// Build a registry from already constructed providers
    pub fn new(default_class: Option<String>, providers: Vec<StorageProvider>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for provider in providers {
            if provider.storage_class.trim().is_empty() {
                return Err(Error::Configuration("empty storage class name".into()));
            }
            let class = provider.storage_class.clone();
            if map.insert(class.clone(), provider).is_some() {
                return Err(Error::Configuration(format!("duplicate storage class '{}'", class)));
            }
        }
        let default_class = default_class.filter(|c| !c.is_empty());
        if let Some(default) = &default_class {
            if !map.contains_key(default) {
                return Err(Error::Configuration(format!(
                    "default storage class '{}' is not configured",
                    default
                )));
            }
        }
        Ok(Self {
            default_class,
            providers: map,
        })
    }

    /// Instantiate every configured backend; any configuration error is fatal
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        config.validate()?;
        let global_blocked = config.global_blocked_annotations();

        let mut providers = Vec::with_capacity(config.storage_providers.len());
        for entry in &config.storage_providers {
            let storage_class = entry.storage_class_name()?.to_string();
            let reclaim_policy = match entry.reclaim_policy.as_deref() {
                None => ReclaimPolicy::Delete,
                Some(raw) => ReclaimPolicy::parse(raw).ok_or_else(|| {
                    Error::Configuration(format!(
                        "invalid reclaimPolicy '{}' for storage class {}",
                        raw, storage_class
                    ))
                })?,
            };
            let mut blocked = global_blocked.clone();
            blocked.extend(entry.blocked_annotations.iter().map(|k| annotations::qualified(k)));

            let provider = StorageProvider {
                backend: BackendFactory::create(entry)?,
                reclaim_policy,
                pv_name_format: entry
                    .pv_name_format
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(default_name_format),
                blocked_annotations: blocked,
                storage_class,
            };
            info!(
                "Registered storage class {} (reclaim {}, {} blocked annotations)",
                provider.storage_class,
                provider.reclaim_policy,
                provider.blocked_annotations.len()
            );
            providers.push(provider);
        }

        Self::new(config.default_storage_class.clone(), providers)
    }

    pub fn get(&self, storage_class: &str) -> Option<&StorageProvider> {
        self.providers.get(storage_class)
    }

    pub fn default_class(&self) -> Option<&str> {
        self.default_class.as_deref()
    }

    /// Provider for `storage_class`, or the default class when none is given
    pub fn resolve(&self, storage_class: Option<&str>) -> Option<&StorageProvider> {
        match storage_class.filter(|c| !c.is_empty()) {
            Some(class) => self.get(class),
            None => self.default_class().and_then(|c| self.get(c)),
        }
    }

    pub fn storage_classes(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
