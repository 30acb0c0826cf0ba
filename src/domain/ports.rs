//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems: the cluster API, the event queues, the storage backends
//! and the remote shell they drive. Adapters implement these traits to provide
//! concrete functionality; tests substitute in-memory fakes.

use super::annotations::AnnotationSet;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Reclaim Policy
// =============================================================================

/// Action taken on a volume after its claim is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Delete,
    Retain,
    /// Handled exactly like `Delete`: the dataset is destroyed, never scrubbed in place
    Recycle,
}

impl ReclaimPolicy {
    /// Parse a policy name, ignoring case
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delete" => Some(ReclaimPolicy::Delete),
            "retain" => Some(ReclaimPolicy::Retain),
            "recycle" => Some(ReclaimPolicy::Recycle),
            _ => None,
        }
    }

    /// Whether a released volume with this policy is destroyed
    pub fn destroys_volume(&self) -> bool {
        matches!(self, ReclaimPolicy::Delete | ReclaimPolicy::Recycle)
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimPolicy::Delete => write!(f, "Delete"),
            ReclaimPolicy::Retain => write!(f, "Retain"),
            ReclaimPolicy::Recycle => write!(f, "Recycle"),
        }
    }
}

// =============================================================================
// Backend Types
// =============================================================================

/// Export produced by a backend's create call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Host serving the export
    pub export_host: String,
    /// Path of the export on that host
    pub export_path: String,
    /// Whether the export is read-only
    pub read_only: bool,
    /// Volume object name the export was created for
    pub assigned_name: String,
    /// Filled in by the reconciler once the claim's override is resolved
    pub reclaim_policy: Option<ReclaimPolicy>,
}

/// Result of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    /// Standard output and standard error, merged
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

// =============================================================================
// Storage Backend Port
// =============================================================================

/// Port for dataset lifecycle operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a dataset and its export for the working annotation set.
    ///
    /// Writes backend output keys (host, dataset path, export path, provider
    /// type, clone snapshot) into `annotations`. Returns `None` when the
    /// request was declined or any remote step failed; failures are logged.
    async fn create(&self, annotations: &mut AnnotationSet, size_bytes: u64) -> Option<VolumeDescriptor>;

    /// Destroy the dataset recorded in `annotations`.
    ///
    /// A missing or malformed volume UUID is an error. Remote failures are
    /// logged, never returned, so repeated calls for the same volume succeed.
    async fn remove(&self, annotations: &AnnotationSet) -> Result<()>;

    /// Whether `dataset_path` on `host` belongs to this backend instance
    fn is_local_dataset(&self, host: &str, dataset_path: &str) -> bool;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// Lets test assertions format `Result<Arc<dyn StorageBackend>, _>`.
#[cfg(test)]
impl std::fmt::Debug for dyn StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBackend").finish_non_exhaustive()
    }
}

// =============================================================================
// Remote Executor Port
// =============================================================================

/// Port for running shell commands on a storage host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command`, returning its exit status and merged output.
    ///
    /// Transport failures are returned as errors; a non-zero exit status is
    /// not an error at this level.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Host the commands run on
    fn host(&self) -> &str;
}

// =============================================================================
// Cluster API Port
// =============================================================================

/// One item from a watch stream
#[derive(Debug, Clone)]
pub enum WatchItem<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchItem<K>>>;

/// Port for the cluster operations the reconciler needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Point read of a claim, `None` if it does not exist
    async fn read_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// Point read of a volume, `None` if it does not exist
    async fn read_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Submit a new volume object
    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume>;

    /// Delete a volume object; deleting a missing volume succeeds
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Add or replace a single annotation on a volume object
    async fn annotate_volume(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Open a long-lived watch on claims in all namespaces
    async fn watch_claims(&self) -> Result<WatchStream<PersistentVolumeClaim>>;

    /// Open a long-lived watch on volumes
    async fn watch_volumes(&self) -> Result<WatchStream<PersistentVolume>>;

    /// Drop cached credentials and connections so the next call re-authenticates
    async fn reset_session(&self) -> Result<()>;
}

// =============================================================================
// Event Queue Port
// =============================================================================

/// Port for the queue between a watch loop and its notification loop
#[async_trait]
pub trait EventQueue<T: Send + 'static>: Send + Sync {
    fn enqueue(&self, item: T);

    fn try_dequeue(&self) -> Option<T>;

    /// Resolves once an item may be available
    async fn notified(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageBackendRef = Arc<dyn StorageBackend>;
pub type RemoteExecutorRef = Arc<dyn RemoteExecutor>;
pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type EventQueueRef<T> = Arc<dyn EventQueue<T>>;
