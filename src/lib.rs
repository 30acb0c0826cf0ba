//! ZFS PV Provisioner
//!
//! A Kubernetes controller that provisions PersistentVolumes for pending
//! claims by creating ZFS datasets and exporting them over NFS, either
//! through `zfs` commands over SSH or through a NAS management REST API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                      Kubernetes API (claims / volumes)                       │
//! └───────────────┬─────────────────────────────────────────┬───────────────────┘
//!                 │ watch                                   │ create/patch/delete
//! ┌───────────────┴───────────────┐           ┌─────────────┴───────────────────┐
//! │  Watch loops -> Event queues  │ ────────▶ │      Reconciliation Engine      │
//! └───────────────────────────────┘           └─────────────┬───────────────────┘
//!                                                           │
//!                                             ┌─────────────┴───────────────────┐
//!                                             │   Storage Provider Registry     │
//!                                             │  (storage class -> backend)     │
//!                                             └─────────────┬───────────────────┘
//!                                  ┌────────────────────────┴───────────────┐
//!                       ┌──────────┴──────────┐               ┌─────────────┴─────────┐
//!                       │  zfscli (SSH shell) │               │ freenas (REST API)    │
//!                       └─────────────────────┘               └───────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Reconciler, provider registry, backends and controller loops
//! - [`domain`]: Annotation protocol, events, name templating and ports
//! - [`config`]: Configuration file schema
//! - [`metrics`]: Prometheus counters
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{ControllerConfig, StorageProviderConfig};

pub use controlplane::{
    BackendFactory, ClaimOutcome, Controller, KubeCluster, LocalEventQueue, LoopSettings,
    ManagementProvider, Reconciler, StorageProvider, StorageProviderRegistry, VolumeOutcome,
};

pub use domain::ports::{
    ClusterApi, ClusterApiRef, CommandOutput, EventQueue, EventQueueRef, ReclaimPolicy,
    RemoteExecutor, RemoteExecutorRef, StorageBackend, StorageBackendRef, VolumeDescriptor,
    WatchItem, WatchStream,
};
pub use domain::{AnnotationSet, ChangeType, ClaimEvent, TransientScope, VolumeEvent};

pub use error::{Error, ErrorAction, Result};

pub use metrics::ControllerMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
