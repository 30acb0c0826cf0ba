//! Provisioning Control Plane
//!
//! The reconciliation engine and everything it drives: the storage provider
//! registry, the storage backends, the cluster adapter and the loops that
//! connect them.

pub mod backends;
pub mod cluster;
pub mod controller;
pub mod queue;
pub mod reconciler;
pub mod registry;

pub use backends::{BackendFactory, ManagementProvider};
pub use cluster::KubeCluster;
pub use controller::{Controller, LoopSettings};
pub use queue::LocalEventQueue;
pub use reconciler::{ClaimOutcome, Reconciler, VolumeOutcome};
pub use registry::{StorageProvider, StorageProviderRegistry};
