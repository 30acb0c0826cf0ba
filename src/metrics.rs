//! Controller metrics
//!
//! Counters for the reconciliation engine, registered into a dedicated
//! Prometheus registry that the `/metrics` endpoint encodes.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct ControllerMetrics {
    pub claims_processed: IntCounter,
    pub volumes_provisioned: IntCounter,
    pub provisioning_failures: IntCounter,
    pub volumes_deleted: IntCounter,
    pub volumes_retained: IntCounter,
    pub backend_removals: IntCounter,
    pub events_dropped: IntCounter,
}

impl ControllerMetrics {
    /// Create the counters and register them with `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::unregistered()?;
        for counter in metrics.all() {
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| Error::Internal(format!("metric registration failed: {}", e)))?;
        }
        Ok(metrics)
    }

    /// Counters not attached to any registry, for tests and tooling
    pub fn unregistered() -> Result<Self> {
        Ok(Self {
            claims_processed: counter(
                "zfs_pv_claims_processed_total",
                "Claim events handled by the reconciler",
            )?,
            volumes_provisioned: counter(
                "zfs_pv_volumes_provisioned_total",
                "Volume objects created for claims",
            )?,
            provisioning_failures: counter(
                "zfs_pv_provisioning_failures_total",
                "Claims for which no volume could be created",
            )?,
            volumes_deleted: counter(
                "zfs_pv_volumes_deleted_total",
                "Released volume objects deleted by reclaim policy",
            )?,
            volumes_retained: counter(
                "zfs_pv_volumes_retained_total",
                "Released volumes marked with a released-at timestamp",
            )?,
            backend_removals: counter(
                "zfs_pv_backend_removals_total",
                "Dataset removals requested from storage backends",
            )?,
            events_dropped: counter(
                "zfs_pv_events_dropped_total",
                "Events dropped after a processing error",
            )?,
        })
    }

    fn all(&self) -> [&IntCounter; 7] {
        [
            &self.claims_processed,
            &self.volumes_provisioned,
            &self.provisioning_failures,
            &self.volumes_deleted,
            &self.volumes_retained,
            &self.backend_removals,
            &self.events_dropped,
        ]
    }
}

/// Encode every metric family in `registry` in the text exposition format
pub fn encode_text(registry: &Registry) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("metric encoding failed: {}", e)))?;
    Ok(buffer)
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::new(name, help).map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))
}
