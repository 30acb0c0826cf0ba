//! Reconciliation Engine
//!
//! Turns claim and volume change events into backend create/remove calls and
//! volume object create/delete/patch calls.
//!
//! Claim path: a pending claim that names this provisioner (or names no
//! provisioner but resolves to a configured class) gets a dataset and a
//! volume object pre-bound to it through `claimRef`.
//!
//! Volume path: only volumes whose `managed-by` annotation carries this
//! provisioner's identity are touched. Deleted volumes always trigger a
//! backend remove; released (or failed) volumes are deleted or marked
//! according to the effective reclaim policy.

use super::registry::{StorageProvider, StorageProviderRegistry};
use crate::domain::annotations::{
    self, AnnotationSet, TransientScope, CLONE_FROM, CLONE_REF, MANAGED_BY, PV_REF, PV_TAG,
    PV_TAG_LEN, RECLAIM_POLICY, RELEASED_AT, STORAGE_CLASS, VOLUME_HOST, VOLUME_MODE, VOLUME_PATH,
    VOLUME_UUID,
};
use crate::domain::events::{ChangeType, ClaimEvent, ClaimPhase, VolumeEvent, VolumePhase};
use crate::domain::ports::{ClusterApiRef, ReclaimPolicy, VolumeDescriptor};
use crate::domain::template;
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    NFSVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Reclaim policy written on created volume objects. The cluster never
/// reclaims these volumes itself; this controller does.
const CLUSTER_RECLAIM_POLICY: &str = "Retain";

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to a claim event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Not an added, pending claim, or not addressed to this provisioner
    Skipped,
    /// The claim names a different provisioner
    ForeignProvisioner(String),
    /// A volume object was created for the claim
    Provisioned { volume_name: String },
}

/// What happened to a volume event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeOutcome {
    /// Not managed by this provisioner
    NotManaged,
    /// The volume object was deleted and its dataset removed
    Removed,
    /// Released with Delete or Recycle: volume object deleted, dataset removed
    Deleted,
    /// Released with Retain: the released-at marker was added
    Retained,
    /// Released with Retain and already marked
    AlreadyRetained,
    /// Any other phase; nothing to do
    Observed,
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct Reconciler {
    identity: String,
    registry: Arc<StorageProviderRegistry>,
    cluster: ClusterApiRef,
    metrics: ControllerMetrics,
}

impl Reconciler {
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<StorageProviderRegistry>,
        cluster: ClusterApiRef,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            identity: identity.into(),
            registry,
            cluster,
            metrics,
        }
    }

    /// Identity written into and matched against `managed-by`
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    // =========================================================================
    // Claim Path
    // =========================================================================

    /// Provision a volume for an added, pending claim
    pub async fn handle_claim(&self, event: &ClaimEvent) -> Result<ClaimOutcome> {
        if event.change != ChangeType::Added || event.phase != ClaimPhase::Pending {
            trace!(
                "Claim {}/{} {} in phase {:?}, nothing to provision",
                event.namespace,
                event.name,
                event.change,
                event.phase
            );
            return Ok(ClaimOutcome::Skipped);
        }

        let provisioner = annotations::claim_provisioner(&event.annotations);
        if let Some(name) = provisioner {
            if name != self.identity {
                trace!(
                    "Claim {}/{} belongs to provisioner {}",
                    event.namespace,
                    event.name,
                    name
                );
                return Ok(ClaimOutcome::ForeignProvisioner(name.to_string()));
            }
        }
        self.metrics.claims_processed.inc();

        let mut working = annotations::from_claim(&event.namespace, &event.name, &event.annotations);
        annotations::strip_internal(&mut working);

        let requested_class = working
            .get(STORAGE_CLASS)
            .cloned()
            .or_else(|| event.storage_class_name.clone())
            .filter(|c| !c.is_empty());
        let provider = match self.registry.resolve(requested_class.as_deref()) {
            Some(provider) => provider,
            None if provisioner.is_none() => {
                trace!(
                    "Claim {}/{} has no provisioner and no configured class, skipping",
                    event.namespace,
                    event.name
                );
                return Ok(ClaimOutcome::Skipped);
            }
            None => {
                return Err(Error::NoStorageClass {
                    storage_class: requested_class.unwrap_or_default(),
                })
            }
        };

        let removed = annotations::strip_blocked(&mut working, &provider.blocked_annotations);
        if !removed.is_empty() {
            warn!(
                "Claim {}/{}: ignoring blocked annotations {:?}",
                event.namespace, event.name, removed
            );
        }

        let volume_uuid = Uuid::new_v4().to_string();
        working.insert(MANAGED_BY.to_string(), self.identity.clone());
        working.insert(VOLUME_UUID.to_string(), volume_uuid.clone());
        working.insert(STORAGE_CLASS.to_string(), provider.storage_class.clone());
        // The claim spec is authoritative over a claim-supplied annotation
        if let Some(mode) = &event.volume_mode {
            working.insert(VOLUME_MODE.to_string(), mode.clone());
        }

        let descriptor = {
            let mut scope = TransientScope::new(&mut working);
            scope.insert_transient(PV_TAG, &volume_uuid[..PV_TAG_LEN]);

            if let Some(source) = scope.get(CLONE_FROM).cloned().filter(|s| !s.is_empty()) {
                let clone_ref = self.resolve_clone_source(&event.namespace, &source, provider).await?;
                debug!(
                    "Claim {}/{} clones {} ({})",
                    event.namespace, event.name, source, clone_ref
                );
                scope.insert_transient(CLONE_REF, clone_ref);
            }

            let volume_name = template::render(&provider.pv_name_format, &scope);
            scope.insert_transient(PV_REF, volume_name.clone());

            let Some(mut descriptor) = provider.backend.create(&mut scope, event.requested_bytes).await
            else {
                self.metrics.provisioning_failures.inc();
                return Err(Error::BackendDeclined {
                    storage_class: provider.storage_class.clone(),
                    namespace: event.namespace.clone(),
                    claim: event.name.clone(),
                });
            };

            let policy = effective_reclaim_policy(&scope, provider.reclaim_policy, &volume_name);
            scope.insert(RECLAIM_POLICY.to_string(), policy.to_string());
            descriptor.reclaim_policy = Some(policy);
            descriptor
        };

        let volume = build_volume(event, &descriptor, working);
        match self.cluster.create_volume(volume).await {
            Ok(_) => {
                self.metrics.volumes_provisioned.inc();
                info!(
                    "Provisioned volume {} for claim {}/{} ({} bytes, {}:{}, reclaim {})",
                    descriptor.assigned_name,
                    event.namespace,
                    event.name,
                    event.requested_bytes,
                    descriptor.export_host,
                    descriptor.export_path,
                    policy_label(&descriptor)
                );
                Ok(ClaimOutcome::Provisioned {
                    volume_name: descriptor.assigned_name,
                })
            }
            Err(e) => {
                self.metrics.provisioning_failures.inc();
                error!(
                    "Failed to create volume {} for claim {}/{}; dataset {}:{} is orphaned: {}",
                    descriptor.assigned_name,
                    event.namespace,
                    event.name,
                    descriptor.export_host,
                    descriptor.export_path,
                    e
                );
                Err(e)
            }
        }
    }

    /// Validate a clone source claim and return its `host:dataset` reference
    async fn resolve_clone_source(
        &self,
        namespace: &str,
        source_claim: &str,
        provider: &StorageProvider,
    ) -> Result<String> {
        let claim = self
            .cluster
            .read_claim(namespace, source_claim)
            .await?
            .ok_or_else(|| clone_error(namespace, source_claim, "claim not found"))?;

        let volume_name = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| clone_error(namespace, source_claim, "claim is not bound"))?;

        let volume = self.cluster.read_volume(&volume_name).await?.ok_or_else(|| {
            clone_error(namespace, source_claim, format!("volume {} not found", volume_name))
        })?;
        let volume_annotations = volume.metadata.annotations.unwrap_or_default();

        if volume_annotations.get(MANAGED_BY) != Some(&self.identity) {
            return Err(clone_error(
                namespace,
                source_claim,
                format!("volume {} is not managed by {}", volume_name, self.identity),
            ));
        }

        let (Some(host), Some(dataset)) =
            (volume_annotations.get(VOLUME_HOST), volume_annotations.get(VOLUME_PATH))
        else {
            return Err(clone_error(
                namespace,
                source_claim,
                format!("volume {} carries no dataset location", volume_name),
            ));
        };

        if !provider.backend.is_local_dataset(host, dataset) {
            return Err(clone_error(
                namespace,
                source_claim,
                format!(
                    "dataset {}:{} does not belong to storage class {}",
                    host, dataset, provider.storage_class
                ),
            ));
        }

        Ok(format!("{}:{}", host, dataset))
    }

    // =========================================================================
    // Volume Path
    // =========================================================================

    /// Apply deletion and reclaim handling to a managed volume
    pub async fn handle_volume(&self, event: &VolumeEvent) -> Result<VolumeOutcome> {
        if !event.is_managed_by(&self.identity) {
            trace!("Volume {} is not managed by {}", event.name, self.identity);
            return Ok(VolumeOutcome::NotManaged);
        }

        if event.change == ChangeType::Deleted {
            let provider = self.provider_for_volume(event)?;
            info!("Volume {} deleted, removing its dataset", event.name);
            self.remove_dataset(provider, event).await?;
            return Ok(VolumeOutcome::Removed);
        }

        match &event.phase {
            VolumePhase::Failed => {
                warn!(
                    "Volume {} failed ({}: {}), treating as released",
                    event.name,
                    event.phase_reason.as_deref().unwrap_or("unknown"),
                    event.phase_message.as_deref().unwrap_or("")
                );
                self.reclaim(event).await
            }
            VolumePhase::Released => self.reclaim(event).await,
            phase => {
                debug!("Volume {} is {}", event.name, phase);
                Ok(VolumeOutcome::Observed)
            }
        }
    }

    async fn reclaim(&self, event: &VolumeEvent) -> Result<VolumeOutcome> {
        let provider = self.provider_for_volume(event)?;
        let policy = effective_reclaim_policy(&event.annotations, provider.reclaim_policy, &event.name);

        if policy.destroys_volume() {
            info!("Volume {} released with policy {}, deleting", event.name, policy);
            self.cluster.delete_volume(&event.name).await?;
            self.metrics.volumes_deleted.inc();
            self.remove_dataset(provider, event).await?;
            return Ok(VolumeOutcome::Deleted);
        }

        if event.annotations.contains_key(RELEASED_AT) {
            trace!("Volume {} already marked as released", event.name);
            return Ok(VolumeOutcome::AlreadyRetained);
        }

        // The event may be stale; only the stored object decides
        let current = self.cluster.read_volume(&event.name).await?;
        let already_marked = current
            .as_ref()
            .and_then(|v| v.metadata.annotations.as_ref())
            .is_some_and(|a| a.contains_key(RELEASED_AT));
        if current.is_none() || already_marked {
            trace!("Volume {} needs no released-at marker", event.name);
            return Ok(VolumeOutcome::AlreadyRetained);
        }

        let released_at = Utc::now().timestamp().to_string();
        self.cluster
            .annotate_volume(&event.name, RELEASED_AT, &released_at)
            .await?;
        self.metrics.volumes_retained.inc();
        info!("Volume {} retained, released at {}", event.name, released_at);
        Ok(VolumeOutcome::Retained)
    }

    async fn remove_dataset(&self, provider: &StorageProvider, event: &VolumeEvent) -> Result<()> {
        self.metrics.backend_removals.inc();
        provider.backend.remove(&event.annotations).await
    }

    fn provider_for_volume(&self, event: &VolumeEvent) -> Result<&StorageProvider> {
        let class = event
            .annotations
            .get(STORAGE_CLASS)
            .cloned()
            .or_else(|| event.spec.as_ref().and_then(|s| s.storage_class_name.clone()))
            .filter(|c| !c.is_empty());
        self.registry
            .resolve(class.as_deref())
            .ok_or_else(|| Error::NoStorageClass {
                storage_class: class.unwrap_or_default(),
            })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Valid `reclaim-policy` annotation, else the class default
fn effective_reclaim_policy(
    annotations: &AnnotationSet,
    class_default: ReclaimPolicy,
    resource: &str,
) -> ReclaimPolicy {
    match annotations.get(RECLAIM_POLICY) {
        None => class_default,
        Some(raw) => ReclaimPolicy::parse(raw).unwrap_or_else(|| {
            warn!(
                "{}: unrecognised reclaim policy '{}', using {}",
                resource, raw, class_default
            );
            class_default
        }),
    }
}

fn clone_error(namespace: &str, source_claim: &str, reason: impl Into<String>) -> Error {
    Error::CloneSource {
        namespace: namespace.to_string(),
        source_claim: source_claim.to_string(),
        reason: reason.into(),
    }
}

fn policy_label(descriptor: &VolumeDescriptor) -> String {
    descriptor
        .reclaim_policy
        .map(|p| p.to_string())
        .unwrap_or_else(|| "default".to_string())
}

/// Assemble the volume object pre-bound to the claim that caused it
fn build_volume(
    event: &ClaimEvent,
    descriptor: &VolumeDescriptor,
    annotations: AnnotationSet,
) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(descriptor.assigned_name.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                event.requested_storage.clone(),
            )])),
            access_modes: Some(event.access_modes.clone()),
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(event.namespace.clone()),
                name: Some(event.name.clone()),
                uid: Some(event.uid.clone()).filter(|u| !u.is_empty()),
                ..Default::default()
            }),
            nfs: Some(NFSVolumeSource {
                server: descriptor.export_host.clone(),
                path: descriptor.export_path.clone(),
                read_only: Some(descriptor.read_only),
            }),
            persistent_volume_reclaim_policy: Some(CLUSTER_RECLAIM_POLICY.to_string()),
            // Must match the claim exactly or the binder rejects the volume
            storage_class_name: event.storage_class_name.clone(),
            volume_mode: event.volume_mode.clone(),
            ..Default::default()
        }),
        status: None,
    }
}
