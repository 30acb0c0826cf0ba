//! Shared fakes and fixtures for the integration tests
//!
//! `FakeCluster` keeps volumes and claims in memory and records every
//! mutating call; `RecordingExecutor` records remote commands instead of
//! running them.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use zfs_pv_provisioner::controlplane::backends::{
    ExportLayout, QuotaMode, ZfsShellBackend, ZfsShellConfig,
};
use zfs_pv_provisioner::controlplane::registry::default_name_format;
use zfs_pv_provisioner::domain::annotations::DEFAULT_PROVISIONER_NAME;
use zfs_pv_provisioner::{
    ClusterApi, CommandOutput, ControllerMetrics, Error, ReclaimPolicy, Reconciler,
    RemoteExecutor, Result, StorageProvider, StorageProviderRegistry, WatchItem, WatchStream,
};

pub const IDENTITY: &str = DEFAULT_PROVISIONER_NAME;
pub const NFS_HOST: &str = "nas01";
pub const DATASET_ROOT: &str = "tank/pv";
pub const EXPORT_ROOT: &str = "/mnt/tank/pv";

// =============================================================================
// Fake Cluster
// =============================================================================

#[derive(Default)]
pub struct FakeCluster {
    pub claims: Mutex<BTreeMap<(String, String), PersistentVolumeClaim>>,
    pub volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    pub created: Mutex<Vec<PersistentVolume>>,
    pub deleted: Mutex<Vec<String>>,
    pub patches: Mutex<Vec<(String, String, String)>>,
    pub resets: AtomicUsize,
    pub fail_create: AtomicBool,
    /// Number of claim watch opens that fail before one succeeds
    pub claim_watch_failures: AtomicUsize,
    pub claim_watch: Mutex<Option<Vec<WatchItem<PersistentVolumeClaim>>>>,
    pub volume_watch: Mutex<Option<Vec<WatchItem<PersistentVolume>>>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        let key = (
            claim.metadata.namespace.clone().unwrap_or_default(),
            claim.metadata.name.clone().unwrap_or_default(),
        );
        self.claims.lock().insert(key, claim);
    }

    pub fn add_volume(&self, volume: PersistentVolume) {
        let name = volume.metadata.name.clone().unwrap_or_default();
        self.volumes.lock().insert(name, volume);
    }

    pub fn created(&self) -> Vec<PersistentVolume> {
        self.created.lock().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn patches(&self) -> Vec<(String, String, String)> {
        self.patches.lock().clone()
    }
}

/// Deliver the scripted items once, then stay open without further items
fn scripted<K: Send + 'static>(items: Option<Vec<WatchItem<K>>>) -> WatchStream<K> {
    futures::stream::iter(items.unwrap_or_default().into_iter().map(Ok))
        .chain(futures::stream::pending())
        .boxed()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn read_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .claims
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn read_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes.lock().get(name).cloned())
    }

    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        self.created.lock().push(volume.clone());
        self.add_volume(volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.deleted.lock().push(name.to_string());
        self.volumes.lock().remove(name);
        Ok(())
    }

    async fn annotate_volume(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.patches
            .lock()
            .push((name.to_string(), key.to_string(), value.to_string()));
        if let Some(volume) = self.volumes.lock().get_mut(name) {
            volume
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn watch_claims(&self) -> Result<WatchStream<PersistentVolumeClaim>> {
        let failing = self
            .claim_watch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "watch connection closed",
            )));
        }
        Ok(scripted(self.claim_watch.lock().take()))
    }

    async fn watch_volumes(&self) -> Result<WatchStream<PersistentVolume>> {
        Ok(scripted(self.volume_watch.lock().take()))
    }

    async fn reset_session(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Recording Executor
// =============================================================================

#[derive(Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following command exit with status 1
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.commands.lock().push(command.to_string());
        if self.fail.load(Ordering::SeqCst) {
            Ok(CommandOutput {
                exit_status: 1,
                output: "cannot open dataset".into(),
            })
        } else {
            Ok(CommandOutput {
                exit_status: 0,
                output: String::new(),
            })
        }
    }

    fn host(&self) -> &str {
        NFS_HOST
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn shell_backend(class: &str, host: &str, executor: Arc<RecordingExecutor>) -> ZfsShellBackend {
    ZfsShellBackend::new(
        class,
        ZfsShellConfig {
            layout: ExportLayout::new(host, EXPORT_ROOT, DATASET_ROOT),
            become_root: false,
            quota_mode: QuotaMode::Quota,
            unix_mode: None,
        },
        executor,
    )
}

pub fn provider(
    class: &str,
    reclaim_policy: ReclaimPolicy,
    blocked: &[&str],
    executor: Arc<RecordingExecutor>,
) -> StorageProvider {
    StorageProvider {
        storage_class: class.to_string(),
        backend: Arc::new(shell_backend(class, NFS_HOST, executor)),
        reclaim_policy,
        pv_name_format: default_name_format(),
        blocked_annotations: blocked.iter().map(|k| k.to_string()).collect::<BTreeSet<_>>(),
    }
}

pub fn reconciler(
    cluster: Arc<FakeCluster>,
    providers: Vec<StorageProvider>,
    default_class: Option<&str>,
) -> Reconciler {
    let registry = StorageProviderRegistry::new(default_class.map(str::to_string), providers).unwrap();
    Reconciler::new(
        IDENTITY,
        Arc::new(registry),
        cluster,
        ControllerMetrics::unregistered().unwrap(),
    )
}

/// A pending claim asking this provisioner for storage
pub fn claim(
    namespace: &str,
    name: &str,
    class: Option<&str>,
    size: &str,
    annotations: &[(&str, &str)],
) -> PersistentVolumeClaim {
    let annotations: BTreeMap<&str, &str> = annotations.iter().copied().collect();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": format!("uid-{}-{}", namespace, name),
            "annotations": annotations,
        },
        "spec": {
            "accessModes": ["ReadWriteMany"],
            "storageClassName": class,
            "resources": { "requests": { "storage": size } },
        },
        "status": { "phase": "Pending" },
    }))
    .unwrap()
}

/// A claim bound to `volume_name`
pub fn bound_claim(namespace: &str, name: &str, volume_name: &str) -> PersistentVolumeClaim {
    serde_json::from_value(json!({
        "metadata": { "name": name, "namespace": namespace, "uid": "uid-source" },
        "spec": {
            "accessModes": ["ReadWriteMany"],
            "volumeName": volume_name,
            "resources": { "requests": { "storage": "1Gi" } },
        },
        "status": { "phase": "Bound" },
    }))
    .unwrap()
}

pub fn volume(name: &str, phase: &str, annotations: &[(&str, &str)]) -> PersistentVolume {
    let annotations: BTreeMap<&str, &str> = annotations.iter().copied().collect();
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolume",
        "metadata": { "name": name, "annotations": annotations },
        "spec": {
            "accessModes": ["ReadWriteMany"],
            "capacity": { "storage": "10Gi" },
            "storageClassName": "zfs-basic",
            "persistentVolumeReclaimPolicy": "Retain",
            "nfs": { "server": NFS_HOST, "path": "/mnt/tank/pv/x" },
        },
        "status": { "phase": phase },
    }))
    .unwrap()
}
