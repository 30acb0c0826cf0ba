//! ZFS over SSH Storage Backend
//!
//! Creates one ZFS filesystem per volume by running `zfs` on the storage
//! host, optionally cloning it from a fresh snapshot of another volume's
//! dataset. Every interpolated value is shell quoted and dataset names are
//! always derived from a parsed UUID.

use super::layout::{self, ExportLayout};
use super::options::{DatasetOptions, QuotaMode, TRACKING_PROPERTY};
use super::transport::shell_quote;
use crate::domain::annotations::{AnnotationSet, CLONE_REF, CLONE_SNAPSHOT, PV_REF};
use crate::domain::ports::{
    CommandOutput, RemoteExecutorRef, StorageBackend, VolumeDescriptor,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the shell backend
#[derive(Debug, Clone)]
pub struct ZfsShellConfig {
    pub layout: ExportLayout,
    /// Prefix privileged commands with `sudo`
    pub become_root: bool,
    pub quota_mode: QuotaMode,
    /// Permission bits applied to the export path after creation
    pub unix_mode: Option<u32>,
}

// =============================================================================
// ZFS Shell Backend
// =============================================================================

pub struct ZfsShellBackend {
    name: String,
    config: ZfsShellConfig,
    executor: RemoteExecutorRef,
}

impl ZfsShellBackend {
    pub fn new(name: impl Into<String>, config: ZfsShellConfig, executor: RemoteExecutorRef) -> Self {
        Self {
            name: name.into(),
            config,
            executor,
        }
    }

    fn sudo(&self) -> &'static str {
        if self.config.become_root {
            "sudo "
        } else {
            ""
        }
    }

    fn property_args(properties: &[(&str, String)]) -> String {
        properties
            .iter()
            .map(|(name, value)| format!(" -o {}", shell_quote(&format!("{}={}", name, value))))
            .collect()
    }

    /// Tracking property, quota properties, then tuning options
    fn dataset_properties(
        &self,
        pv_ref: &str,
        size_bytes: u64,
        options: &DatasetOptions,
    ) -> Vec<(&'static str, String)> {
        let mut properties = vec![(TRACKING_PROPERTY, pv_ref.to_string())];
        properties.extend(
            self.config
                .quota_mode
                .properties(size_bytes)
                .into_iter()
                .map(|(name, value)| (name, value.to_string())),
        );
        properties.extend(options.properties());
        properties
    }

    /// `zfs create` for a fresh dataset
    pub fn create_command(
        &self,
        dataset: &str,
        pv_ref: &str,
        size_bytes: u64,
        options: &DatasetOptions,
    ) -> String {
        let properties = self.dataset_properties(pv_ref, size_bytes, options);
        format!(
            "{}zfs create{} {}",
            self.sudo(),
            Self::property_args(&properties),
            shell_quote(dataset)
        )
    }

    /// `zfs snapshot` of a clone source, tagged with the target volume
    pub fn snapshot_command(&self, snapshot: &str, pv_ref: &str) -> String {
        format!(
            "{}zfs snapshot{} {}",
            self.sudo(),
            Self::property_args(&[(TRACKING_PROPERTY, pv_ref.to_string())]),
            shell_quote(snapshot)
        )
    }

    /// `zfs clone` from a snapshot into a new dataset
    pub fn clone_command(
        &self,
        snapshot: &str,
        dataset: &str,
        pv_ref: &str,
        size_bytes: u64,
        options: &DatasetOptions,
    ) -> String {
        let mut options = options.clone();
        if options.casesensitivity.take().is_some() {
            debug!("Dropping casesensitivity for clone {}, it can only be set at creation", dataset);
        }
        let properties = self.dataset_properties(pv_ref, size_bytes, &options);
        format!(
            "{}zfs clone{} {} {}",
            self.sudo(),
            Self::property_args(&properties),
            shell_quote(snapshot),
            shell_quote(dataset)
        )
    }

    pub fn chmod_command(&self, export_path: &str, mode: u32) -> String {
        format!("{}chmod {:04o} {}", self.sudo(), mode, shell_quote(export_path))
    }

    pub fn destroy_command(&self, target: &str) -> String {
        format!("{}zfs destroy {}", self.sudo(), shell_quote(target))
    }

    /// Run a command, turning a non-zero exit into an error
    async fn run(&self, command: String) -> Result<CommandOutput> {
        let output = self.executor.exec(&command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::RemoteCommand {
                command,
                status: output.exit_status,
                output: output.output.trim().to_string(),
            })
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

        // Validate the clone source before touching the remote host
        let clone_source = match annotations.get(CLONE_REF) {
            Some(clone_ref) => Some(self.config.layout.parse_clone_ref(clone_ref)?),
            None => None,
        };

        let placement = &self.config.layout;
        let dataset = placement.dataset_path(&uuid);
        let export_path = placement.export_path(&uuid);
        placement.write_annotations(annotations, &uuid);

        let options = DatasetOptions::from_annotations(annotations);

        match clone_source {
            Some(source) => {
                let snapshot = format!("{}@{}", source, layout::snapshot_name(&pv_ref, Utc::now()));
                self.run(self.snapshot_command(&snapshot, &pv_ref)).await?;
                annotations.insert(CLONE_SNAPSHOT.to_string(), snapshot.clone());

                let command = self.clone_command(&snapshot, &dataset, &pv_ref, size_bytes, &options);
                if let Err(e) = self.run(command).await {
                    error!("Clone of {} into {} failed, snapshot left behind: {}", snapshot, dataset, e);
                    return Err(e);
                }
                info!("Cloned {} from {} for {}", dataset, snapshot, pv_ref);
            }
            None => {
                self.run(self.create_command(&dataset, &pv_ref, size_bytes, &options))
                    .await?;
                info!("Created dataset {} ({} bytes) for {}", dataset, size_bytes, pv_ref);
            }
        }

        if let Some(mode) = self.config.unix_mode {
            self.run(self.chmod_command(&export_path, mode)).await?;
        }

        Ok(VolumeDescriptor {
            export_host: placement.nfs_host.clone(),
            export_path,
            read_only: false,
            assigned_name: pv_ref,
            reclaim_policy: None,
        })
    }

    /// Destroy one target, logging instead of failing
    async fn destroy_logged(&self, target: &str) {
        match self.run(self.destroy_command(target)).await {
            Ok(_) => info!("Destroyed {}", target),
            Err(e) => error!("Failed to destroy {} on {}: {}", target, self.executor.host(), e),
        }
    }
}

#[async_trait]
impl StorageBackend for ZfsShellBackend {
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
        let dataset = self.config.layout.dataset_path(&uuid);
        self.destroy_logged(&dataset).await;

        if let Some(snapshot) = annotations.get(CLONE_SNAPSHOT) {
            match self.config.layout.validate_snapshot(snapshot) {
                Some(snapshot) => self.destroy_logged(snapshot).await,
                None => warn!(
                    "Not destroying clone snapshot outside {}: {}",
                    self.config.layout.dataset_root, snapshot
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::annotations::{
        BLOCKSIZE, CASESENSITIVE, COMPRESSION, MOUNT_PROTOCOL, VOLUME_EXPORT, VOLUME_HOST,
        VOLUME_MODE, VOLUME_PATH, VOLUME_UUID,
    };
    use crate::domain::ports::RemoteExecutor;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    const U: &str = "0b5e8f8a-4f4b-4c55-9a31-9c1f3b2c7d10";
    const SRC: &str = "5d9d8c6e-1111-4222-8333-944455556666";

    /// Records commands and replays scripted exit statuses (default success)
    #[derive(Default)]
    struct ScriptedExecutor {
        commands: Mutex<Vec<String>>,
        statuses: Mutex<VecDeque<i32>>,
    }

    impl ScriptedExecutor {
        fn failing_at(statuses: &[i32]) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                statuses: Mutex::new(statuses.iter().copied().collect()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn exec(&self, command: &str) -> Result<CommandOutput> {
            self.commands.lock().push(command.to_string());
            let exit_status = self.statuses.lock().pop_front().unwrap_or(0);
            Ok(CommandOutput {
                exit_status,
                output: if exit_status == 0 { String::new() } else { "dataset is busy".into() },
            })
        }

        fn host(&self) -> &str {
            "nas01"
        }
    }

    fn config(quota_mode: QuotaMode, unix_mode: Option<u32>) -> ZfsShellConfig {
        ZfsShellConfig {
            layout: ExportLayout::new("nas01", "/mnt/tank/pv", "tank/pv"),
            become_root: false,
            quota_mode,
            unix_mode,
        }
    }

    fn backend(config: ZfsShellConfig, executor: Arc<ScriptedExecutor>) -> ZfsShellBackend {
        ZfsShellBackend::new("zfs-basic", config, executor)
    }

    fn working_set() -> AnnotationSet {
        [
            (VOLUME_UUID, U),
            (PV_REF, "zfs-basic-demo-data-0b5e8f8a"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn test_create_plain_dataset() {
        let exec = Arc::new(ScriptedExecutor::default());
        let backend = backend(config(QuotaMode::Both, Some(0o775)), exec.clone());
        let mut annotations = working_set();
        annotations.insert(COMPRESSION.into(), "lz4".into());
        annotations.insert(BLOCKSIZE.into(), "513".into());

        let descriptor = backend.create(&mut annotations, 1024).await.unwrap();

        assert_eq!(descriptor.export_host, "nas01");
        assert_eq!(descriptor.export_path, format!("/mnt/tank/pv/{}", U));
        assert_eq!(descriptor.assigned_name, "zfs-basic-demo-data-0b5e8f8a");
        assert_eq!(annotations.get(VOLUME_HOST).unwrap(), "nas01");
        assert_eq!(annotations.get(VOLUME_PATH).unwrap(), &format!("tank/pv/{}", U));
        assert_eq!(annotations.get(VOLUME_EXPORT).unwrap(), &format!("/mnt/tank/pv/{}", U));
        assert_eq!(annotations.get(MOUNT_PROTOCOL).unwrap(), "nfs");

        let commands = exec.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            format!(
                "zfs create -o 'zfspv:pvref=zfs-basic-demo-data-0b5e8f8a' -o 'quota=1024' \
                 -o 'reservation=1024' -o 'compression=lz4' 'tank/pv/{}'",
                U
            )
        );
        assert_eq!(commands[1], format!("chmod 0775 '/mnt/tank/pv/{}'", U));
    }

    #[tokio::test]
    async fn test_create_with_sudo_and_no_quota() {
        let exec = Arc::new(ScriptedExecutor::default());
        let mut cfg = config(QuotaMode::Ignore, None);
        cfg.become_root = true;
        let backend = backend(cfg, exec.clone());

        backend.create(&mut working_set(), 4096).await.unwrap();
        let commands = exec.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("sudo zfs create"));
        assert!(!commands[0].contains("quota="));
    }

    #[tokio::test]
    async fn test_create_clone_from_snapshot() {
        let exec = Arc::new(ScriptedExecutor::default());
        let backend = backend(config(QuotaMode::Quota, None), exec.clone());
        let mut annotations = working_set();
        annotations.insert(CLONE_REF.into(), format!("nas01:tank/pv/{}", SRC));
        annotations.insert(CASESENSITIVE.into(), "mixed".into());

        backend.create(&mut annotations, 2048).await.unwrap();

        let commands = exec.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("zfs snapshot -o 'zfspv:pvref=zfs-basic-demo-data-0b5e8f8a'"));
        assert!(commands[0].contains(&format!("'tank/pv/{}@zfspv-zfs-basic-demo-data-0b5e8f8a-", SRC)));
        assert!(commands[1].starts_with("zfs clone"));
        assert!(commands[1].contains("'quota=2048'"));
        assert!(!commands[1].contains("casesensitivity"));
        assert!(commands[1].ends_with(&format!("'tank/pv/{}'", U)));

        let snapshot = annotations.get(CLONE_SNAPSHOT).unwrap();
        assert!(snapshot.starts_with(&format!("tank/pv/{}@zfspv-", SRC)));
        assert!(commands[1].contains(&shell_quote(snapshot)));
    }

    #[tokio::test]
    async fn test_malformed_clone_ref_issues_no_commands() {
        for clone_ref in [
            format!("nas02:tank/pv/{}", SRC),
            format!("nas01:other/pv/{}", SRC),
            "nas01".to_string(),
            format!("nas01:tank/pv/{}:x", SRC),
        ] {
            let exec = Arc::new(ScriptedExecutor::default());
            let backend = backend(config(QuotaMode::Quota, None), exec.clone());
            let mut annotations = working_set();
            annotations.insert(CLONE_REF.into(), clone_ref);

            assert!(backend.create(&mut annotations, 1).await.is_none());
            assert!(exec.commands().is_empty());
        }
    }

    #[tokio::test]
    async fn test_clone_failure_declines() {
        let exec = Arc::new(ScriptedExecutor::failing_at(&[0, 1]));
        let backend = backend(config(QuotaMode::Quota, None), exec.clone());
        let mut annotations = working_set();
        annotations.insert(CLONE_REF.into(), format!("nas01:tank/pv/{}", SRC));

        assert!(backend.create(&mut annotations, 1).await.is_none());
        assert_eq!(exec.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_create_declines_block_mode_and_bad_uuid() {
        let exec = Arc::new(ScriptedExecutor::default());
        let backend = backend(config(QuotaMode::Quota, None), exec.clone());

        let mut annotations = working_set();
        annotations.insert(VOLUME_MODE.into(), "Block".into());
        assert!(backend.create(&mut annotations, 1).await.is_none());

        let mut annotations = working_set();
        annotations.insert(VOLUME_UUID.into(), "x; rm -rf /".into());
        assert!(backend.create(&mut annotations, 1).await.is_none());

        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let exec = Arc::new(ScriptedExecutor::failing_at(&[0, 1]));
        let backend = backend(config(QuotaMode::Quota, None), exec.clone());
        let annotations = working_set();

        backend.remove(&annotations).await.unwrap();
        // Second destroy fails remotely (already gone) but is not raised
        backend.remove(&annotations).await.unwrap();

        let expected = format!("zfs destroy 'tank/pv/{}'", U);
        assert_eq!(exec.commands(), vec![expected.clone(), expected]);
    }

    #[tokio::test]
    async fn test_remove_destroys_validated_snapshot() {
        let exec = Arc::new(ScriptedExecutor::default());
        let backend = backend(config(QuotaMode::Quota, None), exec.clone());

        let mut annotations = working_set();
        annotations.insert(CLONE_SNAPSHOT.into(), format!("tank/pv/{}@zfspv-x-1", SRC));
        backend.remove(&annotations).await.unwrap();
        assert_eq!(exec.commands().len(), 2);
        assert_eq!(exec.commands()[1], format!("zfs destroy 'tank/pv/{}@zfspv-x-1'", SRC));

        let exec = Arc::new(ScriptedExecutor::default());
        let backend = self::backend(config(QuotaMode::Quota, None), exec.clone());
        let mut annotations = working_set();
        annotations.insert(CLONE_SNAPSHOT.into(), "tank/pv".into());
        backend.remove(&annotations).await.unwrap();
        assert_eq!(exec.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_requires_uuid() {
        let exec = Arc::new(ScriptedExecutor::default());
        let backend = backend(config(QuotaMode::Quota, None), exec.clone());
        assert_matches!(
            backend.remove(&AnnotationSet::new()).await,
            Err(Error::MissingAnnotation { .. })
        );
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn test_is_local_dataset() {
        let backend = backend(config(QuotaMode::Quota, None), Arc::new(ScriptedExecutor::default()));
        assert!(backend.is_local_dataset("nas01", &format!("tank/pv/{}", SRC)));
        assert!(!backend.is_local_dataset("nas02", &format!("tank/pv/{}", SRC)));
    }
}
