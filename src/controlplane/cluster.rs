//! Kubernetes Cluster Adapter
//!
//! Implements the `ClusterApi` port on top of `kube`. The client lives behind
//! a lock so a notification loop can replace it after a failure.

use crate::domain::ports::{ClusterApi, WatchItem, WatchStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, info};

/// Server side watch timeout; must stay below the API server's 295s cap
const WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeCluster {
    client: RwLock<Client>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client: RwLock::new(client),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn client(&self) -> Client {
        self.client.read().clone()
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client())
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Open a watch from resource version "0" and flatten it into watch items
async fn open_watch<K>(api: Api<K>, kind: &'static str) -> Result<WatchStream<K>>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    let stream = api.watch(&params, "0").await?;
    debug!("Opened {} watch", kind);

    Ok(stream
        .map_err(Error::from)
        .try_filter_map(move |event| async move {
            match event {
                WatchEvent::Added(obj) => Ok(Some(WatchItem::Added(obj))),
                WatchEvent::Modified(obj) => Ok(Some(WatchItem::Modified(obj))),
                WatchEvent::Deleted(obj) => Ok(Some(WatchItem::Deleted(obj))),
                WatchEvent::Bookmark(_) => Ok(None),
                WatchEvent::Error(e) => Err(Error::WatchStream(format!(
                    "{} watch: {} ({})",
                    kind, e.message, e.code
                ))),
            }
        })
        .boxed())
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn read_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn read_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes().get_opt(name).await?)
    }

    async fn create_volume(&self, volume: PersistentVolume) -> Result<PersistentVolume> {
        Ok(self.volumes().create(&PostParams::default(), &volume).await?)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        match self.volumes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!("Volume {} already gone", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn annotate_volume(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { key: value }
            }
        });
        self.volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn watch_claims(&self) -> Result<WatchStream<PersistentVolumeClaim>> {
        open_watch(Api::all(self.client()), "claim").await
    }

    async fn watch_volumes(&self) -> Result<WatchStream<PersistentVolume>> {
        open_watch(self.volumes(), "volume").await
    }

    async fn reset_session(&self) -> Result<()> {
        let client = Client::try_default().await?;
        *self.client.write() = client;
        info!("Rebuilt Kubernetes client session");
        Ok(())
    }
}
