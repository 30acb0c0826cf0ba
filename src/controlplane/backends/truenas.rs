//! TrueNAS / FreeNAS v2.0 management API client
//!
//! Thin `reqwest` client for the dataset, snapshot, NFS share and permission
//! endpoints the REST backend needs.

use super::options::TRACKING_PROPERTY;
use super::zfs_rest::{CreateDataset, DatasetApi, DatasetInfo, DatasetQuota};
use crate::config::ManagementApiSettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const API_PREFIX: &str = "api/v2.0";

#[derive(Debug, Clone)]
enum Auth {
    None,
    ApiKey(String),
    Basic { user: String, password: String },
}

/// Client for one management endpoint
pub struct TrueNasClient {
    base_url: String,
    http: Client,
    auth: Auth,
}

impl TrueNasClient {
    pub fn new(endpoint_uri: &str, settings: &ManagementApiSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;

        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        let auth = match (
            non_empty(&settings.api_key),
            non_empty(&settings.client_id),
            non_empty(&settings.client_secret),
        ) {
            (Some(key), _, _) => Auth::ApiKey(key),
            (None, Some(user), Some(password)) => Auth::Basic { user, password },
            _ => Auth::None,
        };

        Ok(Self {
            base_url: endpoint_uri.trim_end_matches('/').to_string(),
            http,
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, API_PREFIX, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::ApiKey(key) => request.bearer_auth(key),
            Auth::Basic { user, password } => request.basic_auth(user, Some(password)),
        }
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        check_status(operation, response).await
    }

    async fn send_json(&self, operation: &str, request: RequestBuilder) -> Result<Value> {
        let response = self.send(operation, request).await?;
        Ok(response.json::<Value>().await?)
    }
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::ManagementApiStatus {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn id_path(collection: &str, id: &str) -> String {
    format!("{}/id/{}", collection, urlencoding::encode(id))
}

/// Paths exported by one NFS share entry (old `paths` and new `path` forms)
fn share_paths(share: &Value) -> Vec<&str> {
    let mut paths: Vec<&str> = share
        .get("paths")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if let Some(path) = share.get("path").and_then(Value::as_str) {
        paths.push(path);
    }
    paths
}

#[async_trait]
impl DatasetApi for TrueNasClient {
    async fn create_dataset(&self, request: &CreateDataset) -> Result<DatasetInfo> {
        let value = self
            .send_json(
                "create dataset",
                self.http.post(self.url("pool/dataset")).json(&request.to_body()),
            )
            .await?;
        Ok(DatasetInfo::from_value(&value))
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<DatasetInfo>> {
        let request = self.authorize(self.http.get(self.url(&id_path("pool/dataset", id))));
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status("get dataset", response).await?;
        let value: Value = response.json().await?;
        Ok(Some(DatasetInfo::from_value(&value)))
    }

    async fn update_quota(&self, id: &str, quota: &DatasetQuota) -> Result<()> {
        self.send(
            "update dataset",
            self.http
                .put(self.url(&id_path("pool/dataset", id)))
                .json(&quota.to_body()),
        )
        .await?;
        Ok(())
    }

    async fn delete_dataset(&self, id: &str) -> Result<()> {
        self.send(
            "delete dataset",
            self.http.delete(self.url(&id_path("pool/dataset", id))),
        )
        .await?;
        Ok(())
    }

    async fn create_snapshot(&self, dataset: &str, name: &str, pv_ref: &str) -> Result<String> {
        let mut properties = serde_json::Map::new();
        properties.insert(TRACKING_PROPERTY.to_string(), json!(pv_ref));
        let body = json!({ "dataset": dataset, "name": name, "properties": properties });
        let value = self
            .send_json("create snapshot", self.http.post(self.url("zfs/snapshot")).json(&body))
            .await?;
        Ok(value
            .get("id")
            .or_else(|| value.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}@{}", dataset, name)))
    }

    async fn clone_snapshot(&self, snapshot: &str, dataset: &str) -> Result<()> {
        let body = json!({ "snapshot": snapshot, "dataset_dst": dataset });
        self.send(
            "clone snapshot",
            self.http.post(self.url("zfs/snapshot/clone")).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.send(
            "delete snapshot",
            self.http.delete(self.url(&id_path("zfs/snapshot", id))),
        )
        .await?;
        Ok(())
    }

    async fn create_nfs_share(&self, path: &str, read_only: bool, comment: &str) -> Result<()> {
        let body = json!({ "paths": [path], "ro": read_only, "comment": comment });
        self.send("create NFS share", self.http.post(self.url("sharing/nfs")).json(&body))
            .await?;
        Ok(())
    }

    async fn find_nfs_shares(&self, path: &str) -> Result<Vec<i64>> {
        let value = self
            .send_json("list NFS shares", self.http.get(self.url("sharing/nfs")))
            .await?;
        let ids: Vec<i64> = value
            .as_array()
            .map(|shares| {
                shares
                    .iter()
                    .filter(|share| share_paths(share).contains(&path))
                    .filter_map(|share| share.get("id").and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default();
        debug!("NFS shares for {}: {:?}", path, ids);
        Ok(ids)
    }

    async fn delete_nfs_share(&self, id: i64) -> Result<()> {
        self.send(
            "delete NFS share",
            self.http.delete(self.url(&format!("sharing/nfs/id/{}", id))),
        )
        .await?;
        Ok(())
    }

    async fn set_mode(&self, path: &str, mode: u32) -> Result<()> {
        let body = json!({ "path": path, "mode": format!("{:o}", mode) });
        self.send("set permissions", self.http.post(self.url("filesystem/setperm")).json(&body))
            .await?;
        Ok(())
    }
}
