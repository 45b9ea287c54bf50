//! Proxy-core control plane (the external-controller HTTP API)

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Route group switched by this tool; global mode routes everything through it
const GLOBAL_GROUP: &str = "GLOBAL";

/// Entries of the GLOBAL group that are built into the core, not user nodes
const BUILTIN_NODES: &[&str] = &["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE"];

/// Operations the tool needs from a proxy core's control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Succeeds once the controller answers `GET /`
    async fn ping(&self) -> Result<()>;

    /// Names in the GLOBAL group, built-in entries included
    async fn global_members(&self) -> Result<Vec<String>>;

    /// Make `node` the active member of the GLOBAL group
    async fn select(&self, node: &str) -> Result<()>;

    /// Drop every open connection
    async fn close_connections(&self) -> Result<()>;
}

#[derive(Deserialize)]
struct ProxyGroup {
    all: Vec<String>,
}

/// Control plane client over HTTP
#[derive(Debug, Clone)]
pub struct HttpControl {
    client: Client,
    base_url: String,
}

impl HttpControl {
    pub fn new(controller: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::control("client setup", e))?;

        Ok(Self {
            client,
            base_url: format!("http://{}", controller),
        })
    }

    pub fn url(&self, path: &str) -> String {
        let mut url = self.base_url.clone();
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        url
    }
}

#[async_trait]
impl ControlPlane for HttpControl {
    async fn ping(&self) -> Result<()> {
        self.client
            .get(self.url("/"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::control("ping", e))?;
        Ok(())
    }

    async fn global_members(&self) -> Result<Vec<String>> {
        let group: ProxyGroup = self
            .client
            .get(self.url(&format!("proxies/{}", GLOBAL_GROUP)))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::control("list nodes", e))?
            .json()
            .await
            .map_err(|e| Error::control("list nodes", e))?;
        Ok(group.all)
    }

    async fn select(&self, node: &str) -> Result<()> {
        debug!(node, base = %self.base_url, "selecting route");
        self.client
            .put(self.url(&format!("proxies/{}", GLOBAL_GROUP)))
            .json(&serde_json::json!({ "name": node }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::control("select route", e))?;
        Ok(())
    }

    async fn close_connections(&self) -> Result<()> {
        self.client
            .delete(self.url("connections"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::control("close connections", e))?;
        Ok(())
    }
}

/// Remove built-in pseudo nodes from a GLOBAL member list
pub fn user_nodes(members: Vec<String>) -> Vec<String> {
    members
        .into_iter()
        .filter(|name| !BUILTIN_NODES.contains(&name.as_str()))
        .collect()
}
