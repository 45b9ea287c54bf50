//! Instance profile building
//!
//! A user's Clash profile is reduced to its node list, merged into a fixed
//! base policy and written out once per instance with that instance's ports.

use crate::error::{Error, Result};
use crate::proxy::models::Node;
use crate::proxy::port::PortLease;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, warn};

/// Route mode of the proxy core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    #[default]
    Global,
    Rule,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DnsSettings {
    pub enable: bool,
}

/// Policy fields shared by every instance profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BaseProfile {
    pub allow_lan: bool,
    pub mode: RouteMode,
    pub log_level: LogLevel,
    pub ipv6: bool,
    pub dns: DnsSettings,
}

impl Default for BaseProfile {
    fn default() -> Self {
        Self {
            allow_lan: false,
            mode: RouteMode::Global,
            log_level: LogLevel::Warning,
            ipv6: true,
            dns: DnsSettings { enable: false },
        }
    }
}

/// Layout of the file handed to the proxy core with `-f`
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct InstanceConfig<'a> {
    mixed_port: u16,
    external_controller: String,
    #[serde(flatten)]
    base: &'a BaseProfile,
    proxies: &'a [Node],
}

/// The part of a user profile this tool reads
#[derive(Deserialize)]
struct SourceProfile {
    #[serde(default)]
    proxies: Vec<serde_yaml::Value>,
}

/// A profile written for one instance, removed from disk on drop
#[derive(Debug)]
pub struct InstanceProfile {
    path: TempPath,
    proxy_port: PortLease,
    control_port: PortLease,
}

impl InstanceProfile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Port of the mixed (HTTP + SOCKS) listener
    pub fn proxy_port(&self) -> u16 {
        self.proxy_port.port()
    }

    pub fn control_port(&self) -> u16 {
        self.control_port.port()
    }
}

/// Builds per-instance profiles from a base policy and a node list
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    base: BaseProfile,
    nodes: Vec<Node>,
    dir: Option<PathBuf>,
}

impl ProfileBuilder {
    /// Load nodes from a Clash profile on disk
    pub fn from_source<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| Error::ProfileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let nodes = parse_nodes(&content).map_err(|source| Error::ProfileParse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), count = nodes.len(), "loaded node list");
        Ok(Self::from_nodes(nodes))
    }

    /// Keep usable nodes: placeholders and repeated names are dropped
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let mut seen = HashSet::new();
        let nodes = nodes
            .into_iter()
            .filter(|node| {
                if node.is_placeholder() {
                    debug!(node = %node.name, port = node.port, "skipping placeholder node");
                    return false;
                }
                if !seen.insert(node.name.clone()) {
                    warn!(node = %node.name, "skipping node with duplicate name");
                    return false;
                }
                true
            })
            .collect();

        Self {
            base: BaseProfile::default(),
            nodes,
            dir: None,
        }
    }

    pub fn with_base(mut self, base: BaseProfile) -> Self {
        self.base = base;
        self
    }

    /// Write profiles into `dir` instead of the system temp directory
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Write a profile bound to the two leased ports
    pub fn build(&self, proxy_port: PortLease, control_port: PortLease) -> Result<InstanceProfile> {
        let config = InstanceConfig {
            mixed_port: proxy_port.port(),
            external_controller: format!("127.0.0.1:{}", control_port.port()),
            base: &self.base,
            proxies: &self.nodes,
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("clash6test-").suffix(".yml");
        let mut file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| Error::ProfileWrite(e.to_string()))?;

        serde_yaml::to_writer(&mut file, &config).map_err(|e| Error::ProfileWrite(e.to_string()))?;

        let path = file.into_temp_path();
        debug!(
            path = %path.display(),
            proxy_port = proxy_port.port(),
            control_port = control_port.port(),
            "wrote instance profile"
        );

        Ok(InstanceProfile {
            path,
            proxy_port,
            control_port,
        })
    }
}

/// Parse the `proxies` list of a Clash profile
///
/// Entries that are not valid node definitions are skipped with a warning;
/// placeholders are kept here and dropped by [`ProfileBuilder::from_nodes`].
pub fn parse_nodes(content: &str) -> std::result::Result<Vec<Node>, serde_yaml::Error> {
    let source: SourceProfile = serde_yaml::from_str(content)?;

    let nodes = source
        .proxies
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_yaml::from_value::<Node>(value) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(index, error = %e, "skipping malformed proxy entry");
                None
            }
        })
        .collect();

    Ok(nodes)
}
