//! Node and probe result models

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;

/// Emoji ranges commonly used to decorate node names (flags, pictographs)
static EMOJI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[\x{1F600}-\x{1F64F}\x{1F300}-\x{1F5FF}\x{1F680}-\x{1F6FF}\x{1F1E0}-\x{1F1FF}]+",
    )
    .expect("Invalid emoji regex")
});

/// Address family probed through a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::Ipv4 => write!(f, "ipv4"),
            IpFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// A proxy node as declared in the `proxies` list of a Clash profile
///
/// Only the name and port are interpreted. Everything else (server, type,
/// credentials, transport options) is carried verbatim into instance profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(deserialize_with = "port_number")]
    pub port: i64,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

impl Node {
    pub fn new(name: impl Into<String>, port: i64) -> Self {
        Self {
            name: name.into(),
            port,
            extra: serde_yaml::Mapping::new(),
        }
    }

    /// Attach a protocol-specific field
    pub fn with_field(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.extra
            .insert(serde_yaml::Value::String(key.to_string()), value.into());
        self
    }

    /// Subscription providers use entries with port 0 or 1 as info banners
    pub fn is_placeholder(&self) -> bool {
        self.port <= 1
    }

    /// Protocol declared by the `type` field, if any
    pub fn protocol(&self) -> Option<&str> {
        self.extra.get("type").and_then(|v| v.as_str())
    }

    pub fn display_name(&self) -> String {
        display_name(&self.name)
    }
}

/// Ports may be written as numbers or as quoted numbers
fn port_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(i64),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid port `{}`", text))),
    }
}

/// Strip decorative emoji from a node name for terminal output
pub fn display_name(name: &str) -> String {
    EMOJI_REGEX.replace_all(name, "").trim().to_string()
}

/// Outcome of probing one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub node: String,
    /// Public IPv4 address seen through the node, `None` on timeout
    pub ipv4: Option<String>,
    /// Public IPv6 address seen through the node, `None` on timeout
    pub ipv6: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn new(node: String, ipv4: Option<String>, ipv6: Option<String>) -> Self {
        Self {
            node,
            ipv4,
            ipv6,
            checked_at: Utc::now(),
        }
    }

    /// Result for a node whose test could not run at all
    pub fn unreachable(node: String) -> Self {
        Self::new(node, None, None)
    }

    pub fn address(&self, family: IpFamily) -> Option<&str> {
        match family {
            IpFamily::Ipv4 => self.ipv4.as_deref(),
            IpFamily::Ipv6 => self.ipv6.as_deref(),
        }
    }

    pub fn supports_ipv6(&self) -> bool {
        self.ipv6.is_some()
    }

    pub fn is_unreachable(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}
