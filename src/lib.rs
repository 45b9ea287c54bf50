//! clash6test - IPv4/IPv6 reachability tester for Clash proxy nodes
//!
//! Every node of a Clash profile is routed through a pool of short-lived
//! proxy-core processes and probed against IPv4-only and IPv6-only echo
//! services. The proxy core does all the proxying; this crate manages the
//! processes, their ports and profiles, and collects the results.

pub mod error;
pub mod proxy;
pub mod tui;

pub use error::Error;
pub use proxy::*;

use std::time::Duration;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Default number of proxy-core instances run side by side
const DEFAULT_CAPACITY: usize = 10;

/// Default delay between launching consecutive node tests
const DEFAULT_STAGGER_MS: u64 = 200;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of live proxy-core instances
    pub capacity: usize,
    /// Delay between spawning consecutive node tests
    pub stagger: Duration,
    /// How instances are started
    pub launch: LaunchSettings,
    /// How each address family is probed
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            stagger: Duration::from_millis(DEFAULT_STAGGER_MS),
            launch: LaunchSettings::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_launch(mut self, launch: LaunchSettings) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }
}
