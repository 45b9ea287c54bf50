//! Proxy-core orchestration
//!
//! This module provides functionality for:
//! - Loading nodes from a Clash profile and building per-instance profiles
//! - Locating, starting and controlling proxy-core processes
//! - Pooling instances so many nodes can be tested side by side
//! - Probing IPv4 and IPv6 reachability through each node

pub mod catalog;
pub mod control;
pub mod discovery;
pub mod instance;
pub mod launcher;
pub mod models;
pub mod pool;
pub mod port;
pub mod probe;
pub mod profile;
pub mod runner;
pub mod sink;

pub use catalog::ProfileCatalog;
pub use control::{ControlPlane, HttpControl};
pub use discovery::locate_executable;
pub use instance::{LaunchSettings, ProxyInstance};
pub use launcher::{CoreLauncher, Launcher};
pub use models::{IpFamily, Node, ProbeResult};
pub use pool::{InstancePool, PoolLease, PoolStats};
pub use port::{PortAllocator, PortLease};
pub use probe::{HttpEcho, IpEcho, ProbeConfig};
pub use profile::{BaseProfile, InstanceProfile, ProfileBuilder};
pub use runner::ProbeRunner;
pub use sink::ResultSink;
