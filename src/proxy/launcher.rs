//! Creating new proxy-core instances for the pool

use crate::error::Result;
use crate::proxy::instance::{LaunchSettings, ProxyInstance};
use crate::proxy::port::PortAllocator;
use crate::proxy::profile::ProfileBuilder;
use async_trait::async_trait;
use std::path::PathBuf;

/// Source of fresh, ready-to-use instances
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<ProxyInstance>;
}

/// Starts real proxy-core processes: allocate ports, write a profile, spawn
#[derive(Debug, Clone)]
pub struct CoreLauncher {
    executable: PathBuf,
    profiles: ProfileBuilder,
    ports: PortAllocator,
    settings: LaunchSettings,
}

impl CoreLauncher {
    pub fn new(executable: PathBuf, profiles: ProfileBuilder) -> Self {
        Self {
            executable,
            profiles,
            ports: PortAllocator::new(),
            settings: LaunchSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: LaunchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn profiles(&self) -> &ProfileBuilder {
        &self.profiles
    }
}

#[async_trait]
impl Launcher for CoreLauncher {
    async fn launch(&self) -> Result<ProxyInstance> {
        let proxy_port = self.ports.allocate()?;
        let control_port = self.ports.allocate()?;
        let profile = self.profiles.build(proxy_port, control_port)?;
        ProxyInstance::start(&self.executable, profile, &self.settings).await
    }
}
