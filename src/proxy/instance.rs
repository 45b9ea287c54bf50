//! A single running proxy-core process

use crate::error::{Error, Result};
use crate::proxy::control::{user_nodes, ControlPlane, HttpControl};
use crate::proxy::profile::InstanceProfile;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Default time a new process gets to answer its control plane
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 5;

/// Default interval between control plane liveness polls
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default timeout of a single control plane request
const DEFAULT_CONTROL_TIMEOUT_SECS: u64 = 5;

/// How proxy-core processes are started
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub control_timeout: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            control_timeout: Duration::from_secs(DEFAULT_CONTROL_TIMEOUT_SECS),
        }
    }
}

impl LaunchSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }
}

/// One proxy-core process plus its ports and control plane
///
/// The process is killed by [`ProxyInstance::stop`] or on drop. Dropping also
/// removes the instance profile and returns both ports to their allocator.
pub struct ProxyInstance {
    proxy_port: u16,
    control_port: u16,
    control: Box<dyn ControlPlane>,
    process: Mutex<Option<Child>>,
    _profile: Option<InstanceProfile>,
}

impl ProxyInstance {
    /// Spawn `executable -f <profile>` and wait until its controller answers
    pub async fn start(
        executable: &Path,
        profile: InstanceProfile,
        settings: &LaunchSettings,
    ) -> Result<Self> {
        let controller = format!("127.0.0.1:{}", profile.control_port());
        let control = HttpControl::new(&controller, settings.control_timeout)?;

        let child = Command::new(executable)
            .arg("-f")
            .arg(profile.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Launch {
                path: executable.to_path_buf(),
                source,
            })?;

        debug!(
            pid = child.id(),
            profile = %profile.path().display(),
            "spawned proxy core"
        );

        let instance = Self {
            proxy_port: profile.proxy_port(),
            control_port: profile.control_port(),
            control: Box::new(control),
            process: Mutex::new(Some(child)),
            _profile: Some(profile),
        };

        if let Err(e) = instance.wait_ready(settings).await {
            instance.stop();
            return Err(e);
        }

        info!(
            proxy_port = instance.proxy_port,
            control_port = instance.control_port,
            "proxy core started"
        );
        Ok(instance)
    }

    /// Wrap an already running endpoint pair that this instance does not own
    pub fn attach(proxy_port: u16, control_port: u16, control: Box<dyn ControlPlane>) -> Self {
        Self {
            proxy_port,
            control_port,
            control,
            process: Mutex::new(None),
            _profile: None,
        }
    }

    /// Poll the control plane until it answers, the deadline passes or the
    /// process exits
    async fn wait_ready(&self, settings: &LaunchSettings) -> Result<()> {
        let deadline = Instant::now() + settings.startup_timeout;

        loop {
            if self.control.ping().await.is_ok() {
                return Ok(());
            }
            if self.has_exited() || Instant::now() >= deadline {
                return Err(Error::Startup {
                    control_port: self.control_port,
                    timeout: settings.startup_timeout,
                });
            }
            sleep(settings.poll_interval).await;
        }
    }

    fn has_exited(&self) -> bool {
        match self.process.lock().as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Local SOCKS endpoint routed through the selected node
    pub fn data_plane_endpoint(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.proxy_port))
    }

    /// User nodes known to the core, without built-in entries
    pub async fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(user_nodes(self.control.global_members().await?))
    }

    /// Route all traffic through `node`
    ///
    /// With `reset_connections` every open connection is dropped afterwards,
    /// so nothing keeps flowing through the previously selected node.
    pub async fn select_route(&self, node: &str, reset_connections: bool) -> Result<()> {
        self.control.select(node).await?;
        if reset_connections {
            self.control.close_connections().await?;
        }
        Ok(())
    }

    /// Whether the owned process (if any) is still alive
    pub fn is_running(&self) -> bool {
        match self.process.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the process. Calling it again, or after the process died, is a no-op.
    pub fn stop(&self) {
        let Some(mut child) = self.process.lock().take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(control_port = self.control_port, %status, "proxy core already exited");
            return;
        }
        match child.start_kill() {
            Ok(()) => debug!(control_port = self.control_port, "proxy core stopped"),
            Err(e) => warn!(control_port = self.control_port, error = %e, "failed to kill proxy core"),
        }
    }
}

impl Drop for ProxyInstance {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("proxy_port", &self.proxy_port)
            .field("control_port", &self.control_port)
            .field("running", &self.process.lock().is_some())
            .finish()
    }
}
