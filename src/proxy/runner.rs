//! Per-node probe orchestration

use crate::proxy::models::{IpFamily, ProbeResult};
use crate::proxy::pool::InstancePool;
use crate::proxy::probe::IpEcho;
use crate::proxy::sink::ResultSink;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Tests nodes through pooled proxy-core instances
#[derive(Clone)]
pub struct ProbeRunner {
    pool: Arc<InstancePool>,
    echo: Arc<dyn IpEcho>,
    stagger: Duration,
}

impl ProbeRunner {
    pub fn new(pool: Arc<InstancePool>, echo: impl IpEcho + 'static) -> Self {
        Self {
            pool,
            echo: Arc::new(echo),
            stagger: Duration::ZERO,
        }
    }

    /// Delay between launching consecutive node tests, so a large node
    /// list does not spawn every instance at the same moment
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    /// Route an instance through `node` and probe both address families
    ///
    /// Never fails: a node that cannot be routed is reported with both
    /// addresses absent. The instance goes back to the pool on every path.
    pub async fn test_node(&self, node: &str) -> ProbeResult {
        let lease = match self.pool.acquire(node).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(node, error = %e, "no instance for node");
                return ProbeResult::unreachable(node.to_string());
            }
        };

        if let Err(e) = lease.select_route(node, true).await {
            warn!(node, error = %e, "failed to select node");
            return ProbeResult::unreachable(node.to_string());
        }

        let endpoint = lease.data_plane_endpoint();
        let (ipv4, ipv6) = futures::future::join(
            self.echo.fetch(IpFamily::Ipv4, endpoint),
            self.echo.fetch(IpFamily::Ipv6, endpoint),
        )
        .await;
        lease.release();

        info!(node, ipv4 = ?ipv4, ipv6 = ?ipv6, "node tested");
        ProbeResult::new(node.to_string(), ipv4, ipv6)
    }

    /// Test every node concurrently, streaming results in completion order
    ///
    /// The channel closes once every node has a result.
    pub fn run_stream(&self, nodes: Vec<String>) -> mpsc::UnboundedReceiver<ProbeResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = self.clone();

        tokio::spawn(async move {
            let mut tasks = FuturesUnordered::new();

            for (index, node) in nodes.into_iter().enumerate() {
                if index > 0 && !runner.stagger.is_zero() {
                    tokio::time::sleep(runner.stagger).await;
                }

                let task_runner = runner.clone();
                let tx = tx.clone();
                tasks.push(tokio::spawn(async move {
                    let result = task_runner.test_node(&node).await;
                    if tx.send(result).is_err() {
                        debug!(node, "result receiver gone");
                    }
                }));
            }
            drop(tx);

            while let Some(joined) = tasks.next().await {
                if let Err(e) = joined {
                    error!(error = %e, "node test task failed");
                }
            }
        });

        rx
    }

    /// Test every node and return results in submission order
    pub async fn run(&self, nodes: Vec<String>) -> Vec<ProbeResult> {
        let mut sink = ResultSink::new(nodes.clone());
        let mut rx = self.run_stream(nodes);
        let mut results = Vec::with_capacity(sink.total());

        while let Some(result) = rx.recv().await {
            sink.push(result);
            results.extend(sink.drain_ready());
        }

        if !sink.is_complete() {
            warn!(missing = sink.pending().len(), "some nodes produced no result");
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::proxy::control::ControlPlane;
    use crate::proxy::instance::ProxyInstance;
    use crate::proxy::launcher::Launcher;
    use crate::proxy::profile::ProfileBuilder;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

    const DEFAULT_V4: &str = "198.51.100.1";
    const DEFAULT_V6: &str = "2001:db8::1";

    /// Shared record of what every fake instance was asked to do
    #[derive(Default)]
    struct World {
        /// (proxy port, event)
        events: Mutex<Vec<(u16, String)>>,
        fail_select: HashSet<String>,
        answers: HashMap<String, (Option<String>, Option<String>)>,
        launches: AtomicUsize,
    }

    impl World {
        fn selections(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .filter_map(|(_, e)| e.strip_prefix("select ").map(String::from))
                .collect()
        }
    }

    struct ScriptedControl {
        port: u16,
        world: Arc<World>,
    }

    #[async_trait]
    impl ControlPlane for ScriptedControl {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn global_members(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn select(&self, node: &str) -> Result<()> {
            if self.world.fail_select.contains(node) {
                return Err(Error::control("select route", "HTTP status server error (500)"));
            }
            self.world
                .events
                .lock()
                .push((self.port, format!("select {}", node)));
            Ok(())
        }

        async fn close_connections(&self) -> Result<()> {
            self.world.events.lock().push((self.port, "reset".to_string()));
            Ok(())
        }
    }

    struct FakeLauncher {
        world: Arc<World>,
        next_port: AtomicU16,
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self) -> Result<ProxyInstance> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.world.launches.fetch_add(1, Ordering::SeqCst);
            let port = self.next_port.fetch_add(2, Ordering::SeqCst);
            Ok(ProxyInstance::attach(
                port,
                port + 1,
                Box::new(ScriptedControl {
                    port,
                    world: Arc::clone(&self.world),
                }),
            ))
        }
    }

    /// Answers with the configured addresses of whichever node the instance
    /// behind `proxy` last selected; a probe issued before the connection
    /// reset gets nothing
    struct FakeEcho {
        world: Arc<World>,
    }

    #[async_trait]
    impl IpEcho for FakeEcho {
        async fn fetch(&self, family: IpFamily, proxy: SocketAddr) -> Option<String> {
            tokio::time::sleep(Duration::from_millis(2)).await;

            let (node, reset) = {
                let events = self.world.events.lock();
                let mine: Vec<&String> = events
                    .iter()
                    .filter(|(port, _)| *port == proxy.port())
                    .map(|(_, e)| e)
                    .collect();
                let last_select = mine.iter().rposition(|e| e.starts_with("select "))?;
                let node = mine[last_select].trim_start_matches("select ").to_string();
                let reset = mine[last_select..].iter().any(|e| *e == "reset");
                (node, reset)
            };
            if !reset {
                return None;
            }

            let (v4, v6) = self
                .world
                .answers
                .get(&node)
                .cloned()
                .unwrap_or((Some(DEFAULT_V4.to_string()), Some(DEFAULT_V6.to_string())));
            match family {
                IpFamily::Ipv4 => v4,
                IpFamily::Ipv6 => v6,
            }
        }
    }

    fn runner(world: World, capacity: usize) -> (ProbeRunner, Arc<World>) {
        let world = Arc::new(world);
        let launcher = FakeLauncher {
            world: Arc::clone(&world),
            next_port: AtomicU16::new(30000),
        };
        let pool = InstancePool::new(launcher, capacity).with_poll_interval(Duration::from_millis(10));
        let echo = FakeEcho {
            world: Arc::clone(&world),
        };
        let runner = ProbeRunner::new(Arc::new(pool), echo).with_stagger(Duration::from_millis(1));
        (runner, world)
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_placeholder_nodes_never_tested() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("profile.yml");
        std::fs::write(
            &source,
            r#"
proxies:
  - { name: "Traffic left: 10GB", type: ss, server: info.example.com, port: 0 }
  - { name: "HK", type: ss, server: hk.example.com, port: 8388 }
  - { name: "JP", type: ss, server: jp.example.com, port: 8388 }
  - { name: "US", type: ss, server: us.example.com, port: 8388 }
"#,
        )
        .unwrap();
        let nodes = ProfileBuilder::from_source(&source).unwrap().node_names();

        let (runner, world) = runner(World::default(), 4);
        let results = runner.run(nodes).await;

        assert_eq!(results.len(), 3);
        let mut selected = world.selections();
        selected.sort();
        assert_eq!(selected, vec!["HK", "JP", "US"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_bounded_by_capacity() {
        let (runner, world) = runner(World::default(), 2);
        let results = runner.run(names(5)).await;

        assert_eq!(results.len(), 5);
        assert!(world.launches.load(Ordering::SeqCst) <= 2);
        assert!(runner.pool().stats().live <= 2);
        assert_eq!(runner.pool().stats().busy, 0);
    }

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let (runner, _) = runner(World::default(), 3);
        let nodes = names(6);
        let results = runner.run(nodes.clone()).await;

        let order: Vec<String> = results.into_iter().map(|r| r.node).collect();
        assert_eq!(order, nodes);
    }

    #[tokio::test]
    async fn test_repeated_node_names_all_reported() {
        let (runner, _) = runner(World::default(), 2);
        let nodes = vec!["a".to_string(), "a".to_string(), "b".to_string()];
        let results = runner.run(nodes.clone()).await;

        let order: Vec<String> = results.into_iter().map(|r| r.node).collect();
        assert_eq!(order, nodes);
    }

    #[tokio::test]
    async fn test_failed_selection_isolated_to_node() {
        let world = World {
            fail_select: HashSet::from(["node-1".to_string()]),
            ..World::default()
        };
        let (runner, _) = runner(world, 2);
        let results = runner.run(names(4)).await;

        assert_eq!(results.len(), 4);
        for result in &results {
            if result.node == "node-1" {
                assert!(result.is_unreachable());
            } else {
                assert_eq!(result.ipv4.as_deref(), Some(DEFAULT_V4));
                assert_eq!(result.ipv6.as_deref(), Some(DEFAULT_V6));
            }
        }
        assert_eq!(runner.pool().stats().busy, 0);
    }

    #[tokio::test]
    async fn test_ipv6_timeout_recorded_as_absent() {
        let world = World {
            answers: HashMap::from([(
                "v4-only".to_string(),
                (Some("203.0.113.5".to_string()), None),
            )]),
            ..World::default()
        };
        let (runner, _) = runner(world, 1);

        let result = runner.test_node("v4-only").await;
        assert_eq!(result.node, "v4-only");
        assert_eq!(result.ipv4.as_deref(), Some("203.0.113.5"));
        assert_eq!(result.ipv6, None);
    }

    #[tokio::test]
    async fn test_every_probe_follows_connection_reset() {
        let (runner, world) = runner(World::default(), 2);
        let results = runner.run(names(6)).await;

        // FakeEcho answers nothing when no reset followed the last selection
        assert!(results.iter().all(|r| r.ipv4.is_some() && r.ipv6.is_some()));
        let resets = world
            .events
            .lock()
            .iter()
            .filter(|(_, e)| e == "reset")
            .count();
        assert_eq!(resets, 6);
    }

    #[tokio::test]
    async fn test_closed_pool_yields_unreachable() {
        let (runner, _) = runner(World::default(), 1);
        runner.pool().shutdown_all();

        let result = runner.test_node("node-0").await;
        assert!(result.is_unreachable());
    }
}
