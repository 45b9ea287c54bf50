//! Bounded pool of proxy-core instances
//!
//! Instances are created lazily inside [`InstancePool::acquire`] and never
//! ahead of demand. Each slot is either idle or busy serving one node; a busy
//! slot is never handed out again until its [`PoolLease`] is released.

use crate::error::{Error, Result};
use crate::proxy::instance::ProxyInstance;
use crate::proxy::launcher::Launcher;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default upper bound on a wait for a released instance before re-scanning
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Occupant tag used while listing nodes through a pooled instance
const LIST_NODES_TAG: &str = "<list-nodes>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    /// Serving the named node
    Busy(String),
}

struct Slot {
    instance: Arc<ProxyInstance>,
    state: SlotState,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    /// Instances being launched; they count against capacity
    starting: usize,
    closed: bool,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub busy: usize,
    pub starting: usize,
}

enum Claim {
    Ready(usize, Arc<ProxyInstance>),
    Grow,
    Wait,
}

/// Bounded, lazily grown set of proxy-core instances
pub struct InstancePool {
    launcher: Box<dyn Launcher>,
    capacity: usize,
    poll_interval: Duration,
    state: Mutex<PoolState>,
    released: Notify,
}

impl InstancePool {
    /// Create an empty pool that will hold at most `capacity` instances
    pub fn new(launcher: impl Launcher + 'static, capacity: usize) -> Self {
        Self {
            launcher: Box::new(launcher),
            capacity: capacity.max(1),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get an idle instance for `node`, starting one if capacity allows,
    /// otherwise wait for a release
    pub async fn acquire(&self, node: &str) -> Result<PoolLease<'_>> {
        loop {
            // Registered before the scan so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim(node)? {
                Claim::Ready(index, instance) => {
                    debug!(node, index, "reusing idle instance");
                    return Ok(PoolLease {
                        pool: self,
                        index,
                        instance,
                    });
                }
                Claim::Grow => return self.grow(node).await,
                Claim::Wait => {
                    debug!(node, "all instances busy, waiting");
                    let _ = timeout(self.poll_interval, notified).await;
                }
            }
        }
    }

    /// Scan for an idle slot or reserve room for a new one, in one critical
    /// section
    fn claim(&self, node: &str) -> Result<Claim> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        if let Some((index, slot)) = state
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.state == SlotState::Idle)
        {
            slot.state = SlotState::Busy(node.to_string());
            return Ok(Claim::Ready(index, Arc::clone(&slot.instance)));
        }

        if state.slots.len() + state.starting < self.capacity {
            state.starting += 1;
            return Ok(Claim::Grow);
        }

        Ok(Claim::Wait)
    }

    /// Launch a new instance into a slot already reserved by `claim`
    async fn grow(&self, node: &str) -> Result<PoolLease<'_>> {
        let reservation = Reservation { pool: self };
        let instance = self.launcher.launch().await;

        let instance = match instance {
            Ok(instance) => Arc::new(instance),
            Err(e) => {
                warn!(node, error = %e, "failed to start proxy core instance");
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            instance.stop();
            return Err(Error::PoolClosed);
        }

        state.starting -= 1;
        std::mem::forget(reservation);
        state.slots.push(Slot {
            instance: Arc::clone(&instance),
            state: SlotState::Busy(node.to_string()),
        });
        let index = state.slots.len() - 1;
        info!(
            index,
            live = state.slots.len(),
            capacity = self.capacity,
            "added proxy core instance to pool"
        );

        Ok(PoolLease {
            pool: self,
            index,
            instance,
        })
    }

    /// Hand an instance back; same as dropping the lease
    pub fn release(&self, lease: PoolLease<'_>) {
        debug_assert!(std::ptr::eq(lease.pool, self));
        drop(lease);
    }

    fn release_slot(&self, index: usize) {
        if let Some(slot) = self.state.lock().slots.get_mut(index) {
            slot.state = SlotState::Idle;
        }
        self.released.notify_waiters();
    }

    /// Nodes known to the proxy core, listed through any available instance
    pub async fn list_nodes(&self) -> Result<Vec<String>> {
        let lease = self.acquire(LIST_NODES_TAG).await?;
        lease.list_nodes().await
    }

    /// Stop every instance and refuse further acquires
    pub fn shutdown_all(&self) {
        let slots = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.slots)
        };

        for slot in &slots {
            slot.instance.stop();
        }
        self.released.notify_waiters();
        info!(count = slots.len(), "instance pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.capacity,
            live: state.slots.len(),
            busy: state
                .slots
                .iter()
                .filter(|slot| slot.state != SlotState::Idle)
                .count(),
            starting: state.starting,
        }
    }

    /// Nodes currently being served, one per busy instance
    pub fn busy_nodes(&self) -> Vec<String> {
        self.state
            .lock()
            .slots
            .iter()
            .filter_map(|slot| match &slot.state {
                SlotState::Busy(node) => Some(node.clone()),
                SlotState::Idle => None,
            })
            .collect()
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Gives a reserved-but-never-filled slot back if a launch fails or is
/// abandoned
struct Reservation<'a> {
    pool: &'a InstancePool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pool.state.lock().starting -= 1;
        self.pool.released.notify_waiters();
    }
}

/// Exclusive use of one pooled instance; released on drop
pub struct PoolLease<'a> {
    pool: &'a InstancePool,
    index: usize,
    instance: Arc<ProxyInstance>,
}

impl PoolLease<'_> {
    /// Slot index of the leased instance
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn release(self) {}
}

impl Deref for PoolLease<'_> {
    type Target = ProxyInstance;

    fn deref(&self) -> &ProxyInstance {
        &self.instance
    }
}

impl Drop for PoolLease<'_> {
    fn drop(&mut self) {
        self.pool.release_slot(self.index);
    }
}

impl std::fmt::Debug for PoolLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("index", &self.index)
            .field("instance", &self.instance)
            .finish()
    }
}
