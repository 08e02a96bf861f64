use crate::registry::pool::ConnectionPool;
use crate::utils::error::{ConnPoolError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;
use tracing::error;

static TICK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic tick counter, in microseconds from a process-lifetime epoch.
/// Every timing accumulator in the registry is expressed in these ticks.
pub(crate) fn now_ticks() -> u64 {
    let epoch = TICK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Health state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnState {
    Down,
    Ready,
    Active,
    Retry,
    Failed,
    Zombie,
}

impl ConnState {
    fn from_u8(raw: u8) -> ConnState {
        match raw {
            0 => ConnState::Down,
            1 => ConnState::Ready,
            2 => ConnState::Active,
            3 => ConnState::Retry,
            4 => ConnState::Failed,
            5 => ConnState::Zombie,
            _ => unreachable!("corrupt connection state {}", raw),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Down => "DOWN",
            ConnState::Ready => "READY",
            ConnState::Active => "ACTIVE",
            ConnState::Retry => "RETRY",
            ConnState::Failed => "FAILED",
            ConnState::Zombie => "ZOMBIE",
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which operation a caller performed with a checked-out connection. Used
/// only to attribute the hold time on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOp {
    Get,
    Put,
}

/// Per-connection usage counters. Monotonic; zeroed only at construction.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub(crate) nr_lookups: AtomicU64,
    pub(crate) tot_ticks_get: AtomicU64,
    pub(crate) tot_ticks_put: AtomicU64,
    pub(crate) tot_ticks_wait: AtomicU64,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) nr_retry_attempts: AtomicU64,
}

/// One reusable connection descriptor bound to a per-endpoint pool.
///
/// The `locked` bit is a test-and-set mutex over the node: a node whose bit is
/// set is exclusively owned, and every state transition happens while the bit
/// is held. The bit is kept apart from `state` so owners can mutate the state
/// without disturbing concurrent observers of the bit.
pub struct ConnectionNode {
    ip: String,
    port: u16,
    locked: AtomicBool,
    state: AtomicU8,
    pool: Mutex<Weak<ConnectionPool>>,
    /// Tick stamp captured when the node was last claimed; the matching
    /// release uses it to compute the hold interval.
    last_locked_at: AtomicU64,
    pub(crate) stats: NodeStats,
}

impl ConnectionNode {
    /// Build a connection descriptor for `ip:port`. The node starts `Down`
    /// and joins a pool only through table insert.
    pub fn new(ip: &str, port: u16) -> Result<ConnectionNode> {
        let mut ip_buf = String::new();
        ip_buf.try_reserve_exact(ip.len()).map_err(|_| {
            error!("failed to allocate connection ip");
            ConnPoolError::OutOfMemory
        })?;
        ip_buf.push_str(ip);

        Ok(ConnectionNode {
            ip: ip_buf,
            port,
            locked: AtomicBool::new(false),
            state: AtomicU8::new(ConnState::Down as u8),
            pool: Mutex::new(Weak::new()),
            last_locked_at: AtomicU64::new(0),
            stats: NodeStats::default(),
        })
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `ip:port` rendering used in logs and dump rows.
    pub fn host(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True while some owner holds the node's test-and-set bit.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Try to take exclusive ownership of the node.
    pub(crate) fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take exclusive ownership, spinning out any transient holder. Only used
    /// where the current holder is known to be a scan probing the state bit
    /// for a handful of instructions.
    pub(crate) fn lock_spin(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub(crate) fn bind_pool(&self, pool: &Arc<ConnectionPool>) {
        *self.pool.lock().expect("node pool backref poisoned") = Arc::downgrade(pool);
    }

    /// Handle to the owning pool, if the node is (or was) linked into one and
    /// the pool is still alive.
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.lock().expect("node pool backref poisoned").upgrade()
    }

    pub(crate) fn stamp_locked_at(&self, ticks: u64) {
        self.last_locked_at.store(ticks, Ordering::Relaxed);
    }

    pub(crate) fn update_op_ticks(&self, op: ConnOp) {
        let held = now_ticks().saturating_sub(self.last_locked_at.load(Ordering::Relaxed));
        match op {
            ConnOp::Get => self.stats.tot_ticks_get.fetch_add(held, Ordering::Relaxed),
            ConnOp::Put => self.stats.tot_ticks_put.fetch_add(held, Ordering::Relaxed),
        };
    }

    pub fn nr_lookups(&self) -> u64 {
        self.stats.nr_lookups.load(Ordering::Relaxed)
    }

    pub fn retry_attempts(&self) -> u64 {
        self.stats.nr_retry_attempts.load(Ordering::Relaxed)
    }

    /// Credit bytes sent over this connection (caller-supplied; the registry
    /// itself never performs I/O).
    pub fn add_tx_bytes(&self, n: u64) {
        self.stats.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Credit bytes received over this connection.
    pub fn add_rx_bytes(&self, n: u64) {
        self.stats.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Move a checked-out or retrying connection to `Failed`.
    ///
    /// Allowed from `Active` (the caller owns the node lock after a
    /// successful `timed_get`) or from `Retry` (idle; claimed here). The state
    /// is written before the lock is dropped, so no window exists in which an
    /// unlocked node carries a stale state.
    pub fn mark_failed(&self) {
        match self.state() {
            ConnState::Active => {
                assert!(self.is_locked(), "active connection without node lock");
                self.set_state(ConnState::Failed);
                self.unlock();
            }
            ConnState::Retry => {
                self.lock_spin();
                if matches!(self.state(), ConnState::Retry) {
                    self.set_state(ConnState::Failed);
                }
                self.unlock();
            }
            other => panic!("mark_failed on connection in state {}", other),
        }
    }

    /// Flag a checked-out connection for re-probe. The caller must own the
    /// node lock (the node came from `timed_get` and is still `Active`); the
    /// lock is released once the state is written, and the node stays out of
    /// rotation because the claim scan skips everything that is not `Ready`.
    pub fn mark_retry(&self) {
        assert!(self.is_locked(), "mark_retry requires the node lock");
        assert_eq!(
            self.state(),
            ConnState::Active,
            "mark_retry on connection not in use"
        );
        self.stats.nr_retry_attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnState::Retry);
        self.unlock();
    }

    /// Return a retrying connection to rotation. No-op unless the node is in
    /// `Retry`. Restores the owning pool's idle count and wakes one waiter,
    /// mirroring the release path.
    pub fn mark_ready(&self) {
        if self.state() != ConnState::Retry {
            return;
        }
        self.lock_spin();
        if self.state() != ConnState::Retry {
            // lost a race against a concurrent health transition
            self.unlock();
            return;
        }
        self.set_state(ConnState::Ready);
        match self.pool() {
            Some(pool) => {
                pool.upref.fetch_add(1, Ordering::AcqRel);
                pool.nr_idle_connections.fetch_add(1, Ordering::Release);
                self.unlock();
                pool.wq.notify_one();
                pool.upref.fetch_sub(1, Ordering::AcqRel);
            }
            None => self.unlock(),
        }
    }
}

impl std::fmt::Debug for ConnectionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionNode")
            .field("host", &self.host())
            .field("state", &self.state())
            .field("locked", &self.is_locked())
            .finish()
    }
}
