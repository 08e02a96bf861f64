use crate::registry::key::endpoint_key;
use crate::registry::node::{now_ticks, ConnState, ConnectionNode};
use crate::utils::error::{ConnPoolError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error};

/// Per-endpoint bundle: the connections sharing one `(ip, port)` target, the
/// wait queue for tasks blocked on idle capacity, and usage counters.
///
/// A pool is protected three ways, and a member dereference is legal under any
/// one of them: the table rwlock, a member node's lock bit, or a nonzero
/// `upref` pinned before the rwlock was dropped.
pub struct ConnectionPool {
    ip: String,
    port: u16,
    key: u32,
    /// Member chain, head-inserted: the claim scan prefers the newest node.
    /// Readers scan concurrently under the table read lock; structural
    /// mutation additionally requires the table write lock.
    pub(crate) conn_list: RwLock<VecDeque<Arc<ConnectionNode>>>,
    pub(crate) nr_connections: AtomicUsize,
    pub(crate) nr_idle_connections: AtomicUsize,
    /// Single-waiter wakeups only; the predicate is "at least one idle".
    pub(crate) wq: Notify,
    /// References held outside the table lock. A pool with `upref > 0` must
    /// not be destroyed; waiters hold one for their whole suspension.
    pub(crate) upref: AtomicUsize,
    pub(crate) nr_waits: AtomicU64,
}

impl ConnectionPool {
    pub(crate) fn new(ip: &str, port: u16) -> Result<ConnectionPool> {
        let mut ip_buf = String::new();
        ip_buf.try_reserve_exact(ip.len()).map_err(|_| {
            error!("failed to allocate pool ip ({}:{})", ip, port);
            ConnPoolError::OutOfMemory
        })?;
        ip_buf.push_str(ip);

        // cache the hash key
        let key = endpoint_key(ip, port)?;

        Ok(ConnectionPool {
            ip: ip_buf,
            port,
            key,
            conn_list: RwLock::new(VecDeque::new()),
            nr_connections: AtomicUsize::new(0),
            nr_idle_connections: AtomicUsize::new(0),
            wq: Notify::new(),
            upref: AtomicUsize::new(0),
            nr_waits: AtomicU64::new(0),
        })
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Total member connections.
    pub fn connections(&self) -> usize {
        self.nr_connections.load(Ordering::Acquire)
    }

    /// Members currently in `Ready`.
    pub fn idle_connections(&self) -> usize {
        self.nr_idle_connections.load(Ordering::Acquire)
    }

    /// Observed total suspensions on this pool's wait queue.
    pub fn waits(&self) -> u64 {
        self.nr_waits.load(Ordering::Relaxed)
    }

    /// Pin the pool against destruction and hand back an RAII token. The pin
    /// must be taken while the table read lock is still held; dropping the
    /// token (including a cancelled wait) releases the pin.
    pub(crate) fn pin(self: &Arc<Self>) -> PoolPin {
        self.upref.fetch_add(1, Ordering::AcqRel);
        PoolPin {
            pool: Arc::clone(self),
        }
    }

    /// Claim a ready, exclusively-owned connection from the member chain.
    ///
    /// Caller must hold the table read lock. On success the returned node is
    /// `Active` with its lock bit held by the caller. `wait_started` is the
    /// tick stamp from the top of the enclosing `timed_get`, charged to the
    /// node's wait accumulator on a successful claim.
    pub(crate) fn connection_get(&self, wait_started: u64) -> Result<Arc<ConnectionNode>> {
        let mut apd = true;
        let conn_list = self.conn_list.read().expect("pool conn_list poisoned");

        for connp in conn_list.iter() {
            if !connp.try_lock() {
                // someone owns it; we never saw the state
                apd = false;
                continue;
            }
            if connp.state() == ConnState::Ready {
                self.nr_idle_connections.fetch_sub(1, Ordering::AcqRel);
                connp.set_state(ConnState::Active);
                let now = now_ticks();
                connp
                    .stats
                    .tot_ticks_wait
                    .fetch_add(now.saturating_sub(wait_started), Ordering::Relaxed);
                connp.stamp_locked_at(now);
                connp.stats.nr_lookups.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(connp));
            }
            connp.unlock();
        }

        if conn_list.is_empty() {
            debug!(
                "get connection error <{}:{}>, node not present in pool",
                self.ip, self.port
            );
            Err(ConnPoolError::NotFound)
        } else if apd {
            debug!(
                "get connection failed <{}:{}>, all paths down to node",
                self.ip, self.port
            );
            Err(ConnPoolError::AllPathsDown)
        } else {
            debug!(
                "get connection error <{}:{}>, resource busy",
                self.ip, self.port
            );
            Err(ConnPoolError::Busy)
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint())
            .field("connections", &self.connections())
            .field("idle", &self.idle_connections())
            .finish()
    }
}

/// RAII upref on a pool. Exists so a waiter cancelled mid-suspension still
/// releases its pin.
pub(crate) struct PoolPin {
    pool: Arc<ConnectionPool>,
}

impl std::ops::Deref for PoolPin {
    type Target = ConnectionPool;

    fn deref(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Drop for PoolPin {
    fn drop(&mut self) {
        self.pool.upref.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_caches_its_endpoint_key() {
        let pool = ConnectionPool::new("10.1.2.3", 443).unwrap();
        assert_eq!(pool.key(), endpoint_key("10.1.2.3", 443).unwrap());
        assert_eq!(pool.endpoint(), "10.1.2.3:443");
        assert_eq!(pool.connections(), 0);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn pool_rejects_invalid_endpoint() {
        let err = ConnectionPool::new("not-an-ip", 443).unwrap_err();
        assert!(matches!(err, ConnPoolError::InvalidEndpoint(_)));
    }

    #[test]
    fn empty_pool_reports_not_found() {
        let pool = ConnectionPool::new("10.1.2.3", 443).unwrap();
        assert_eq!(
            pool.connection_get(now_ticks()).unwrap_err(),
            ConnPoolError::NotFound
        );
    }

    #[test]
    fn scan_claims_newest_ready_node_first() {
        let pool = Arc::new(ConnectionPool::new("10.1.2.3", 443).unwrap());
        let older = Arc::new(ConnectionNode::new("10.1.2.3", 443).unwrap());
        let newer = Arc::new(ConnectionNode::new("10.1.2.3", 443).unwrap());
        for node in [&older, &newer] {
            node.set_state(ConnState::Ready);
            pool.conn_list
                .write()
                .unwrap()
                .push_front(Arc::clone(node));
            pool.nr_connections.fetch_add(1, Ordering::AcqRel);
            pool.nr_idle_connections.fetch_add(1, Ordering::AcqRel);
        }

        let claimed = pool.connection_get(now_ticks()).unwrap();
        assert!(Arc::ptr_eq(&claimed, &newer));
        assert_eq!(claimed.state(), ConnState::Active);
        assert!(claimed.is_locked());
        assert_eq!(pool.idle_connections(), 1);
        assert_eq!(claimed.nr_lookups(), 1);
    }

    #[test]
    fn scan_reports_busy_when_a_node_is_locked() {
        let pool = Arc::new(ConnectionPool::new("10.1.2.3", 443).unwrap());
        let node = Arc::new(ConnectionNode::new("10.1.2.3", 443).unwrap());
        node.set_state(ConnState::Ready);
        pool.conn_list.write().unwrap().push_front(Arc::clone(&node));
        pool.nr_connections.fetch_add(1, Ordering::AcqRel);
        pool.nr_idle_connections.fetch_add(1, Ordering::AcqRel);

        let claimed = pool.connection_get(now_ticks()).unwrap();
        assert_eq!(
            pool.connection_get(now_ticks()).unwrap_err(),
            ConnPoolError::Busy
        );
        drop(claimed);
    }

    #[test]
    fn scan_reports_all_paths_down_when_nothing_is_ready() {
        let pool = Arc::new(ConnectionPool::new("10.1.2.3", 443).unwrap());
        let node = Arc::new(ConnectionNode::new("10.1.2.3", 443).unwrap());
        node.set_state(ConnState::Failed);
        pool.conn_list.write().unwrap().push_front(Arc::clone(&node));
        pool.nr_connections.fetch_add(1, Ordering::AcqRel);

        assert_eq!(
            pool.connection_get(now_ticks()).unwrap_err(),
            ConnPoolError::AllPathsDown
        );
        assert!(!node.is_locked());
    }
}
