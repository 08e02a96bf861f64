use crate::registry::key::endpoint_key;
use crate::registry::metrics::RegistryMetrics;
use crate::registry::node::{now_ticks, ConnOp, ConnState, ConnectionNode};
use crate::registry::pool::ConnectionPool;
use crate::utils::error::{ConnPoolError, Result};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, error, info};

/// log2 of the bucket array size. Fixed at compile time; the table never
/// resizes.
pub const CONNTABLE_BUCKET_BITS: u32 = 6;
/// Number of chained buckets in the endpoint index.
pub const CONNTABLE_BUCKETS: usize = 1 << CONNTABLE_BUCKET_BITS;

type Bucket = Vec<Arc<ConnectionPool>>;

/// Wait budget for [`ConnTable::timed_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBudget {
    /// Try once and return without blocking.
    Immediate,
    /// Block up to the given duration for idle capacity.
    Bounded(std::time::Duration),
    /// Block until a connection shows up or the pool disappears.
    Forever,
}

/// Process-wide registry of connection pools, indexed by endpoint key.
///
/// A single readers-writer lock guards the bucket array: acquire, release,
/// peek and dump run as readers; insert, remove and destroy run as writers.
/// The lock is never held across a suspension point; waiters pin their pool
/// with an upref before dropping it.
pub struct ConnTable {
    buckets: RwLock<Vec<Bucket>>,
}

impl ConnTable {
    pub fn new() -> ConnTable {
        ConnTable {
            buckets: RwLock::new(vec![Bucket::new(); CONNTABLE_BUCKETS]),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Bucket>> {
        self.buckets.read().expect("conntable rwlock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Bucket>> {
        self.buckets.write().expect("conntable rwlock poisoned")
    }

    fn bucket_of(key: u32) -> usize {
        key as usize & (CONNTABLE_BUCKETS - 1)
    }

    /// Look up the pool for an endpoint. Caller holds the bucket guard in
    /// either mode.
    fn lookup_pool(
        buckets: &[Bucket],
        ip: &str,
        port: u16,
        key: u32,
    ) -> Option<Arc<ConnectionPool>> {
        buckets[Self::bucket_of(key)]
            .iter()
            .find(|pool| pool.port() == port && pool.ip() == ip)
            .map(|pool| {
                debug_assert_eq!(pool.key(), key);
                Arc::clone(pool)
            })
    }

    /// Bind a pre-initialized connection node into the registry, creating its
    /// pool on first use. The node becomes `Ready` and immediately visible to
    /// acquirers; one pending waiter is woken.
    pub fn insert(&self, connp: &Arc<ConnectionNode>) -> Result<()> {
        let key = endpoint_key(connp.ip(), connp.port())?;

        let mut buckets = self.write();
        let pool = match Self::lookup_pool(&buckets, connp.ip(), connp.port(), key) {
            Some(pool) => pool,
            None => {
                // Allocate outside the lock. A racing inserter may create the
                // pool meanwhile, so look up again after reacquiring and let
                // the losing allocation die.
                drop(buckets);
                let fresh = Arc::new(ConnectionPool::new(connp.ip(), connp.port())?);
                buckets = self.write();
                match Self::lookup_pool(&buckets, connp.ip(), connp.port(), key) {
                    Some(existing) => existing,
                    None => {
                        buckets[Self::bucket_of(key)].push(Arc::clone(&fresh));
                        fresh
                    }
                }
            }
        };

        connp.bind_pool(&pool);

        // added to head of the per-pool connection chain
        pool.conn_list
            .write()
            .expect("pool conn_list poisoned")
            .push_front(Arc::clone(connp));
        pool.nr_connections.fetch_add(1, Ordering::AcqRel);

        connp.set_state(ConnState::Ready);
        pool.nr_idle_connections.fetch_add(1, Ordering::Release);

        pool.upref.fetch_add(1, Ordering::AcqRel);
        drop(buckets);

        // wake up any pending waiter; the lock release above is the barrier
        pool.wq.notify_one();
        pool.upref.fetch_sub(1, Ordering::AcqRel);

        RegistryMetrics::record_insert();
        debug!("inserted connection <{}>", connp.host());
        Ok(())
    }

    /// Unlink a connection from the registry. Fails with `Busy` if some
    /// other party owns the node lock. The pool is left in place even when it
    /// becomes empty; pools outlive emptiness.
    pub fn remove(&self, connp: &Arc<ConnectionNode>) -> Result<()> {
        let buckets = self.write();
        let res = Self::connection_remove(connp);
        drop(buckets);
        res
    }

    /// Remove helper. Caller must hold the table write lock. On success the
    /// node is unlinked and left holding its lock bit, pending destruction.
    fn connection_remove(connp: &Arc<ConnectionNode>) -> Result<()> {
        // bail out if the node is in use
        if !connp.try_lock() {
            error!("connection <{}> is locked, cannot remove", connp.host());
            return Err(ConnPoolError::Busy);
        }

        let pool = connp.pool().expect("removing an unlinked connection");
        assert!(
            connp.state() != ConnState::Active,
            "removing an in-use connection <{}>",
            connp.host()
        );
        if connp.state() == ConnState::Ready {
            pool.nr_idle_connections.fetch_sub(1, Ordering::AcqRel);
            connp.set_state(ConnState::Zombie);
        }

        let mut conn_list = pool.conn_list.write().expect("pool conn_list poisoned");
        let pos = conn_list
            .iter()
            .position(|member| Arc::ptr_eq(member, connp))
            .expect("connection missing from its pool chain");
        conn_list.remove(pos);
        drop(conn_list);
        pool.nr_connections.fetch_sub(1, Ordering::AcqRel);

        RegistryMetrics::record_removal();
        Ok(())
    }

    /// Advisory lookup: the head of the endpoint's connection chain, without
    /// taking the node lock. Validity is not assured once returned.
    pub fn peek(&self, ip: &str, port: u16) -> Option<Arc<ConnectionNode>> {
        let key = endpoint_key(ip, port).ok()?;
        let buckets = self.read();
        let pool = Self::lookup_pool(&buckets, ip, port, key)?;
        let conn_list = pool.conn_list.read().expect("pool conn_list poisoned");
        conn_list.front().cloned()
    }

    /// First node of the first non-empty pool, unlocked. Drives external
    /// shutdown sweeps (fetch, remove, repeat); this is not a general-purpose
    /// iterator.
    pub fn first_node(&self) -> Option<Arc<ConnectionNode>> {
        let buckets = self.read();
        for bucket in buckets.iter() {
            for pool in bucket {
                let conn_list = pool.conn_list.read().expect("pool conn_list poisoned");
                if let Some(connp) = conn_list.front() {
                    return Some(Arc::clone(connp));
                }
            }
        }
        None
    }

    /// Claim a ready, exclusive connection for `ip:port`, blocking within the
    /// given budget when every candidate is momentarily owned.
    ///
    /// On success the returned node is `Active` and its lock bit is held by
    /// the caller, who must hand it back through [`ConnTable::put`].
    pub async fn timed_get(
        &self,
        ip: &str,
        port: u16,
        budget: WaitBudget,
    ) -> Result<Arc<ConnectionNode>> {
        let key = endpoint_key(ip, port)?;

        // start wait time
        let wait_started = now_ticks();
        let deadline = match budget {
            WaitBudget::Bounded(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        loop {
            let pin = {
                let buckets = self.read();
                let Some(pool) = Self::lookup_pool(&buckets, ip, port, key) else {
                    error!("get failed, pool not initialized ({}:{})", ip, port);
                    RegistryMetrics::record_lookup_failure("not_found");
                    return Err(ConnPoolError::NotFound);
                };

                match pool.connection_get(wait_started) {
                    Ok(connp) => {
                        RegistryMetrics::record_lookup();
                        return Ok(connp);
                    }
                    Err(ConnPoolError::NotFound) => {
                        RegistryMetrics::record_lookup_failure("not_found");
                        return Err(ConnPoolError::NotFound);
                    }
                    Err(ConnPoolError::AllPathsDown) => {
                        debug_assert_eq!(pool.idle_connections(), 0);
                        RegistryMetrics::record_lookup_failure("all_paths_down");
                        return Err(ConnPoolError::AllPathsDown);
                    }
                    Err(ConnPoolError::Busy) => {
                        if budget == WaitBudget::Immediate {
                            RegistryMetrics::record_lookup_failure("busy");
                            return Err(ConnPoolError::Busy);
                        }
                        // Pin the pool while the read lock is still held;
                        // a writer could otherwise nuke it while we block.
                        pool.pin()
                    }
                    Err(other) => unreachable!("connection_get returned {:?}", other),
                }
            };

            // read lock dropped; the pin keeps the pool destroy-proof
            {
                let notified = pin.wq.notified();
                tokio::pin!(notified);
                // Register interest before re-checking the predicate, so a
                // release landing between the failed scan and the sleep is
                // not missed.
                if !notified.as_mut().enable() && pin.idle_connections() == 0 {
                    pin.nr_waits.fetch_add(1, Ordering::Relaxed);
                    RegistryMetrics::record_wait();

                    let woke = match deadline {
                        None => {
                            notified.await;
                            true
                        }
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            !remaining.is_zero()
                                && tokio::time::timeout(remaining, notified).await.is_ok()
                        }
                    };

                    if !woke {
                        error!("get connection timed out <{}:{}>", ip, port);
                        RegistryMetrics::record_lookup_failure("timeout");
                        return Err(ConnPoolError::Timeout);
                    }
                }
            }
            // pin dropped at end of iteration; rescan with the remaining budget
        }
    }

    /// Hand a connection back after use. `op` labels what the caller did
    /// with it, for timing attribution only.
    ///
    /// For an `Active` node the steps run in the exact reverse of the claim:
    /// state to `Ready`, pool pinned, idle count up, lock bit released, one
    /// waiter woken, pin dropped. Any other state just gives the lock bit
    /// back.
    pub fn put(&self, connp: &Arc<ConnectionNode>, op: ConnOp) {
        match connp.state() {
            ConnState::Active => {
                let Some(pool) = connp.pool() else {
                    // table torn down while the connection was checked out
                    debug!("put on orphaned connection <{}>", connp.host());
                    connp.unlock();
                    return;
                };

                // end use time
                connp.update_op_ticks(op);
                connp.set_state(ConnState::Ready);
                pool.upref.fetch_add(1, Ordering::AcqRel);
                pool.nr_idle_connections.fetch_add(1, Ordering::Release);
                connp.unlock();
                pool.wq.notify_one(); // wake up a single task
                pool.upref.fetch_sub(1, Ordering::AcqRel);
            }
            _ => connp.unlock(),
        }
    }

    /// Tear the registry down, best-effort. Every removable node is unlinked;
    /// a busy node causes its pool to be skipped and reported. Pools that
    /// still hold an upref, a waiter or members survive the sweep and are
    /// reported as leaked.
    ///
    /// Returns the number of nodes removed.
    pub fn destroy(&self) -> usize {
        let mut nr_items = 0usize;
        let mut buckets = self.write();

        for bucket in buckets.iter_mut() {
            bucket.retain(|pool| {
                let members: Vec<Arc<ConnectionNode>> = pool
                    .conn_list
                    .read()
                    .expect("pool conn_list poisoned")
                    .iter()
                    .cloned()
                    .collect();

                for connp in &members {
                    if Self::connection_remove(connp).is_err() {
                        error!("connection remove error <{}>", connp.host());
                        // pool not ready to destroy
                        return true;
                    }
                    nr_items += 1;
                }

                // the upref read is safe here: it only moves while the table
                // lock is held by the mover or by a pinned waiter, and a
                // pinned waiter blocks this destroy
                let upref = pool.upref.load(Ordering::Acquire);
                if upref != 0 {
                    error!(
                        "pool destroy error <{}>, pool has bumped up reference ({})",
                        pool.endpoint(),
                        upref
                    );
                    return true;
                }
                if !pool
                    .conn_list
                    .read()
                    .expect("pool conn_list poisoned")
                    .is_empty()
                {
                    error!(
                        "pool destroy error <{}>, connection list is not empty",
                        pool.endpoint()
                    );
                    return true;
                }

                debug_assert_eq!(pool.connections(), 0);
                debug_assert_eq!(pool.idle_connections(), 0);
                info!("connection pool destroyed for <{}>", pool.endpoint());
                false
            });
        }

        drop(buckets);
        info!("cleanup removed {} items from table", nr_items);
        nr_items
    }

    /// Run a closure over every pool under the table read lock.
    pub(crate) fn for_each_pool<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ConnectionPool>),
    {
        let buckets = self.read();
        for bucket in buckets.iter() {
            for pool in bucket {
                f(pool);
            }
        }
    }
}

impl Default for ConnTable {
    fn default() -> ConnTable {
        ConnTable::new()
    }
}
