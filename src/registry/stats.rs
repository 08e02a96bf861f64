use crate::registry::node::{ConnState, ConnectionNode};
use crate::registry::pool::ConnectionPool;
use crate::registry::table::ConnTable;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Point-in-time view of one connection's usage distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub host: String,
    pub state: ConnState,
    pub retries: u64,
    pub lookups: u64,
    pub waits: u64,
    pub avg_wait_us: u64,
    pub avg_lat_get_us: u64,
    pub avg_lat_put_us: u64,
    pub tx_kb: u64,
    pub rx_kb: u64,
}

/// Point-in-time view of one endpoint pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub endpoint: String,
    pub connections: usize,
    pub idle_connections: usize,
    pub waits: u64,
    pub nodes: Vec<NodeSnapshot>,
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub pools: Vec<PoolSnapshot>,
}

fn div_safe(total: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        total / count
    }
}

impl NodeSnapshot {
    fn collect(connp: &Arc<ConnectionNode>, pool_waits: u64) -> NodeSnapshot {
        let stats = &connp.stats;
        let lookups = stats.nr_lookups.load(Ordering::Relaxed);
        NodeSnapshot {
            host: connp.host(),
            state: connp.state(),
            retries: stats.nr_retry_attempts.load(Ordering::Relaxed),
            lookups,
            waits: pool_waits,
            avg_wait_us: div_safe(stats.tot_ticks_wait.load(Ordering::Relaxed), lookups),
            avg_lat_get_us: div_safe(stats.tot_ticks_get.load(Ordering::Relaxed), lookups),
            avg_lat_put_us: div_safe(stats.tot_ticks_put.load(Ordering::Relaxed), lookups),
            tx_kb: stats.tx_bytes.load(Ordering::Relaxed) >> 10,
            rx_kb: stats.rx_bytes.load(Ordering::Relaxed) >> 10,
        }
    }
}

impl PoolSnapshot {
    fn collect(pool: &Arc<ConnectionPool>) -> PoolSnapshot {
        let waits = pool.waits();
        let nodes = pool
            .conn_list
            .read()
            .expect("pool conn_list poisoned")
            .iter()
            .map(|connp| NodeSnapshot::collect(connp, waits))
            .collect();
        PoolSnapshot {
            endpoint: pool.endpoint(),
            connections: pool.connections(),
            idle_connections: pool.idle_connections(),
            waits,
            nodes,
        }
    }
}

impl ConnTable {
    /// Capture a snapshot of every pool and node under the table read lock.
    pub fn snapshot(&self) -> TableSnapshot {
        let mut pools = Vec::new();
        self.for_each_pool(|pool| pools.push(PoolSnapshot::collect(pool)));
        TableSnapshot { pools }
    }

    /// Write the usage distribution of every connection to `sink`, one
    /// whitespace-separated row per node after a header row. Averages are in
    /// microseconds; a node with no lookups reports zeroes.
    pub fn dump<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        writeln!(
            sink,
            "HOST STATE RETRIES LOOKUPS WAITS AVG_WAIT(us) AVG_LAT_GET(us) AVG_LAT_PUT(us) \
             SEND(kb) RCV(kb)"
        )?;

        for pool in self.snapshot().pools {
            for node in pool.nodes {
                writeln!(
                    sink,
                    "{} {} {} {} {} {} {} {} {} {}",
                    node.host,
                    node.state,
                    node.retries,
                    node.lookups,
                    node.waits,
                    node.avg_wait_us,
                    node.avg_lat_get_us,
                    node.avg_lat_put_us,
                    node.tx_kb,
                    node.rx_kb,
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_safe_handles_zero_lookups() {
        assert_eq!(div_safe(1000, 0), 0);
        assert_eq!(div_safe(1000, 4), 250);
    }

    #[test]
    fn empty_table_dumps_header_only() {
        let table = ConnTable::new();
        let mut out = Vec::new();
        table.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("HOST STATE RETRIES LOOKUPS WAITS"));
    }

    #[test]
    fn snapshot_reflects_inserted_nodes() {
        let table = ConnTable::new();
        let node = Arc::new(ConnectionNode::new("10.0.0.1", 80).unwrap());
        node.add_tx_bytes(2048);
        table.insert(&node).unwrap();

        let snap = table.snapshot();
        assert_eq!(snap.pools.len(), 1);
        let pool = &snap.pools[0];
        assert_eq!(pool.endpoint, "10.0.0.1:80");
        assert_eq!(pool.connections, 1);
        assert_eq!(pool.idle_connections, 1);
        assert_eq!(pool.nodes.len(), 1);
        let row = &pool.nodes[0];
        assert_eq!(row.state, ConnState::Ready);
        assert_eq!(row.lookups, 0);
        assert_eq!(row.avg_lat_get_us, 0);
        assert_eq!(row.tx_kb, 2);
    }
}
