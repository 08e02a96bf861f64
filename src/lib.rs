// connpool - endpoint-keyed connection pool registry

pub mod registry;
pub mod utils;

// Re-export commonly used types
pub use registry::{
    ConnOp, ConnState, ConnTable, ConnectionNode, ConnectionPool, WaitBudget, CONNTABLE_BUCKETS,
};
pub use utils::error::{ConnPoolError, Result};
