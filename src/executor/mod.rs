//! Topology Executor Module
//!
//! Collaborator traits through which replication operations reach
//! database servers, the MySQL implementation of them, and the gate
//! bounding concurrent topology access.

mod gate;
mod mysql;
mod statement;
mod traits;

pub use gate::{TopologyGate, DEFAULT_TOPOLOGY_CONCURRENCY};
pub use mysql::MySqlTopology;
pub use statement::{quote, SqlArg, SqlRow, Statement};
pub use traits::{
    HostnameResolver, IdentityResolver, InstanceReader, StatementExecutor, TopologyRecorder,
    TracingRecorder,
};
