//! WolfRepl - MySQL/MariaDB Replication Control Engine
//!
//! The replication-control core of a topology manager: it starts, stops and
//! repoints replicas, waits for replication to converge, skips failed
//! events, and decides which replicas should acknowledge semi-synchronous
//! commits.
//!
//! # Architecture
//!
//! Every operation is a method on [`ReplicationController`]. The controller
//! never holds a connection itself; it reads instance snapshots and issues
//! statements through the collaborator traits in [`executor`], and bounds
//! how many instances it touches at once with a [`executor::TopologyGate`].
//!
//! # Features
//!
//! - Version-aware statements (legacy `SLAVE`, 8.0.26+ `REPLICA`, MariaDB)
//! - GTID-aware `CHANGE MASTER TO` decision table (Oracle, MariaDB, file/pos)
//! - Nice stops that drain the relay log, with overall and staleness timeouts
//! - Pure semi-sync policy engine (exact and enough topologies)
//! - Dry-run mode: every mutation aborts after its precondition checks
//! - Pseudo-GTID injection with a cached grants check

pub mod config;
pub mod error;
pub mod executor;
pub mod instance;
pub mod replication;

#[cfg(test)]
mod testing;

pub use config::WolfReplConfig;
pub use error::{Error, OpResult, OperationError, Result};
pub use replication::ReplicationController;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfReplConfig;
    pub use crate::error::{Error, OpResult, OperationError, Result};
    pub use crate::executor::{InstanceReader, MySqlTopology, StatementExecutor};
    pub use crate::instance::{
        BinlogCoordinates, Instance, InstanceKey, OperationGtidHint, StopReplicationMethod,
    };
    pub use crate::replication::{ReplicationController, SemiSyncAnalysis};
}
