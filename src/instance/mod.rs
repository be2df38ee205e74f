//! Instance Model
//!
//! Value types describing database instances and their replication
//! positions, plus the statement vocabulary each server version expects.

mod binlog;
mod key;
mod snapshot;
mod types;
pub mod gtid;
pub mod statements;

pub use binlog::{BinlogCoordinates, BINLOG_HEADER_SIZE};
pub use key::{InstanceKey, DEFAULT_PORT};
pub use snapshot::Instance;
pub use statements::QueryStatements;
pub use types::{
    OperationGtidHint, PromotionRule, ReplicationCredentials, ReplicationThreadState,
    StopReplicationMethod,
};
