//! Instance snapshot
//!
//! A point-in-time reading of one server's replication state. Snapshots are
//! never updated in place: every operation that changes a server re-reads it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::binlog::BinlogCoordinates;
use super::gtid::OracleGtidSet;
use super::key::InstanceKey;
use super::statements::QueryStatements;
use super::types::{PromotionRule, ReplicationThreadState};
use crate::error::{Error, Result};

/// Replication state of a single MySQL/MariaDB server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub key: InstanceKey,
    pub version: String,
    pub server_id: u32,
    pub server_uuid: String,
    pub read_only: bool,
    pub log_bin_enabled: bool,
    pub cluster_name: String,

    /// Source this instance replicates from
    pub master_key: InstanceKey,
    pub master_uuid: String,
    /// `SHOW SLAVE STATUS` returned a row
    pub replication_threads_exist: bool,
    pub replication_io_thread_running: bool,
    pub replication_sql_thread_running: bool,

    /// Own binary log position (`SHOW MASTER STATUS`)
    pub self_binlog_coordinates: BinlogCoordinates,
    /// Source position fetched by the IO thread
    pub read_binlog_coordinates: BinlogCoordinates,
    /// Source position applied by the SQL thread
    pub exec_binlog_coordinates: BinlogCoordinates,
    pub relaylog_coordinates: BinlogCoordinates,
    pub last_sql_error: String,
    pub last_io_error: String,
    /// Configured `MASTER_DELAY` in seconds
    pub sql_delay: u32,

    pub supports_oracle_gtid: bool,
    pub using_oracle_gtid: bool,
    pub using_mariadb_gtid: bool,
    pub executed_gtid_set: String,
    pub gtid_purged: String,

    pub semi_sync_master_enabled: bool,
    pub semi_sync_replica_enabled: bool,
    /// `rpl_semi_sync_source_*` variable names are in use
    pub semi_sync_master_plugin_new_version: bool,
    /// `rpl_semi_sync_replica_*` variable names are in use
    pub semi_sync_replica_plugin_new_version: bool,
    /// 0 means "always async"
    pub semi_sync_priority: u32,
    pub semi_sync_master_wait_for_replica_count: u32,
    pub semi_sync_master_clients: u32,
    pub promotion_rule: PromotionRule,

    pub is_last_check_valid: bool,
    pub last_checked: Option<DateTime<Utc>>,
    /// Replicas known to connect to this instance
    pub replicas: Vec<InstanceKey>,
}

impl Instance {
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            is_last_check_valid: true,
            ..Default::default()
        }
    }

    pub fn is_mariadb(&self) -> bool {
        self.version.contains("MariaDB")
    }

    pub fn is_maxscale(&self) -> bool {
        self.version.to_lowercase().contains("maxscale")
    }

    /// Statement vocabulary matching this server's version
    pub fn qsp(&self) -> QueryStatements {
        QueryStatements::for_version(&self.version)
    }

    pub fn using_gtid(&self) -> bool {
        self.using_oracle_gtid || self.using_mariadb_gtid
    }

    /// Configured with a source and has either a position or GTID to follow
    pub fn is_replica(&self) -> bool {
        self.master_key.is_valid()
            && (!self.read_binlog_coordinates.is_empty() || self.using_gtid())
    }

    pub fn thread_state(&self) -> ReplicationThreadState {
        ReplicationThreadState::from_flags(
            self.replication_threads_exist,
            self.replication_io_thread_running,
            self.replication_sql_thread_running,
        )
    }

    /// Both threads exist and neither is running
    pub fn replication_threads_stopped(&self) -> bool {
        self.thread_state() == ReplicationThreadState::Stopped
    }

    /// Both threads exist and both are running
    pub fn replica_running(&self) -> bool {
        self.is_replica() && self.thread_state() == ReplicationThreadState::Running
    }

    /// The SQL thread has applied everything the IO thread fetched
    pub fn sql_thread_up_to_date(&self) -> bool {
        self.read_binlog_coordinates == self.exec_binlog_coordinates
    }

    /// Next Oracle GTID this replica expects from its source
    pub fn next_gtid(&self) -> Result<String> {
        if self.executed_gtid_set.trim().is_empty() {
            return Err(Error::Gtid(format!(
                "no value found in Executed_Gtid_Set on {}; cannot compute next GTID",
                self.key
            )));
        }
        let set = OracleGtidSet::parse(&self.executed_gtid_set)?;
        let source = Some(self.master_uuid.as_str()).filter(|u| !u.is_empty());
        set.next_gtid(source)
    }
}
