//! Topology collaborators
//!
//! The replication operations never talk to a server directly. They read
//! snapshots through an [`InstanceReader`], issue statements through a
//! [`StatementExecutor`], and record side effects through a
//! [`TopologyRecorder`].

use async_trait::async_trait;

use super::statement::{SqlRow, Statement};
use crate::error::Result;
use crate::instance::{BinlogCoordinates, Instance, InstanceKey};

/// Source of instance snapshots
#[async_trait]
pub trait InstanceReader: Send + Sync {
    /// Read a fresh snapshot directly from the server
    async fn read_topology_instance(&self, key: &InstanceKey) -> Result<Instance>;

    /// Last snapshot known for the instance, without contacting it
    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>>;

    /// Locally tracked replicas of the given master
    async fn read_replica_instances(&self, master_key: &InstanceKey) -> Result<Vec<Instance>>;

    /// Fresh snapshots of several instances; fails if any read fails
    async fn read_topology_instances(&self, keys: &[InstanceKey]) -> Result<Vec<Instance>> {
        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            instances.push(self.read_topology_instance(key).await?);
        }
        Ok(instances)
    }
}

/// SQL primitive against a named server
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Execute a statement, returning the number of affected rows
    async fn exec(&self, key: &InstanceKey, statement: &Statement) -> Result<u64>;

    /// Execute statements in order on one connection, so session state
    /// (e.g. `GTID_NEXT`) carries from one to the next.
    ///
    /// When a statement fails the connection is discarded rather than
    /// returned for reuse, so none of that session state outlives the call.
    async fn exec_in_session(&self, key: &InstanceKey, statements: &[Statement]) -> Result<()>;

    /// Run a query and return all rows as text
    async fn query_rows(&self, key: &InstanceKey, statement: &Statement) -> Result<Vec<SqlRow>>;

    /// Run a query and return its first row, if any
    async fn query_row(&self, key: &InstanceKey, statement: &Statement) -> Result<Option<SqlRow>> {
        Ok(self.query_rows(key, statement).await?.into_iter().next())
    }
}

/// Canonical-name normalisation of hostnames
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    /// Returns the canonical key and whether it differs from the input
    async fn unresolve_hostname(&self, key: &InstanceKey) -> Result<(InstanceKey, bool)>;
}

/// Bookkeeping sinks updated by the operations
#[async_trait]
pub trait TopologyRecorder: Send + Sync {
    /// Fire-and-forget audit record
    async fn audit_operation(&self, operation: &str, key: &InstanceKey, message: &str);

    /// Remember that two coordinates on two masters denote the same point
    async fn write_master_position_equivalence(
        &self,
        master1: &InstanceKey,
        coordinates1: &BinlogCoordinates,
        master2: &InstanceKey,
        coordinates2: &BinlogCoordinates,
    ) -> Result<()>;

    /// Forget relay log history of an instance whose source changed
    async fn reset_instance_relaylog_coordinates_history(&self, key: &InstanceKey) -> Result<()>;

    /// Note that a Pseudo-GTID entry was injected into the cluster
    async fn register_injected_pseudo_gtid(&self, cluster_name: &str) -> Result<()>;
}

/// Resolver that treats every key as canonical
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

#[async_trait]
impl HostnameResolver for IdentityResolver {
    async fn unresolve_hostname(&self, key: &InstanceKey) -> Result<(InstanceKey, bool)> {
        Ok((key.clone(), false))
    }
}

/// Recorder that writes every record to the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

#[async_trait]
impl TopologyRecorder for TracingRecorder {
    async fn audit_operation(&self, operation: &str, key: &InstanceKey, message: &str) {
        tracing::info!(target: "audit", operation, instance = %key, "{}", message);
    }

    async fn write_master_position_equivalence(
        &self,
        master1: &InstanceKey,
        coordinates1: &BinlogCoordinates,
        master2: &InstanceKey,
        coordinates2: &BinlogCoordinates,
    ) -> Result<()> {
        tracing::debug!(
            target: "audit",
            "position equivalence: {} {} == {} {}",
            master1, coordinates1, master2, coordinates2
        );
        Ok(())
    }

    async fn reset_instance_relaylog_coordinates_history(&self, key: &InstanceKey) -> Result<()> {
        tracing::debug!(target: "audit", "relay log coordinates history reset on {}", key);
        Ok(())
    }

    async fn register_injected_pseudo_gtid(&self, cluster_name: &str) -> Result<()> {
        tracing::debug!(target: "audit", "pseudo-GTID injected on cluster {}", cluster_name);
        Ok(())
    }
}
