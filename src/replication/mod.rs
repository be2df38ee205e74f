//! Replication Module
//!
//! Operations that change the replication state of live instances: thread
//! control, master changes, semi-sync reconciliation and recovery helpers.
//! Every operation reads a fresh snapshot before acting and re-reads after,
//! and returns the best-known snapshot alongside any error.

mod change_master;
mod recovery;
mod semisync;
mod threads;

pub use change_master::ChangeMasterVariant;
pub use semisync::{
    classify_and_prioritize, determine_semi_sync_actions, SemiSyncActions, SemiSyncAnalysis,
    SemiSyncClassification,
};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::config::{ReplicationConfig, WolfReplConfig};
use crate::error::{Error, OpResult, OperationError, Result};
use crate::executor::{
    HostnameResolver, IdentityResolver, InstanceReader, Statement, StatementExecutor,
    TopologyGate, TopologyRecorder, TracingRecorder,
};
use crate::instance::{Instance, InstanceKey};

/// Grants check results keyed by instance
type GrantsCache = HashMap<InstanceKey, (tokio::time::Instant, bool)>;

/// Entry point for every replication control operation.
///
/// Cheap to clone; clones share the collaborators, the topology gate and
/// the Pseudo-GTID grants cache.
#[derive(Clone)]
pub struct ReplicationController {
    reader: Arc<dyn InstanceReader>,
    executor: Arc<dyn StatementExecutor>,
    resolver: Arc<dyn HostnameResolver>,
    recorder: Arc<dyn TopologyRecorder>,
    gate: TopologyGate,
    config: Arc<ReplicationConfig>,
    noop: bool,
    grants: Arc<RwLock<GrantsCache>>,
}

impl ReplicationController {
    /// Create a controller with identity hostname resolution and tracing audit
    pub fn new(
        reader: Arc<dyn InstanceReader>,
        executor: Arc<dyn StatementExecutor>,
        config: &WolfReplConfig,
    ) -> Self {
        Self {
            reader,
            executor,
            resolver: Arc::new(IdentityResolver),
            recorder: Arc::new(TracingRecorder),
            gate: TopologyGate::new(config.topology.concurrency),
            config: Arc::new(config.replication.clone()),
            noop: config.noop,
            grants: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a controller over one backend serving both reads and statements
    pub fn with_topology<T>(topology: Arc<T>, config: &WolfReplConfig) -> Self
    where
        T: InstanceReader + StatementExecutor + 'static,
    {
        let reader: Arc<dyn InstanceReader> = topology.clone();
        let executor: Arc<dyn StatementExecutor> = topology;
        Self::new(reader, executor, config)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn TopologyRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_gate(mut self, gate: TopologyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    pub fn gate(&self) -> &TopologyGate {
        &self.gate
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn is_noop(&self) -> bool {
        self.noop
    }

    /// Fresh snapshot; a failed read carries no snapshot
    async fn read(&self, key: &InstanceKey) -> OpResult {
        self.reader.read_topology_instance(key).await.map_err(|e| {
            tracing::error!("Failed to read {}: {}", key, e);
            OperationError::from(e)
        })
    }

    /// Dry-run guard, placed after precondition checks
    fn check_noop(&self, operation: &str, instance: &Instance) -> OpResult<()> {
        if self.noop {
            return Err(OperationError::new(
                Error::Noop {
                    operation: operation.to_string(),
                    key: instance.key.clone(),
                },
                Some(instance.clone()),
            ));
        }
        Ok(())
    }

    async fn exec(&self, key: &InstanceKey, statement: impl Into<Statement>) -> Result<u64> {
        self.executor.exec(key, &statement.into()).await
    }

    async fn audit(&self, operation: &str, key: &InstanceKey, message: impl AsRef<str>) {
        self.recorder.audit_operation(operation, key, message.as_ref()).await;
    }

    /// Run `op` once per instance through the gate and collect what each
    /// task reports. Order of the results follows completion.
    async fn fan_out<F, Fut>(&self, instances: &[Instance], op: F) -> Vec<Instance>
    where
        F: Fn(ReplicationController, Instance) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Instance> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(instances.len().max(1));
        for instance in instances {
            let this = self.clone();
            let op = op.clone();
            let tx = tx.clone();
            let instance = instance.clone();
            tokio::spawn(async move {
                let fallback = instance.clone();
                let gate = this.gate.clone();
                let updated = match gate.execute(op(this, instance)).await {
                    Ok(updated) => updated,
                    Err(e) => {
                        tracing::warn!("Topology operation on {} failed: {}", fallback.key, e);
                        fallback
                    }
                };
                let _ = tx.send(updated).await;
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(instances.len());
        while let Some(instance) = rx.recv().await {
            results.push(instance);
        }
        results
    }
}

/// Log a failure at the point it happens and attach the snapshot
trait Logged<T> {
    fn logged(self, instance: &Instance) -> OpResult<T>;
}

impl<T> Logged<T> for Result<T> {
    fn logged(self, instance: &Instance) -> OpResult<T> {
        self.map_err(|error| {
            tracing::error!("{}: {}", instance.key, error);
            OperationError::new(error, Some(instance.clone()))
        })
    }
}

/// Snapshot carried by a failed operation, or the given fallback
fn snapshot_or(error: &OperationError, fallback: &Instance) -> Instance {
    error.instance().cloned().unwrap_or_else(|| fallback.clone())
}
