//! Replication thread control
//!
//! Start, stop and restart of the IO and SQL threads, bulk variants over
//! many replicas, and the polling waits that watch replication converge.

use std::cmp::Ordering;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::{snapshot_or, Logged, ReplicationController};
use crate::config::DEFAULT_OVERALL_TIMEOUT;
use crate::error::{Error, OpResult, OperationError, Result, WithSnapshot};
use crate::executor::Statement;
use crate::instance::{
    BinlogCoordinates, Instance, InstanceKey, ReplicationThreadState, StopReplicationMethod,
};

/// Budget for thread state convergence after START/STOP
const REPLICATION_STATE_WAIT: Duration = Duration::from_secs(1);
const REPLICATION_STATE_FIRST_INTERVAL: Duration = Duration::from_millis(10);

impl ReplicationController {
    /// Re-read an instance and return the tracked copy
    pub async fn refresh_topology_instance(&self, key: &InstanceKey) -> Result<Instance> {
        self.reader.read_topology_instance(key).await?;
        self.reader
            .read_instance(key)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(key.clone()))
    }

    /// Concurrently re-read all given instances and wait for every read
    pub async fn refresh_topology_instances(&self, instances: &[Instance]) -> Vec<Instance> {
        self.fan_out(instances, |this, instance| async move {
            tracing::debug!("... reading instance: {}", instance.key);
            match this.reader.read_topology_instance(&instance.key).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!("Failed to refresh {}: {}", instance.key, e);
                    instance
                }
            }
        })
        .await
    }

    /// Stop both replication threads
    pub async fn stop_replication(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if !instance.is_replica() {
            return Err(Error::NotReplica(key.clone())).snapshot(&instance);
        }
        self.check_noop("stop-replication", &instance)?;

        self.stop_both_threads(&instance).await.logged(&instance)?;

        let instance = self.read(key).await?;
        tracing::info!(
            "Stopped replication on {}, Self:{}, Exec:{}",
            key,
            instance.self_binlog_coordinates,
            instance.exec_binlog_coordinates
        );
        Ok(instance)
    }

    /// `STOP SLAVE`, tolerating MaxScale's complaint about an already stopped replica
    async fn stop_both_threads(&self, instance: &Instance) -> Result<()> {
        match self.exec(&instance.key, instance.qsp().stop_replica()).await {
            Ok(_) => Ok(()),
            Err(e) if instance.is_maxscale() && e.is_maxscale_not_running() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Start replication and verify both threads came up
    pub async fn start_replication(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if !instance.is_replica() {
            return Err(Error::NotReplica(key.clone())).snapshot(&instance);
        }
        self.check_noop("start-replication", &instance)?;

        let instance = self.maybe_disable_semi_sync_master(instance).await?;
        // Replica acks must be on before the IO thread connects.
        let instance = self.maybe_enable_semi_sync_replica(instance).await?;

        self.exec(key, instance.qsp().start_replica()).await.logged(&instance)?;
        tracing::info!("Started replication on {}", key);

        self.wait_for_replication_state(key, ReplicationThreadState::Running).await;

        let instance = self.read(key).await?;
        if !instance.replica_running() {
            return Err(Error::ReplicationNotRunning(key.clone())).logged(&instance);
        }
        Ok(instance)
    }

    /// Poll with doubling intervals until both threads match `expected`.
    /// Read errors during the poll are ignored.
    async fn wait_for_replication_state(&self, key: &InstanceKey, expected: ReplicationThreadState) -> bool {
        let started = Instant::now();
        let mut interval = REPLICATION_STATE_FIRST_INTERVAL;

        loop {
            if let Ok(instance) = self.reader.read_topology_instance(key).await {
                if instance.thread_state() == expected {
                    return true;
                }
            }
            if started.elapsed() + interval > REPLICATION_STATE_WAIT {
                return false;
            }
            sleep(interval).await;
            interval *= 2;
        }
    }

    /// Stop then start replication
    pub async fn restart_replication(&self, key: &InstanceKey) -> OpResult {
        self.stop_replication(key).await?;
        self.start_replication(key).await
    }

    /// Bounce only the IO thread. No precondition or semi-sync handling.
    pub async fn restart_replication_quick(&self, instance: &Instance) -> Result<()> {
        if self.noop {
            return Err(Error::Noop {
                operation: "restart-replication-quick".into(),
                key: instance.key.clone(),
            });
        }
        let qsp = instance.qsp();
        for sql in [qsp.stop_io_thread(), qsp.start_io_thread()] {
            if let Err(e) = self.exec(&instance.key, sql).await {
                tracing::error!("{}: RestartReplicationQuick: '{}' failed: {}", instance.key, sql, e);
                return Err(e);
            }
            tracing::info!("{} on {} as part of RestartReplicationQuick", sql, instance.key);
        }
        Ok(())
    }

    /// Stop the IO thread, let the SQL thread drain the relay log, then stop.
    ///
    /// The SQL thread is started even if the replica was fully stopped. When
    /// the replica is delayed the drain is skipped. A zero `timeout` means 24h.
    pub async fn stop_replication_nicely(&self, key: &InstanceKey, timeout: Duration) -> OpResult {
        let mut instance = self.read(key).await?;
        if !instance.replication_threads_exist {
            return Err(Error::NotReplica(key.clone())).snapshot(&instance);
        }
        self.check_noop("stop-replication-nicely", &instance)?;

        let qsp = instance.qsp();
        for sql in [qsp.stop_io_thread(), qsp.start_sql_thread()] {
            if let Err(e) = self.exec(key, sql).await {
                tracing::error!("{}: StopReplicationNicely: '{}' failed: {}", key, sql, e);
                return Err(OperationError::new(e, Some(instance)));
            }
        }

        if instance.sql_delay == 0 {
            instance = self.wait_for_sql_thread_up_to_date(key, timeout, Duration::ZERO).await?;
        }

        self.stop_both_threads(&instance).await.logged(&instance)?;

        let instance = self.read(key).await?;
        tracing::info!(
            "Stopped replication nicely on {}, Self:{}, Exec:{}",
            key,
            instance.self_binlog_coordinates,
            instance.exec_binlog_coordinates
        );
        Ok(instance)
    }

    /// Wait until the SQL thread has applied everything the IO thread fetched.
    ///
    /// Fails after `overall_timeout` (zero means 24h), or when the executed
    /// position does not move for `stale_timeout` (zero means the configured
    /// reasonable replication lag).
    pub async fn wait_for_sql_thread_up_to_date(
        &self,
        key: &InstanceKey,
        overall_timeout: Duration,
        stale_timeout: Duration,
    ) -> OpResult {
        let overall_timeout = if overall_timeout.is_zero() {
            DEFAULT_OVERALL_TIMEOUT
        } else {
            overall_timeout
        };
        let stale_timeout = if stale_timeout.is_zero() {
            self.config.stale_coordinates_timeout()
        } else {
            stale_timeout
        };

        let started = Instant::now();
        let general_deadline = started + overall_timeout;
        let mut stale_deadline = started + stale_timeout;
        let mut last_exec = BinlogCoordinates::default();
        let mut last_seen: Option<Instance> = None;

        loop {
            match self.reader.read_topology_instance(key).await {
                Ok(instance) => {
                    if instance.sql_thread_up_to_date() {
                        return Ok(instance);
                    }
                    if instance.sql_delay != 0 {
                        let error = Error::InvalidArgument(format!(
                            "WaitForSQLThreadUpToDate: instance {} has SQL Delay {}. Operation is irrelevant",
                            key, instance.sql_delay
                        ));
                        return Err(error).logged(&instance);
                    }
                    if instance.exec_binlog_coordinates != last_exec {
                        // Progress; the staleness clock starts over.
                        stale_deadline = Instant::now() + stale_timeout;
                        last_exec = instance.exec_binlog_coordinates.clone();
                    }
                    last_seen = Some(instance);
                }
                Err(e) => tracing::warn!("WaitForSQLThreadUpToDate: failed reading {}: {}", key, e),
            }

            let now = Instant::now();
            if now >= general_deadline {
                let error = Error::Timeout {
                    operation: "WaitForSQLThreadUpToDate".into(),
                    key: key.clone(),
                    after: overall_timeout,
                };
                tracing::error!("{}", error);
                return Err(OperationError::new(error, last_seen));
            }
            if now >= stale_deadline {
                let error = Error::StaleCoordinates {
                    operation: "WaitForSQLThreadUpToDate".into(),
                    key: key.clone(),
                    after: stale_timeout,
                };
                tracing::error!("{}", error);
                return Err(OperationError::new(error, last_seen));
            }

            tracing::debug!("WaitForSQLThreadUpToDate waiting on {}", key);
            sleep(self.config.retry_interval()).await;
        }
    }

    /// Stop a single replica according to `method`, returning its latest snapshot
    async fn stop_replica_with_method(
        &self,
        replica: Instance,
        method: StopReplicationMethod,
        timeout: Duration,
    ) -> Instance {
        if method == StopReplicationMethod::Nice && !replica.is_mariadb() {
            if let Err(e) = self.stop_replication_nicely(&replica.key, timeout).await {
                tracing::warn!("Could not stop {} nicely: {}", replica.key, e);
            }
        }
        match self.stop_replication(&replica.key).await {
            Ok(updated) => updated,
            Err(e) => snapshot_or(&e, &replica),
        }
    }

    /// Concurrently stop replication on all given replicas
    pub async fn stop_replicas(
        &self,
        replicas: &[Instance],
        method: StopReplicationMethod,
        timeout: Duration,
    ) -> Vec<Instance> {
        if method == StopReplicationMethod::None {
            return replicas.to_vec();
        }
        tracing::debug!("Stopping {} replicas via {}", replicas.len(), method);
        self.fan_out(replicas, move |this, replica| async move {
            this.stop_replica_with_method(replica, method, timeout).await
        })
        .await
    }

    /// Concurrently start replication on all given replicas
    pub async fn start_replicas(&self, replicas: &[Instance]) -> Vec<Instance> {
        tracing::debug!("Starting {} replicas", replicas.len());
        self.fan_out(replicas, |this, replica| async move {
            match this.start_replication(&replica.key).await {
                Ok(updated) => updated,
                Err(e) => snapshot_or(&e, &replica),
            }
        })
        .await
    }

    /// Poll until the executed coordinates reach `target`.
    ///
    /// Returns the snapshot and whether the position matched exactly (as
    /// opposed to having moved past the target). A zero `max_wait` uses the
    /// configured limit.
    pub async fn wait_for_exec_binlog_coordinates_to_reach(
        &self,
        key: &InstanceKey,
        target: &BinlogCoordinates,
        max_wait: Duration,
    ) -> OpResult<(Instance, bool)> {
        let max_wait = if max_wait.is_zero() {
            self.config.exec_coordinates_max_wait()
        } else {
            max_wait
        };
        let started = Instant::now();
        let mut last_seen: Option<Instance> = None;

        loop {
            if started.elapsed() > max_wait {
                let error = Error::Timeout {
                    operation: "WaitForExecBinlogCoordinatesToReach".into(),
                    key: key.clone(),
                    after: max_wait,
                };
                tracing::error!("{}", error);
                return Err(OperationError::new(error, last_seen));
            }

            let instance = match self.reader.read_topology_instance(key).await {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!("WaitForExecBinlogCoordinatesToReach: failed reading {}: {}", key, e);
                    sleep(self.config.retry_interval()).await;
                    continue;
                }
            };

            match instance.exec_binlog_coordinates.cmp(target) {
                Ordering::Less => {
                    last_seen = Some(instance);
                    sleep(self.config.retry_interval()).await;
                }
                Ordering::Equal => return Ok((instance, true)),
                Ordering::Greater => return Ok((instance, false)),
            }
        }
    }

    /// `START SLAVE UNTIL` the given source coordinates, wait to land there
    /// exactly, and stop again.
    pub async fn start_replication_until_master_coordinates(
        &self,
        key: &InstanceKey,
        target: &BinlogCoordinates,
    ) -> OpResult {
        let instance = self.read(key).await?;
        if !instance.is_replica() {
            return Err(Error::NotReplica(key.clone())).snapshot(&instance);
        }
        if !instance.replication_threads_stopped() {
            return Err(Error::ReplicationRunning {
                operation: "StartReplicationUntilMasterCoordinates".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        self.check_noop("start-replication-until", &instance)?;

        tracing::info!("Will start replication on {} until coordinates: {}", key, target);

        let instance = self.maybe_disable_semi_sync_master(instance).await?;
        let instance = self.maybe_enable_semi_sync_replica(instance).await?;

        let statement = Statement::new(instance.qsp().start_until_master_log())
            .bind(&target.log_file)
            .bind(target.log_pos);
        self.exec(key, statement).await.logged(&instance)?;

        let (instance, exact_match) = self
            .wait_for_exec_binlog_coordinates_to_reach(key, target, Duration::ZERO)
            .await?;
        if !exact_match {
            return Err(Error::PastCoordinates {
                key: key.clone(),
                target: target.clone(),
            })
            .logged(&instance);
        }

        self.stop_replication(key).await
    }

    /// Statements that stop whichever threads are running, run `injected`,
    /// and start those same threads again
    pub async fn replication_restart_preserve_statements(
        &self,
        key: &InstanceKey,
        injected: Option<Statement>,
    ) -> Result<Vec<Statement>> {
        let instance = self.reader.read_topology_instance(key).await?;
        let qsp = instance.qsp();
        let mut statements = Vec::new();

        if instance.replication_io_thread_running {
            statements.push(Statement::new(qsp.stop_io_thread()));
        }
        if instance.replication_sql_thread_running {
            statements.push(Statement::new(qsp.stop_sql_thread()));
        }
        if let Some(injected) = injected {
            statements.push(injected);
        }
        if instance.replication_sql_thread_running {
            statements.push(Statement::new(qsp.start_sql_thread()));
        }
        if instance.replication_io_thread_running {
            statements.push(Statement::new(qsp.start_io_thread()));
        }
        Ok(statements)
    }

    /// Set `MASTER_DELAY`, leaving the threads in the state they were found in
    pub async fn delay_replication(&self, key: &InstanceKey, seconds: i64) -> OpResult {
        let delay = u32::try_from(seconds).map_err(|_| {
            Error::InvalidArgument(format!(
                "invalid seconds: {}, it should be greater or equal to 0",
                seconds
            ))
        })?;

        let instance = self.read(key).await?;
        self.check_noop("delay-replication", &instance)?;

        let injected = Statement::new(instance.qsp().change_master_to_master_delay(delay));
        let statements = self
            .replication_restart_preserve_statements(key, Some(injected))
            .await
            .logged(&instance)?;
        for statement in &statements {
            if let Err(e) = self.executor.exec(key, statement).await {
                tracing::error!("{}: DelayReplication: '{}' failed: {}", key, statement, e);
                return Err(OperationError::new(e, Some(instance)));
            }
            tracing::info!("DelayReplication: {} on {}", statement, key);
        }
        self.audit("delay-replication", key, format!("set to {}", delay)).await;

        self.read(key).await
    }

    /// `MASTER_POS_WAIT()` for the given coordinates
    pub async fn master_pos_wait(&self, key: &InstanceKey, coordinates: &BinlogCoordinates) -> OpResult {
        let instance = self.read(key).await?;

        let statement = Statement::new(instance.qsp().select_master_pos_wait())
            .bind(&coordinates.log_file)
            .bind(coordinates.log_pos);
        self.executor.query_rows(key, &statement).await.logged(&instance)?;
        tracing::info!("Instance {} has reached coordinates: {}", key, coordinates);

        self.read(key).await
    }
}
