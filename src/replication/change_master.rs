//! Master change protocol
//!
//! Repointing a replica at a new source, plus the smaller `CHANGE MASTER TO`
//! operations (credentials, SSL, resets). The statement shape for a master
//! change is chosen by [`ChangeMasterVariant::select`], a pure decision
//! table over the replica's GTID dialect, the caller's hint and whether
//! replication threads are configured.

use serde::{Deserialize, Serialize};

use super::{Logged, ReplicationController};
use crate::error::{Error, OpResult, WithSnapshot};
use crate::executor::Statement;
use crate::instance::{
    BinlogCoordinates, Instance, InstanceKey, OperationGtidHint, QueryStatements,
    ReplicationCredentials,
};

/// Statement shape of a master change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeMasterVariant {
    /// MariaDB GTID kept: host and port only
    MariaDbKeepGtid,
    /// MariaDB GTID turned off: explicit file and position
    MariaDbDisableGtid,
    /// MariaDB GTID turned on, from `slave_pos` or `current_pos`
    MariaDbEnableGtid { current_pos: bool },
    /// Oracle GTID kept: host and port only, auto-position stays on
    OracleKeepGtid,
    /// Oracle GTID turned off: explicit file and position
    OracleDisableAutoPosition,
    /// Oracle GTID turned on via auto-position
    OracleEnableAutoPosition,
    /// Plain file and position
    FilePosition,
}

impl ChangeMasterVariant {
    /// Pick the statement shape for `instance`. Branches are tried in order.
    pub fn select(instance: &Instance, hint: OperationGtidHint) -> Self {
        let deny = hint == OperationGtidHint::Deny;
        let force = hint == OperationGtidHint::Force;

        if instance.using_mariadb_gtid && !deny {
            ChangeMasterVariant::MariaDbKeepGtid
        } else if instance.using_mariadb_gtid && deny {
            ChangeMasterVariant::MariaDbDisableGtid
        } else if instance.is_mariadb() && force {
            // A server without replication threads is a master being repointed.
            ChangeMasterVariant::MariaDbEnableGtid {
                current_pos: !instance.replication_threads_exist,
            }
        } else if instance.using_oracle_gtid && !deny {
            ChangeMasterVariant::OracleKeepGtid
        } else if instance.using_oracle_gtid && deny {
            ChangeMasterVariant::OracleDisableAutoPosition
        } else if instance.supports_oracle_gtid && force {
            ChangeMasterVariant::OracleEnableAutoPosition
        } else {
            ChangeMasterVariant::FilePosition
        }
    }

    /// Replication continues by GTID after the change
    pub fn via_gtid(&self) -> bool {
        matches!(
            self,
            ChangeMasterVariant::MariaDbKeepGtid
                | ChangeMasterVariant::MariaDbEnableGtid { .. }
                | ChangeMasterVariant::OracleKeepGtid
                | ChangeMasterVariant::OracleEnableAutoPosition
        )
    }

    /// Bound statement for this variant
    pub fn statement(
        &self,
        qsp: &QueryStatements,
        master: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Statement {
        let host_port = |sql: &str| Statement::new(sql).bind(&master.hostname).bind(master.port);
        let host_port_log = |sql: &str| {
            host_port(sql)
                .bind(&coordinates.log_file)
                .bind(coordinates.log_pos)
        };

        match self {
            ChangeMasterVariant::MariaDbKeepGtid | ChangeMasterVariant::OracleKeepGtid => {
                host_port(qsp.change_master_to_host_port())
            }
            ChangeMasterVariant::MariaDbDisableGtid => {
                host_port_log(qsp.change_master_to_host_port_log_gtid_no())
            }
            ChangeMasterVariant::MariaDbEnableGtid { current_pos } => {
                let position = if *current_pos { "current_pos" } else { "slave_pos" };
                host_port(&qsp.change_master_to_host_port_use_gtid(position))
            }
            ChangeMasterVariant::OracleDisableAutoPosition => {
                host_port_log(qsp.change_master_to_host_port_log_autoposition_no())
            }
            ChangeMasterVariant::OracleEnableAutoPosition => {
                host_port(qsp.change_master_to_host_port_autoposition_yes())
            }
            ChangeMasterVariant::FilePosition => host_port_log(qsp.change_master_to_host_port_log()),
        }
    }
}

/// Threads exist and are not fully stopped
fn replication_active(instance: &Instance) -> bool {
    instance.replication_threads_exist && !instance.replication_threads_stopped()
}

impl ReplicationController {
    /// Point `key` at a new source.
    ///
    /// Replication threads, if configured, must be stopped. Unless
    /// `skip_unresolve` is set the master key is first normalised through
    /// the hostname resolver.
    pub async fn change_master_to(
        &self,
        key: &InstanceKey,
        master_key: &InstanceKey,
        coordinates: &BinlogCoordinates,
        skip_unresolve: bool,
        hint: OperationGtidHint,
    ) -> OpResult {
        let instance = self.read(key).await?;
        if replication_active(&instance) {
            return Err(Error::ReplicationRunning {
                operation: "ChangeMasterTo".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        tracing::debug!(
            "ChangeMasterTo: will attempt changing master on {} to {}, {}",
            key,
            master_key,
            coordinates
        );

        let change_to = if skip_unresolve {
            master_key.clone()
        } else {
            let (unresolved, was_unresolved) = self
                .resolver
                .unresolve_hostname(master_key)
                .await
                .map_err(|e| {
                    tracing::debug!(
                        "ChangeMasterTo: aborting operation on {} due to resolving error on {}: {}",
                        key,
                        master_key,
                        e
                    );
                    e
                })
                .snapshot(&instance)?;
            if was_unresolved {
                tracing::debug!("ChangeMasterTo: Unresolved {} into {}", master_key, unresolved);
            }
            unresolved
        };

        self.check_noop("change-master-to", &instance)?;

        let original_master = instance.master_key.clone();
        let original_exec = instance.exec_binlog_coordinates.clone();

        let variant = ChangeMasterVariant::select(&instance, hint);
        let statement = variant.statement(&instance.qsp(), &change_to, coordinates);

        let mut result = self.executor.exec(key, &statement).await;
        if let Err(e) = &result {
            if instance.using_oracle_gtid && e.is_master_info_init_failure() {
                tracing::debug!("ChangeMasterTo: got {}", e);
                self.reset_master_info_workaround(&instance).await;
                result = self.executor.exec(key, &statement).await;
            }
        }
        result.logged(&instance)?;

        if let Err(e) = self
            .recorder
            .write_master_position_equivalence(&original_master, &original_exec, &change_to, coordinates)
            .await
        {
            tracing::warn!("ChangeMasterTo: cannot record position equivalence on {}: {}", key, e);
        }
        if let Err(e) = self.recorder.reset_instance_relaylog_coordinates_history(key).await {
            tracing::warn!("ChangeMasterTo: cannot reset relay log history of {}: {}", key, e);
        }

        tracing::info!(
            "ChangeMasterTo: Changed master on {} to: {}, {}. GTID: {}",
            key,
            master_key,
            coordinates,
            variant.via_gtid()
        );

        self.read(key).await
    }

    /// Clears the master info repository so a failed `CHANGE MASTER TO` or
    /// `RESET SLAVE` can be retried. See https://bugs.mysql.com/bug.php?id=83713
    async fn reset_master_info_workaround(&self, instance: &Instance) {
        tracing::debug!("workaroundBug83713: {}", instance.key);
        let qsp = instance.qsp();
        for sql in [
            qsp.reset_replica(),
            qsp.start_io_thread(),
            qsp.stop_io_thread(),
            qsp.reset_replica(),
        ] {
            if let Err(e) = self.exec(&instance.key, sql).await {
                tracing::debug!("workaroundBug83713: error on {}: {}", sql, e);
            }
        }
    }

    /// Move the replica to the start of the source's next binary log and
    /// resume replication. Meant for binlog servers whose source was replaced.
    pub async fn skip_to_next_binary_log(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;

        let next = instance
            .exec_binlog_coordinates
            .next_file_coordinates()
            .logged(&instance)?;
        tracing::debug!("Will skip replication on {} to next binary log: {}", key, next.log_file);

        self.change_master_to(key, &instance.master_key, &next, false, OperationGtidHint::Neutral)
            .await?;
        self.audit(
            "skip-binlog",
            key,
            format!("Skipped replication to next binary log: {}", next.log_file),
        )
        .await;

        self.start_replication(key).await
    }

    /// Break replication: forget the source and its coordinates
    pub async fn reset_replication(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if replication_active(&instance) {
            return Err(Error::ReplicationRunning {
                operation: "ResetReplication".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        self.check_noop("reset-replication", &instance)?;

        let qsp = instance.qsp();
        // SHOW SLAVE STATUS keeps reporting the old host until restart unless
        // it is overwritten first.
        self.exec(key, qsp.change_master_to_blank_host()).await.logged(&instance)?;

        let mut result = self.exec(key, qsp.reset_replica_all()).await;
        if let Err(e) = &result {
            if e.is_master_info_init_failure() {
                tracing::debug!("ResetReplication: got {}", e);
                self.reset_master_info_workaround(&instance).await;
                result = self.exec(key, qsp.reset_replica_all()).await;
            }
        }
        result.logged(&instance)?;
        tracing::info!("Reset replication {}", key);

        self.read(key).await
    }

    /// `RESET MASTER`. Destroys the binary logs.
    pub async fn reset_master(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if replication_active(&instance) {
            return Err(Error::ReplicationRunning {
                operation: "ResetMaster".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        self.check_noop("reset-master", &instance)?;

        self.exec(key, instance.qsp().reset_master()).await.logged(&instance)?;
        tracing::info!("Reset master {}", key);

        self.read(key).await
    }

    /// Change the user, password and SSL material used to connect to the source
    pub async fn change_master_credentials(
        &self,
        key: &InstanceKey,
        credentials: &ReplicationCredentials,
    ) -> OpResult {
        let instance = self.read(key).await?;
        if credentials.user.is_empty() {
            return Err(Error::EmptyCredentials(format!(
                "empty user in ChangeMasterCredentials() for {}",
                key
            )))
            .logged(&instance);
        }
        if replication_active(&instance) {
            return Err(Error::ReplicationRunning {
                operation: "ChangeMasterCredentials".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        tracing::debug!("ChangeMasterTo: will attempt changing master credentials on {}", key);
        self.check_noop("change-master-credentials", &instance)?;

        let statement = credentials_statement(&instance.qsp(), credentials);
        self.executor.exec(key, &statement).await.logged(&instance)?;
        tracing::info!("ChangeMasterTo: Changed master credentials on {}", key);

        self.read(key).await
    }

    /// `CHANGE MASTER TO MASTER_SSL=1`
    pub async fn enable_master_ssl(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if replication_active(&instance) {
            return Err(Error::ReplicationRunning {
                operation: "EnableMasterSSL".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        self.check_noop("enable-master-ssl", &instance)?;

        self.exec(key, instance.qsp().change_master_to_master_ssl())
            .await
            .logged(&instance)?;
        tracing::info!("EnableMasterSSL: Enabled SSL replication on {}", key);

        self.read(key).await
    }

    /// `GET_SOURCE_PUBLIC_KEY=1`, needed for `caching_sha2_password` without SSL
    pub async fn enable_master_get_source_public_key(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if replication_active(&instance) {
            return Err(Error::ReplicationRunning {
                operation: "EnableMasterGetSourcePublicKey".into(),
                key: key.clone(),
            })
            .snapshot(&instance);
        }
        self.check_noop("enable-master-get-source-public-key", &instance)?;

        self.exec(key, instance.qsp().change_master_to_get_source_public_key())
            .await
            .logged(&instance)?;
        tracing::info!("EnableMasterGetSourcePublicKey: Enabled GetSourcePublicKey replication on {}", key);

        self.read(key).await
    }
}

fn credentials_statement(qsp: &QueryStatements, credentials: &ReplicationCredentials) -> Statement {
    let mut params = vec![qsp.master_user_param()];
    let mut args: Vec<&String> = vec![&credentials.user];

    if !credentials.password.is_empty() {
        params.push(qsp.master_password_param());
        args.push(&credentials.password);
    }
    if !credentials.ssl_ca_cert.is_empty() {
        params.push(qsp.master_ssl_ca_param());
        args.push(&credentials.ssl_ca_cert);
    }
    if !credentials.ssl_cert.is_empty() {
        params.push(qsp.master_ssl_cert_param());
        args.push(&credentials.ssl_cert);
    }
    if !credentials.ssl_key.is_empty() {
        params.push(qsp.master_ssl_param());
        params.push(qsp.master_ssl_key_param());
        args.push(&credentials.ssl_key);
    }

    args.into_iter()
        .fold(Statement::new(qsp.change_master_to_with_params(&params)), |s, a| s.bind(a))
}
