//! Recovery and maintenance operations
//!
//! Skipping a failed event, replication credentials, read-only flips,
//! binary log housekeeping and Pseudo-GTID injection.

use rand::Rng;

use super::{Logged, ReplicationController};
use crate::error::{Error, OpResult, Result, WithSnapshot};
use crate::executor::Statement;
use crate::instance::{BinlogCoordinates, Instance, InstanceKey, ReplicationCredentials};

/// Fallback credentials source; the table name did not change in 8.x
const SLAVE_MASTER_INFO_QUERY: &str = "select ifnull(max(User_name), '') as user, \
     ifnull(max(User_password), '') as password from mysql.slave_master_info";

impl ReplicationController {
    /// Skip the single event the SQL thread failed on, then restart replication.
    ///
    /// Requires a replica with a stopped SQL thread and a recorded SQL error.
    pub async fn skip_query(&self, key: &InstanceKey) -> OpResult {
        let instance = self.read(key).await?;
        if !instance.is_replica() {
            return Err(Error::NotReplica(key.clone())).snapshot(&instance);
        }
        if instance.replication_sql_thread_running {
            return Err(Error::SqlThreadRunning(key.clone())).snapshot(&instance);
        }
        if instance.last_sql_error.is_empty() {
            return Err(Error::NoSqlError(key.clone())).snapshot(&instance);
        }
        self.check_noop("skip-query", &instance)?;

        tracing::debug!("Skipping one query on {}", key);
        if instance.using_oracle_gtid {
            self.skip_query_oracle_gtid(&instance).await.logged(&instance)?;
        } else if instance.using_mariadb_gtid {
            return Err(Error::DialectUnsupported(format!(
                "{} is replicating with MariaDB GTID. To skip a query first disable GTID, then skip, then enable GTID again",
                key
            )))
            .logged(&instance);
        } else {
            self.exec(key, instance.qsp().set_skip_counter()).await.logged(&instance)?;
        }
        self.audit("skip-query", key, "Skipped one query").await;

        self.start_replication(key).await
    }

    /// Commit an empty transaction under the GTID the replica is stuck on
    async fn skip_query_oracle_gtid(&self, instance: &Instance) -> Result<()> {
        let next_gtid = instance.next_gtid()?;
        if next_gtid.is_empty() {
            return Err(Error::Gtid(format!("empty next GTID on {}", instance.key)));
        }
        let session = [
            Statement::new("set gtid_next=?").bind(&next_gtid),
            Statement::new("begin"),
            Statement::new("commit"),
            Statement::new("set gtid_next='automatic'"),
        ];
        self.executor.exec_in_session(&instance.key, &session).await
    }

    /// Credentials the replica uses for its source.
    ///
    /// The configured query is tried first (user, password, SSL CA, SSL
    /// cert, SSL key by column position); `mysql.slave_master_info` is the
    /// fallback.
    pub async fn read_replication_credentials(&self, key: &InstanceKey) -> Result<ReplicationCredentials> {
        if let Some(query) = self.config.replication_credentials_query.as_deref() {
            match self.credentials_from_query(key, query).await {
                Ok(credentials) => return Ok(credentials),
                Err(e) => tracing::error!("{}: {}", key, e),
            }
        }

        let row = self
            .executor
            .query_row(key, &Statement::new(SLAVE_MASTER_INFO_QUERY))
            .await?
            .unwrap_or_default();
        let credentials = ReplicationCredentials {
            user: row.get(0),
            password: row.get(1),
            ..Default::default()
        };
        if credentials.user.is_empty() {
            let error = Error::EmptyCredentials(format!("empty username found in mysql.slave_master_info on {}", key));
            tracing::error!("{}", error);
            return Err(error);
        }
        Ok(credentials)
    }

    async fn credentials_from_query(&self, key: &InstanceKey, query: &str) -> Result<ReplicationCredentials> {
        let credentials = match self.executor.query_row(key, &Statement::new(query)).await? {
            Some(row) => ReplicationCredentials {
                user: row.get(0),
                password: row.get(1),
                ssl_ca_cert: row.get(2),
                ssl_cert: row.get(3),
                ssl_key: row.get(4),
            },
            None => ReplicationCredentials::default(),
        };
        if credentials.user.is_empty() {
            return Err(Error::EmptyCredentials(
                "empty username retrieved by replication_credentials_query".into(),
            ));
        }
        Ok(credentials)
    }

    /// Set or clear `read_only`.
    ///
    /// On an instance with positive semi-sync priority the source-side
    /// semi-sync flag is turned on before accepting writes and off again
    /// after going read-only.
    pub async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> OpResult {
        let instance = self.read(key).await?;
        self.check_noop("set-read-only", &instance)?;

        if instance.semi_sync_priority > 0 && !read_only {
            self.set_semi_sync_master(key, true).await?;
        }

        self.exec(key, Statement::new("set global read_only = ?").bind(read_only))
            .await
            .logged(&instance)?;
        if self.config.use_super_read_only {
            // Not every server has super_read_only; best effort.
            if let Err(e) = self
                .exec(key, Statement::new("set global super_read_only = ?").bind(read_only))
                .await
            {
                tracing::error!("{}: cannot set super_read_only: {}", key, e);
            }
        }

        let instance = self.read(key).await?;
        if instance.semi_sync_priority > 0 && read_only {
            self.set_semi_sync_master(key, false).await?;
        }

        tracing::info!("instance {} read_only: {}", key, read_only);
        self.audit("read-only", key, format!("set as {}", read_only)).await;
        Ok(instance)
    }

    /// `KILL QUERY` on the given connection id
    pub async fn kill_query(&self, key: &InstanceKey, process_id: i64) -> OpResult {
        let instance = self.read(key).await?;
        self.check_noop("kill-query", &instance)?;

        self.exec(key, Statement::new("kill query ?").bind(process_id))
            .await
            .logged(&instance)?;

        let instance = self.read(key).await?;
        tracing::info!("Killed query on {}", key);
        self.audit("kill-query", key, format!("Killed query {}", process_id)).await;
        Ok(instance)
    }

    /// Rotate the binary log `count` times
    pub async fn flush_binary_logs(&self, key: &InstanceKey, count: u32) -> OpResult {
        let instance = self.read(key).await?;
        self.check_noop("flush-binary-logs", &instance)?;

        for _ in 0..count {
            self.exec(key, "flush binary logs").await.logged(&instance)?;
        }
        tracing::info!("flush-binary-logs count={} on {}", count, key);
        self.audit("flush-binary-logs", key, "success").await;

        self.read(key).await
    }

    /// Rotate the binary log until `log_file` is the current one
    pub async fn flush_binary_logs_to(&self, key: &InstanceKey, log_file: &str) -> OpResult {
        let instance = self.read(key).await?;

        let distance = instance
            .self_binlog_coordinates
            .file_number_distance(&BinlogCoordinates::new(log_file, 0));
        let count = u32::try_from(distance)
            .map_err(|_| {
                Error::InvalidArgument(format!(
                    "FlushBinaryLogsTo: target log file {} is smaller than current log file {}",
                    log_file, instance.self_binlog_coordinates.log_file
                ))
            })
            .logged(&instance)?;

        self.flush_binary_logs(key, count).await
    }

    /// `PURGE BINARY LOGS TO`; the target may not be past the current log
    pub async fn purge_binary_logs_to(&self, key: &InstanceKey, log_file: &str) -> OpResult {
        let instance = self.read(key).await?;

        let distance = instance
            .self_binlog_coordinates
            .file_number_distance(&BinlogCoordinates::new(log_file, 0));
        if distance > 0 {
            return Err(Error::InvalidArgument(format!(
                "PurgeBinaryLogsTo: target log file {} is newer than current log file {}",
                log_file, instance.self_binlog_coordinates.log_file
            )))
            .logged(&instance);
        }
        self.check_noop("purge-binary-logs", &instance)?;

        self.exec(key, Statement::new("purge binary logs to ?").bind(log_file))
            .await
            .logged(&instance)?;
        tracing::info!("purge-binary-logs to={} on {}", log_file, key);
        self.audit("purge-binary-logs", key, "success").await;

        self.read(key).await
    }

    /// `SET GLOBAL gtid_purged`
    pub async fn set_gtid_purged(&self, instance: &Instance, gtid_purged: &str) -> Result<()> {
        if self.noop {
            return Err(Error::Noop {
                operation: "set-gtid-purged".into(),
                key: instance.key.clone(),
            });
        }
        self.exec(&instance.key, Statement::new("set global gtid_purged := ?").bind(gtid_purged))
            .await?;
        Ok(())
    }

    /// Server-side `GTID_SUBTRACT(set, subset)`
    pub async fn gtid_subtract(&self, key: &InstanceKey, gtid_set: &str, gtid_subset: &str) -> Result<String> {
        let statement = Statement::new("select gtid_subtract(?, ?)")
            .bind(gtid_set)
            .bind(gtid_subset);
        let row = self.executor.query_row(key, &statement).await?;
        Ok(row.map(|r| r.get(0)).unwrap_or_default())
    }

    /// Whether the server reports a binary log status, and its executed GTID set
    pub async fn show_master_status(&self, instance: &Instance) -> Result<(bool, String)> {
        let row = self
            .executor
            .query_row(&instance.key, &Statement::new(instance.qsp().show_master_status()))
            .await?;
        Ok(match row {
            Some(row) => (true, row.get_named("Executed_Gtid_Set").unwrap_or_default()),
            None => (false, String::new()),
        })
    }

    /// Names of the binary logs present on the server, oldest first
    pub async fn show_binary_logs(&self, key: &InstanceKey) -> Result<Vec<String>> {
        let rows = self
            .executor
            .query_rows(key, &Statement::new("show binary logs"))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_named("Log_name"))
            .collect())
    }

    /// Drop a non-existent view whose name encodes time, server id and a
    /// random tag. Returns the hint.
    async fn inject_pseudo_gtid(&self, instance: &Instance) -> Result<String> {
        if self.noop {
            return Err(Error::Noop {
                operation: "inject-pseudo-gtid".into(),
                key: instance.key.clone(),
            });
        }
        let hint = format!(
            "{:08x}:{:08x}:{:016x}",
            chrono::Utc::now().timestamp(),
            instance.server_id,
            rand::thread_rng().gen::<u64>()
        );
        let sql = format!(
            "drop view if exists `{}`.`_asc:{}`",
            self.config.pseudo_gtid_schema, hint
        );
        self.exec(&instance.key, sql).await?;
        Ok(hint)
    }

    /// Whether our grants allow dropping views in the Pseudo-GTID schema.
    /// Answers are cached per instance.
    async fn can_inject_pseudo_gtid(&self, key: &InstanceKey) -> Result<bool> {
        let ttl = self.config.grants_cache_ttl();
        if let Some((checked_at, can_inject)) = self.grants.read().await.get(key) {
            if checked_at.elapsed() < ttl {
                return Ok(*can_inject);
            }
        }

        let rows = self
            .executor
            .query_rows(key, &Statement::new("show grants for current_user()"))
            .await?;
        let schema = &self.config.pseudo_gtid_schema;
        let can_inject = rows
            .iter()
            .flat_map(|row| row.values.iter().flatten())
            .any(|grant| grant_allows_drop(grant, schema));

        self.grants
            .write()
            .await
            .insert(key.clone(), (tokio::time::Instant::now(), can_inject));
        Ok(can_inject)
    }

    /// Inject a Pseudo-GTID entry on a writable instance when our grants
    /// permit it. Returns whether an entry was injected.
    pub async fn check_and_inject_pseudo_gtid_on_writer(&self, instance: &Instance) -> Result<bool> {
        if instance.read_only {
            let error = Error::InvalidArgument(format!(
                "CheckAndInjectPseudoGTIDOnWriter: instance is read-only: {}",
                instance.key
            ));
            tracing::error!("{}", error);
            return Err(error);
        }
        if !instance.is_last_check_valid {
            return Ok(false);
        }
        if !self.can_inject_pseudo_gtid(&instance.key).await? {
            tracing::warn!(
                "AutoPseudoGTID enabled, but no privileges on {} to inject pseudo-gtid",
                instance.key
            );
            return Ok(false);
        }

        let hint = self.inject_pseudo_gtid(instance).await.map_err(|e| {
            tracing::error!("{}: {}", instance.key, e);
            e
        })?;
        tracing::debug!("Injected pseudo-gtid {} on {}", hint, instance.key);
        self.recorder
            .register_injected_pseudo_gtid(&instance.cluster_name)
            .await?;
        Ok(true)
    }
}

/// A `SHOW GRANTS` line covering `DROP` on every schema or on `schema`
fn grant_allows_drop(grant: &str, schema: &str) -> bool {
    let on_schema = [format!(" ON `{}`.*", schema), format!(" ON \"{}\".*", schema)];

    grant.contains("GRANT ALL PRIVILEGES ON *.*")
        || (grant.contains("DROP") && grant.contains(" ON *.*"))
        || on_schema
            .iter()
            .any(|on| grant.contains(&format!("GRANT ALL PRIVILEGES{}", on)))
        || (grant.contains("DROP") && on_schema.iter().any(|on| grant.contains(on.as_str())))
}
