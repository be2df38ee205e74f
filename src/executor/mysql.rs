//! MySQL Topology Executor
//!
//! Talks to every server of a replication topology through one small
//! connection pool per instance. Statements are sent over the text protocol
//! (see [`Statement::render`]) and results are decoded column by column as
//! text.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Connection, Executor, MySqlPool, Row};
use tokio::sync::RwLock;

use super::statement::{SqlRow, Statement, NO_BACKSLASH_ESCAPES_OFF};
use super::traits::{InstanceReader, StatementExecutor};
use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::instance::{BinlogCoordinates, Instance, InstanceKey, PromotionRule};

/// Global variables read for every instance
const INSTANCE_VARIABLES: &[&str] = &[
    "version",
    "version_comment",
    "server_id",
    "server_uuid",
    "read_only",
    "log_bin",
    "gtid_mode",
    "gtid_purged",
    "rpl_semi_sync_master_enabled",
    "rpl_semi_sync_source_enabled",
    "rpl_semi_sync_slave_enabled",
    "rpl_semi_sync_replica_enabled",
    "rpl_semi_sync_master_wait_for_slave_count",
    "rpl_semi_sync_source_wait_for_replica_count",
];

/// sqlx-backed topology access
pub struct MySqlTopology {
    config: TopologyConfig,
    pools: RwLock<HashMap<InstanceKey, MySqlPool>>,
    /// Last snapshot read from each instance
    instances: RwLock<HashMap<InstanceKey, Instance>>,
}

impl MySqlTopology {
    pub fn new(config: &TopologyConfig) -> Self {
        Self {
            config: config.clone(),
            pools: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Connection pool for an instance, created on first use
    async fn pool(&self, key: &InstanceKey) -> Result<MySqlPool> {
        if let Some(pool) = self.pools.read().await.get(key) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(key) {
            return Ok(pool.clone());
        }

        let options = connect_options(&self.config, key);
        tracing::debug!("Connecting to {}", key);
        let pool = MySqlPoolOptions::new()
            .max_connections(self.config.pool_size)
            .acquire_timeout(self.config.connect_timeout())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(NO_BACKSLASH_ESCAPES_OFF).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        pools.insert(key.clone(), pool.clone());
        Ok(pool)
    }

    /// Close all pools
    pub async fn close(&self) {
        let mut pools = self.pools.write().await;
        for (key, pool) in pools.drain() {
            tracing::debug!("Closing connections to {}", key);
            pool.close().await;
        }
    }

    async fn read_variables(&self, key: &InstanceKey, sql: &str) -> Result<HashMap<String, String>> {
        let rows = self.query_rows(key, &Statement::new(sql)).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0).to_lowercase(), row.get(1)))
            .collect())
    }

    /// Single-value query configured by the operator, run on the instance itself
    async fn detect(&self, key: &InstanceKey, query: &Option<String>) -> Option<String> {
        let query = query.as_deref().filter(|q| !q.trim().is_empty())?;
        match self.query_row(key, &Statement::new(query)).await {
            Ok(row) => row.map(|r| r.get(0)),
            Err(e) => {
                tracing::warn!("Detection query failed on {}: {}", key, e);
                None
            }
        }
    }

    async fn read_fresh(&self, key: &InstanceKey) -> Result<Instance> {
        let mut instance = Instance::new(key.clone());

        let in_list = INSTANCE_VARIABLES
            .iter()
            .map(|v| format!("'{}'", v))
            .collect::<Vec<_>>()
            .join(", ");
        let vars = self
            .read_variables(key, &format!("show global variables where Variable_name in ({})", in_list))
            .await?;
        apply_variables(&mut instance, &vars);

        let status = self
            .read_variables(
                key,
                "show global status where Variable_name in ('Rpl_semi_sync_master_clients', 'Rpl_semi_sync_source_clients')",
            )
            .await?;
        instance.semi_sync_master_clients = status
            .values()
            .find_map(|v| v.parse().ok())
            .unwrap_or(0);

        let qsp = instance.qsp();

        if let Some(row) = self.query_row(key, &Statement::new(qsp.show_master_status())).await? {
            instance.self_binlog_coordinates = BinlogCoordinates::new(
                row.get_any(&["File"]).unwrap_or_default(),
                row.get_u64(&["Position"]),
            );
            instance.executed_gtid_set = row.get_any(&["Executed_Gtid_Set"]).unwrap_or_default();
        }

        if let Some(row) = self.query_row(key, &Statement::new(qsp.show_replica_status())).await? {
            apply_replica_status(&mut instance, &row);
        }

        let hosts = self.query_rows(key, &Statement::new(qsp.show_replica_hosts())).await?;
        instance.replicas = hosts
            .iter()
            .filter_map(|row| {
                let host = row.get_any(&["Host"])?;
                let port = port_value(row.get_u64(&["Port"]), &host)?;
                Some(InstanceKey::new(host, port))
            })
            .filter(InstanceKey::is_valid)
            .collect();

        if let Some(rule) = self.detect(key, &self.config.detect_promotion_rule_query).await {
            match PromotionRule::from_str(&rule) {
                Ok(rule) => instance.promotion_rule = rule,
                Err(e) => tracing::warn!("Ignoring promotion rule of {}: {}", key, e),
            }
        }
        if let Some(priority) = self.detect(key, &self.config.detect_semi_sync_priority_query).await {
            instance.semi_sync_priority = priority.trim().parse().unwrap_or(0);
        }
        instance.cluster_name = self
            .detect(key, &self.config.detect_cluster_name_query)
            .await
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| key.to_string());

        instance.last_checked = Some(chrono::Utc::now());
        Ok(instance)
    }
}

/// Connection settings for one instance. Credentials are passed as fields,
/// never through a URL, so they need no escaping.
fn connect_options(config: &TopologyConfig, key: &InstanceKey) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&key.hostname)
        .port(key.port)
        .username(&config.user)
        .password(&config.password)
}

/// Fill version, GTID and semi-sync fields from global variables
fn apply_variables(instance: &mut Instance, vars: &HashMap<String, String>) {
    let var = |name: &str| vars.get(name).cloned().unwrap_or_default();

    instance.version = var("version");
    if var("version_comment").to_lowercase().contains("maxscale") {
        instance.version.push_str("-maxscale");
    }
    instance.server_id = var("server_id").parse().unwrap_or(0);
    instance.server_uuid = var("server_uuid");
    instance.read_only = parse_bool(&var("read_only"));
    instance.log_bin_enabled = parse_bool(&var("log_bin"));
    // gtid_mode exists on every MySQL from 5.6 on, enabled or not.
    let gtid_mode = var("gtid_mode");
    instance.supports_oracle_gtid =
        !instance.is_mariadb() && !gtid_mode.is_empty() && !gtid_mode.eq_ignore_ascii_case("OFF");
    instance.gtid_purged = var("gtid_purged");

    instance.semi_sync_master_plugin_new_version = vars.contains_key("rpl_semi_sync_source_enabled");
    instance.semi_sync_replica_plugin_new_version = vars.contains_key("rpl_semi_sync_replica_enabled");
    instance.semi_sync_master_enabled = parse_bool(&var("rpl_semi_sync_master_enabled"))
        || parse_bool(&var("rpl_semi_sync_source_enabled"));
    instance.semi_sync_replica_enabled = parse_bool(&var("rpl_semi_sync_slave_enabled"))
        || parse_bool(&var("rpl_semi_sync_replica_enabled"));
    instance.semi_sync_master_wait_for_replica_count = var("rpl_semi_sync_master_wait_for_slave_count")
        .parse()
        .or_else(|_| var("rpl_semi_sync_source_wait_for_replica_count").parse())
        .unwrap_or(0);
}

/// A port column that fits a TCP port, logging the ones that do not
fn port_value(value: u64, host: &str) -> Option<u16> {
    match u16::try_from(value) {
        Ok(port) => Some(port),
        Err(_) => {
            tracing::warn!("Ignoring out of range port {} for {}", value, host);
            None
        }
    }
}

/// Fill replication fields from a `SHOW SLAVE STATUS` / `SHOW REPLICA STATUS` row
fn apply_replica_status(instance: &mut Instance, row: &SqlRow) {
    instance.replication_threads_exist = true;
    let master_host = row.get_any(&["Source_Host", "Master_Host"]).unwrap_or_default();
    let master_port = port_value(row.get_u64(&["Source_Port", "Master_Port"]), &master_host).unwrap_or(0);
    instance.master_key = InstanceKey::new(master_host, master_port);
    instance.master_uuid = row.get_any(&["Source_UUID", "Master_UUID"]).unwrap_or_default();
    instance.replication_io_thread_running =
        row.get_any(&["Replica_IO_Running", "Slave_IO_Running"]).as_deref() == Some("Yes");
    instance.replication_sql_thread_running =
        row.get_any(&["Replica_SQL_Running", "Slave_SQL_Running"]).as_deref() == Some("Yes");
    instance.read_binlog_coordinates = BinlogCoordinates::new(
        row.get_any(&["Source_Log_File", "Master_Log_File"]).unwrap_or_default(),
        row.get_u64(&["Read_Source_Log_Pos", "Read_Master_Log_Pos"]),
    );
    instance.exec_binlog_coordinates = BinlogCoordinates::new(
        row.get_any(&["Relay_Source_Log_File", "Relay_Master_Log_File"]).unwrap_or_default(),
        row.get_u64(&["Exec_Source_Log_Pos", "Exec_Master_Log_Pos"]),
    );
    instance.relaylog_coordinates = BinlogCoordinates::new(
        row.get_any(&["Relay_Log_File"]).unwrap_or_default(),
        row.get_u64(&["Relay_Log_Pos"]),
    );
    instance.last_sql_error = row.get_any(&["Last_SQL_Error"]).unwrap_or_default();
    instance.last_io_error = row.get_any(&["Last_IO_Error"]).unwrap_or_default();
    let sql_delay = row.get_u64(&["SQL_Delay"]);
    instance.sql_delay = u32::try_from(sql_delay).unwrap_or_else(|_| {
        tracing::warn!("{}: SQL_Delay {} out of range", instance.key, sql_delay);
        u32::MAX
    });
    instance.using_oracle_gtid = row.get_u64(&["Auto_Position"]) == 1;
    instance.using_mariadb_gtid = row
        .get_any(&["Using_Gtid"])
        .map(|v| !v.is_empty() && !v.eq_ignore_ascii_case("no"))
        .unwrap_or(false);
    if let Some(executed) = row.get_any(&["Executed_Gtid_Set"]).filter(|s| !s.is_empty()) {
        instance.executed_gtid_set = executed;
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_uppercase().as_str(), "ON" | "1" | "YES" | "TRUE")
}

/// Surface the server error number of a failed statement
fn map_sqlx_error(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
            return Error::statement(Some(mysql.number()), mysql.message());
        }
    }
    Error::Database(e)
}

fn decode_row(row: &MySqlRow) -> SqlRow {
    let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<Vec<u8>>, _>(i)
                .ok()
                .flatten()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .collect();
    SqlRow::new(columns, values)
}

#[async_trait]
impl StatementExecutor for MySqlTopology {
    async fn exec(&self, key: &InstanceKey, statement: &Statement) -> Result<u64> {
        let sql = statement.render()?;
        let pool = self.pool(key).await?;
        tracing::debug!("Executing on {}: {}", key, sql);
        let result = pool.execute(sql.as_str()).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn exec_in_session(&self, key: &InstanceKey, statements: &[Statement]) -> Result<()> {
        let rendered = statements.iter().map(Statement::render).collect::<Result<Vec<_>>>()?;
        let pool = self.pool(key).await?;
        let mut conn = pool.acquire().await.map_err(map_sqlx_error)?;
        for sql in &rendered {
            tracing::debug!("Executing in session on {}: {}", key, sql);
            if let Err(e) = (&mut *conn).execute(sql.as_str()).await {
                // Session state such as GTID_NEXT must not reach the next borrower.
                tracing::warn!("Discarding session on {} after failure: {}", key, e);
                if let Err(close_err) = conn.detach().close().await {
                    tracing::debug!("Closing session on {}: {}", key, close_err);
                }
                return Err(map_sqlx_error(e));
            }
        }
        Ok(())
    }

    async fn query_rows(&self, key: &InstanceKey, statement: &Statement) -> Result<Vec<SqlRow>> {
        let sql = statement.render()?;
        let pool = self.pool(key).await?;
        let rows = pool.fetch_all(sql.as_str()).await.map_err(map_sqlx_error)?;
        Ok(rows.iter().map(decode_row).collect())
    }
}

#[async_trait]
impl InstanceReader for MySqlTopology {
    async fn read_topology_instance(&self, key: &InstanceKey) -> Result<Instance> {
        match self.read_fresh(key).await {
            Ok(instance) => {
                self.instances.write().await.insert(key.clone(), instance.clone());
                Ok(instance)
            }
            Err(e) => {
                if let Some(cached) = self.instances.write().await.get_mut(key) {
                    cached.is_last_check_valid = false;
                }
                tracing::debug!("Failed to read {}: {}", key, e);
                Err(e)
            }
        }
    }

    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(key).cloned())
    }

    async fn read_replica_instances(&self, master_key: &InstanceKey) -> Result<Vec<Instance>> {
        let instances = self.instances.read().await;
        let mut replicas: Vec<Instance> = instances
            .values()
            .filter(|i| &i.master_key == master_key)
            .cloned()
            .collect();
        replicas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(replicas)
    }
}
