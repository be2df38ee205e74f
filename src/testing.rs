//! In-memory replication topology for controller tests
//!
//! `FakeTopology` plays every collaborator at once: it serves snapshots,
//! interprets the replication statements it receives against its simulated
//! servers, resolves hostname aliases and records audit bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::WolfReplConfig;
use crate::error::{Error, Result};
use crate::executor::{HostnameResolver, InstanceReader, SqlRow, Statement, StatementExecutor, TopologyRecorder};
use crate::instance::{BinlogCoordinates, Instance, InstanceKey};
use crate::replication::ReplicationController;

const PORT: u16 = 3306;

/// How the simulated SQL thread moves on each read of a replica
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Progress {
    /// Catch up at once (up to any `UNTIL` target)
    #[default]
    Immediate,
    /// Apply this many bytes per read
    Step(u64),
    /// Never apply anything
    Stalled,
    /// Catch up at once, running straight past any `UNTIL` target
    IgnoreUntil,
}

type Equivalence = (InstanceKey, BinlogCoordinates, InstanceKey, BinlogCoordinates);

struct Node {
    instance: Instance,
    progress: Progress,
    until: Option<BinlogCoordinates>,
    io_broken: bool,
    failing_reads: u32,
}

impl Node {
    fn advance(&mut self) {
        let honour_until = self.progress != Progress::IgnoreUntil;
        let instance = &mut self.instance;
        if !instance.replication_sql_thread_running {
            return;
        }

        let target = match &self.until {
            Some(until) if honour_until && *until < instance.read_binlog_coordinates => until.clone(),
            _ => instance.read_binlog_coordinates.clone(),
        };
        let exec = &mut instance.exec_binlog_coordinates;
        if *exec < target {
            match self.progress {
                Progress::Stalled => {}
                Progress::Immediate | Progress::IgnoreUntil => *exec = target,
                Progress::Step(step) => {
                    if exec.same_file(&target) {
                        exec.log_pos = (exec.log_pos + step).min(target.log_pos);
                    } else {
                        *exec = target;
                    }
                }
            }
        }

        if let Some(until) = &self.until {
            if honour_until && instance.exec_binlog_coordinates >= *until {
                instance.replication_sql_thread_running = false;
                self.until = None;
            }
        }
    }

    fn start_io(&mut self) {
        self.instance.replication_io_thread_running = !self.io_broken;
    }
}

#[derive(Default)]
struct State {
    nodes: HashMap<InstanceKey, Node>,
    next_server_id: u32,
    statements: Vec<(InstanceKey, String)>,
    sessions: Vec<(InstanceKey, Vec<String>)>,
    /// Sessions closed after a failed statement
    discarded_sessions: Vec<InstanceKey>,
    queries: Vec<(InstanceKey, String)>,
    failures: Vec<(InstanceKey, String, Error)>,
    scripted: Vec<(InstanceKey, String, Vec<SqlRow>)>,
    aliases: HashMap<String, String>,
    audits: Vec<(String, InstanceKey, String)>,
    equivalences: Vec<Equivalence>,
    relaylog_resets: Vec<InstanceKey>,
    pseudo_gtid_clusters: Vec<String>,
}

impl State {
    fn take_failure(&mut self, key: &InstanceKey, sql: &str) -> Option<Error> {
        let position = self
            .failures
            .iter()
            .position(|(k, prefix, _)| k == key && sql.starts_with(prefix.as_str()))?;
        Some(self.failures.remove(position).2)
    }

    fn node(&mut self, key: &InstanceKey) -> Result<&mut Node> {
        self.nodes
            .get_mut(key)
            .ok_or_else(|| Error::InstanceNotFound(key.clone()))
    }

    fn move_replica(&mut self, replica: &InstanceKey, from: &InstanceKey, to: Option<&InstanceKey>) {
        if let Some(old) = self.nodes.get_mut(from) {
            old.instance.replicas.retain(|k| k != replica);
        }
        if let Some(new) = to.and_then(|k| self.nodes.get_mut(k)) {
            if !new.instance.replicas.contains(replica) {
                new.instance.replicas.push(replica.clone());
            }
        }
    }

    /// Interpret one statement against the simulated server
    fn apply(&mut self, key: &InstanceKey, sql: &str) -> Result<()> {
        let normalized = sql
            .replace("replication source", "master")
            .replace(" replica", " slave")
            .replace("sql_replica_", "sql_slave_")
            .replace("source_", "master_");
        let node = self.node(key)?;
        let instance = &mut node.instance;

        match normalized.as_str() {
            "stop slave" => {
                instance.replication_io_thread_running = false;
                instance.replication_sql_thread_running = false;
                node.until = None;
            }
            "start slave" => {
                if instance.replication_threads_exist {
                    instance.replication_sql_thread_running = true;
                    node.until = None;
                    node.start_io();
                }
            }
            "stop slave io_thread" => instance.replication_io_thread_running = false,
            "start slave io_thread" => node.start_io(),
            "stop slave sql_thread" => instance.replication_sql_thread_running = false,
            "start slave sql_thread" => instance.replication_sql_thread_running = true,
            "reset slave" => instance.relaylog_coordinates = BinlogCoordinates::default(),
            "reset slave all" => {
                let old_master = std::mem::take(&mut instance.master_key);
                instance.replication_threads_exist = false;
                instance.replication_io_thread_running = false;
                instance.replication_sql_thread_running = false;
                instance.read_binlog_coordinates = BinlogCoordinates::default();
                instance.exec_binlog_coordinates = BinlogCoordinates::default();
                instance.using_mariadb_gtid = false;
                instance.using_oracle_gtid = false;
                self.move_replica(key, &old_master, None);
            }
            "reset master" | "reset binary logs and gtids" => {
                instance.self_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000001", 4);
                instance.executed_gtid_set.clear();
                instance.gtid_purged.clear();
            }
            "flush binary logs" => {
                instance.self_binlog_coordinates = instance.self_binlog_coordinates.next_file_coordinates()?;
            }
            "set global sql_slave_skip_counter := 1" => instance.last_sql_error.clear(),
            "set global read_only = 1" => instance.read_only = true,
            "set global read_only = 0" => instance.read_only = false,
            s if s.starts_with("set global super_read_only")
                || s.starts_with("purge binary logs to ")
                || s.starts_with("kill query ")
                || s.starts_with("drop view if exists ") => {}
            s if s.starts_with("set global gtid_purged := ") => {
                instance.gtid_purged = unquote(&s["set global gtid_purged := ".len()..]);
            }
            s if s.starts_with("set @@global.rpl_semi_sync_") => {
                let (variable, value) = s.split_once('=').unwrap_or((s, "0"));
                let enabled = value.trim() == "1";
                if variable.contains("_master_") || variable.contains("_source_") {
                    instance.semi_sync_master_enabled = enabled;
                } else {
                    instance.semi_sync_replica_enabled = enabled;
                }
            }
            s if s.starts_with("start slave until ") => {
                let params = parse_params(&s["start slave until ".len()..]);
                node.until = Some(coordinates_param(&params).unwrap_or_default());
                instance.replication_sql_thread_running = true;
                node.start_io();
            }
            s if s.starts_with("change master to ") => {
                let params = parse_params(&s["change master to ".len()..]);
                if let Some(delay) = params.get("master_delay") {
                    instance.sql_delay = delay.parse().unwrap_or(0);
                }
                match params.get("master_auto_position").map(String::as_str) {
                    Some("1") => instance.using_oracle_gtid = true,
                    Some("0") => instance.using_oracle_gtid = false,
                    _ => {}
                }
                if let Some(use_gtid) = params.get("master_use_gtid") {
                    instance.using_mariadb_gtid = use_gtid != "no";
                }
                if let Some(coordinates) = coordinates_param(&params) {
                    instance.read_binlog_coordinates = coordinates.clone();
                    instance.exec_binlog_coordinates = coordinates;
                    instance.relaylog_coordinates = BinlogCoordinates::default();
                }
                if let Some(host) = params.get("master_host") {
                    let port = params
                        .get("master_port")
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(instance.master_key.port);
                    let new_master = InstanceKey::new(host.clone(), port);
                    let old_master = std::mem::replace(&mut instance.master_key, new_master.clone());
                    instance.replication_threads_exist = true;
                    self.move_replica(key, &old_master, Some(&new_master));
                }
            }
            other => {
                return Err(Error::statement(
                    Some(1064),
                    format!("fake topology cannot interpret: {}", other),
                ))
            }
        }
        Ok(())
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('\'').to_string()
}

/// `a='x', b=2` into a map
fn parse_params(params: &str) -> HashMap<String, String> {
    params
        .split(", ")
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), unquote(v)))
        .collect()
}

fn coordinates_param(params: &HashMap<String, String>) -> Option<BinlogCoordinates> {
    let file = params.get("master_log_file")?;
    let pos = params.get("master_log_pos")?.parse().ok()?;
    Some(BinlogCoordinates::new(file.clone(), pos))
}

/// Shared handle to a simulated topology
#[derive(Clone, Default)]
pub struct FakeTopology {
    state: Arc<Mutex<State>>,
}

impl FakeTopology {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn insert(&self, mut instance: Instance) {
        let mut state = self.lock();
        state.next_server_id += 1;
        instance.server_id = state.next_server_id;
        instance.server_uuid = format!("{:08}-1111-1111-1111-111111111111", state.next_server_id);
        instance.cluster_name = instance.key.to_string();
        state.nodes.insert(
            instance.key.clone(),
            Node {
                instance,
                progress: Progress::default(),
                until: None,
                io_broken: false,
                failing_reads: 0,
            },
        );
    }

    /// A writable server with binary logs and no source
    pub fn add_master(&self, name: &str, version: &str) {
        let mut instance = Instance::new(InstanceKey::new(name, PORT));
        instance.version = version.into();
        instance.log_bin_enabled = true;
        instance.self_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000003", 5000);
        self.insert(instance);
    }

    /// A running, caught-up replica of `master`
    pub fn add_replica(&self, name: &str, master: &str, version: &str) {
        let key = InstanceKey::new(name, PORT);
        let master_key = InstanceKey::new(master, PORT);
        let mut instance = Instance::new(key.clone());
        instance.version = version.into();
        instance.read_only = true;
        instance.log_bin_enabled = true;
        instance.self_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000002", 1200);
        instance.master_key = master_key.clone();
        instance.replication_threads_exist = true;
        instance.replication_io_thread_running = true;
        instance.replication_sql_thread_running = true;
        instance.read_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000003", 5000);
        instance.exec_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000003", 5000);
        self.insert(instance);
        self.lock().move_replica(&key, &InstanceKey::default(), Some(&master_key));
    }

    /// Make `alias` resolve to the canonical hostname `target`
    pub fn add_alias(&self, alias: &str, target: &str) {
        self.lock().aliases.insert(alias.into(), target.into());
    }

    pub fn update(&self, key: &InstanceKey, f: impl FnOnce(&mut Instance)) {
        let mut state = self.lock();
        let node = state.nodes.get_mut(key).expect("unknown fake instance");
        f(&mut node.instance);
    }

    pub fn instance(&self, key: &InstanceKey) -> Instance {
        self.lock().nodes.get(key).expect("unknown fake instance").instance.clone()
    }

    pub fn set_progress(&self, key: &InstanceKey, progress: Progress) {
        self.lock().nodes.get_mut(key).expect("unknown fake instance").progress = progress;
    }

    /// Starting the IO thread never succeeds
    pub fn set_io_thread_broken(&self, key: &InstanceKey) {
        self.lock().nodes.get_mut(key).expect("unknown fake instance").io_broken = true;
    }

    /// The next `count` live reads of `key` fail
    pub fn fail_reads(&self, key: &InstanceKey, count: u32) {
        self.lock().nodes.get_mut(key).expect("unknown fake instance").failing_reads = count;
    }

    /// The next statement or query on `key` starting with `prefix` fails with `error`
    pub fn fail_next(&self, key: &InstanceKey, prefix: &str, error: Error) {
        self.lock().failures.push((key.clone(), prefix.into(), error));
    }

    /// Queries on `key` starting with `prefix` return `rows`
    pub fn script_rows(&self, key: &InstanceKey, prefix: &str, rows: Vec<SqlRow>) {
        self.lock().scripted.push((key.clone(), prefix.into(), rows));
    }

    /// Every statement that executed successfully, in order
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn statements_on(&self, key: &InstanceKey) -> Vec<String> {
        self.lock()
            .statements
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Statement batches run on a single connection
    pub fn sessions_on(&self, key: &InstanceKey) -> Vec<Vec<String>> {
        self.lock()
            .sessions
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Sessions on `key` that were closed because a statement failed
    pub fn discarded_sessions_on(&self, key: &InstanceKey) -> usize {
        self.lock().discarded_sessions.iter().filter(|k| *k == key).count()
    }

    /// Number of queries on `key` starting with `prefix`
    pub fn queries_on(&self, key: &InstanceKey, prefix: &str) -> usize {
        self.lock()
            .queries
            .iter()
            .filter(|(k, q)| k == key && q.starts_with(prefix))
            .count()
    }

    pub fn audits(&self) -> Vec<(String, InstanceKey, String)> {
        self.lock().audits.clone()
    }

    pub fn equivalences(&self) -> Vec<Equivalence> {
        self.lock().equivalences.clone()
    }

    pub fn relaylog_resets(&self) -> Vec<InstanceKey> {
        self.lock().relaylog_resets.clone()
    }

    pub fn pseudo_gtid_clusters(&self) -> Vec<String> {
        self.lock().pseudo_gtid_clusters.clone()
    }

    pub fn controller(&self) -> ReplicationController {
        self.controller_with(&WolfReplConfig::default())
    }

    pub fn controller_with(&self, config: &WolfReplConfig) -> ReplicationController {
        ReplicationController::with_topology(Arc::new(self.clone()), config)
            .with_resolver(Arc::new(self.clone()))
            .with_recorder(Arc::new(self.clone()))
    }
}

#[async_trait]
impl InstanceReader for FakeTopology {
    async fn read_topology_instance(&self, key: &InstanceKey) -> Result<Instance> {
        let mut state = self.lock();
        let node = state.node(key)?;
        if node.failing_reads > 0 {
            node.failing_reads -= 1;
            return Err(Error::statement(Some(2003), format!("Can't connect to MySQL server on '{}'", key)));
        }
        node.advance();
        Ok(node.instance.clone())
    }

    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        Ok(self.lock().nodes.get(key).map(|n| n.instance.clone()))
    }

    async fn read_replica_instances(&self, master_key: &InstanceKey) -> Result<Vec<Instance>> {
        let mut replicas: Vec<Instance> = self
            .lock()
            .nodes
            .values()
            .filter(|n| &n.instance.master_key == master_key)
            .map(|n| n.instance.clone())
            .collect();
        replicas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(replicas)
    }
}

#[async_trait]
impl StatementExecutor for FakeTopology {
    async fn exec(&self, key: &InstanceKey, statement: &Statement) -> Result<u64> {
        let sql = statement.render()?;
        let mut state = self.lock();
        if let Some(error) = state.take_failure(key, &sql) {
            return Err(error);
        }
        state.apply(key, &sql)?;
        state.statements.push((key.clone(), sql));
        Ok(1)
    }

    async fn exec_in_session(&self, key: &InstanceKey, statements: &[Statement]) -> Result<()> {
        let rendered = statements.iter().map(Statement::render).collect::<Result<Vec<_>>>()?;
        let mut state = self.lock();
        for sql in &rendered {
            if let Some(error) = state.take_failure(key, sql) {
                state.discarded_sessions.push(key.clone());
                return Err(error);
            }
        }
        let node = state.node(key)?;
        if rendered.iter().any(|s| s == "commit") {
            node.instance.last_sql_error.clear();
        }
        state.sessions.push((key.clone(), rendered.clone()));
        state
            .statements
            .extend(rendered.into_iter().map(|s| (key.clone(), s)));
        Ok(())
    }

    async fn query_rows(&self, key: &InstanceKey, statement: &Statement) -> Result<Vec<SqlRow>> {
        let sql = statement.render()?;
        let mut state = self.lock();
        state.queries.push((key.clone(), sql.clone()));
        if let Some(error) = state.take_failure(key, &sql) {
            return Err(error);
        }
        if let Some((_, _, rows)) = state
            .scripted
            .iter()
            .rev()
            .find(|(k, prefix, _)| k == key && sql.starts_with(prefix.as_str()))
        {
            return Ok(rows.clone());
        }

        let instance = &state.node(key)?.instance;
        if (sql == "show master status" || sql == "show binary log status")
            && !instance.self_binlog_coordinates.is_empty()
        {
            return Ok(vec![SqlRow::new(
                vec!["File".into(), "Position".into(), "Executed_Gtid_Set".into()],
                vec![
                    Some(instance.self_binlog_coordinates.log_file.clone()),
                    Some(instance.self_binlog_coordinates.log_pos.to_string()),
                    Some(instance.executed_gtid_set.clone()),
                ],
            )]);
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl HostnameResolver for FakeTopology {
    async fn unresolve_hostname(&self, key: &InstanceKey) -> Result<(InstanceKey, bool)> {
        match self.lock().aliases.get(&key.hostname) {
            Some(target) => Ok((InstanceKey::new(target.clone(), key.port), true)),
            None => Ok((key.clone(), false)),
        }
    }
}

#[async_trait]
impl TopologyRecorder for FakeTopology {
    async fn audit_operation(&self, operation: &str, key: &InstanceKey, message: &str) {
        self.lock()
            .audits
            .push((operation.into(), key.clone(), message.into()));
    }

    async fn write_master_position_equivalence(
        &self,
        master1: &InstanceKey,
        coordinates1: &BinlogCoordinates,
        master2: &InstanceKey,
        coordinates2: &BinlogCoordinates,
    ) -> Result<()> {
        self.lock().equivalences.push((
            master1.clone(),
            coordinates1.clone(),
            master2.clone(),
            coordinates2.clone(),
        ));
        Ok(())
    }

    async fn reset_instance_relaylog_coordinates_history(&self, key: &InstanceKey) -> Result<()> {
        self.lock().relaylog_resets.push(key.clone());
        Ok(())
    }

    async fn register_injected_pseudo_gtid(&self, cluster_name: &str) -> Result<()> {
        self.lock().pseudo_gtid_clusters.push(cluster_name.into());
        Ok(())
    }
}
