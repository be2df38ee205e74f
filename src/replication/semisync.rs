//! Semi-sync policy engine
//!
//! Decides which replicas of a master should acknowledge semi-synchronous
//! commits. Classification and action selection are pure functions over
//! snapshots; the controller methods below read the topology, run them, and
//! apply single-replica decisions.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

use super::{Logged, ReplicationController};
use crate::error::{Error, OpResult, Result};
use crate::executor::Statement;
use crate::instance::{Instance, InstanceKey, PromotionRule};

/// Replica key to desired semi-sync replica flag (true = enable)
pub type SemiSyncActions = BTreeMap<InstanceKey, bool>;

/// Replicas of one master, partitioned for semi-sync decisions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SemiSyncClassification {
    /// Priority > 0, ordered best first
    pub candidates: Vec<Instance>,
    /// Priority 0: never acknowledge
    pub async_replicas: Vec<Instance>,
    /// Defunct or not replicating
    pub excluded: Vec<Instance>,
}

/// Outcome of analysing a master's replica topology. Nothing is applied.
#[derive(Debug, Clone, Serialize)]
pub struct SemiSyncAnalysis {
    pub master: Instance,
    pub replicas: Vec<Instance>,
    pub classification: SemiSyncClassification,
    #[serde(serialize_with = "serialize_actions")]
    pub actions: SemiSyncActions,
}

fn serialize_actions<S: Serializer>(actions: &SemiSyncActions, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(actions.iter().map(|(key, enable)| (key.to_string(), enable)))
}

/// Partition replicas and order the semi-sync candidates.
///
/// A replica is excluded when its last check failed, or when it is not
/// replicating and is not `include`. Candidates sort by priority (highest
/// first), then promotion rule (best first), then `host:port`.
pub fn classify_and_prioritize(
    replicas: Vec<Instance>,
    include: Option<&InstanceKey>,
) -> SemiSyncClassification {
    let mut classification = SemiSyncClassification::default();

    for replica in replicas {
        let replicating = include == Some(&replica.key) || replica.replica_running();
        if !replica.is_last_check_valid || !replicating {
            classification.excluded.push(replica);
        } else if replica.semi_sync_priority == 0 {
            classification.async_replicas.push(replica);
        } else {
            classification.candidates.push(replica);
        }
    }

    classification.candidates.sort_by(|a, b| {
        b.semi_sync_priority
            .cmp(&a.semi_sync_priority)
            .then_with(|| a.promotion_rule.cmp(&b.promotion_rule))
            .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
    });
    classification
}

/// Actions needed to bring the replica set in line with the master's
/// wait-for-replica count
pub fn determine_semi_sync_actions(
    master: &Instance,
    classification: &SemiSyncClassification,
    exact: bool,
) -> SemiSyncActions {
    if exact {
        exact_topology_actions(master, classification)
    } else {
        enough_topology_actions(master, &classification.candidates)
    }
}

/// The first N candidates on, everything else off
fn exact_topology_actions(master: &Instance, classification: &SemiSyncClassification) -> SemiSyncActions {
    let wait_count = master.semi_sync_master_wait_for_replica_count as usize;
    let mut actions = SemiSyncActions::new();

    for (i, replica) in classification.candidates.iter().enumerate() {
        let should_enable = i < wait_count;
        if should_enable != replica.semi_sync_replica_enabled {
            actions.insert(replica.key.clone(), should_enable);
        }
    }
    for replica in &classification.async_replicas {
        if replica.semi_sync_replica_enabled {
            actions.insert(replica.key.clone(), false);
        }
    }
    actions
}

/// Enable candidates in order until enough acks are available; never disables
fn enough_topology_actions(master: &Instance, candidates: &[Instance]) -> SemiSyncActions {
    let needed = master
        .semi_sync_master_wait_for_replica_count
        .saturating_sub(master.semi_sync_master_clients);
    let mut actions = SemiSyncActions::new();
    let mut enabled = 0;

    for replica in candidates {
        if enabled >= needed {
            break;
        }
        if !replica.semi_sync_replica_enabled {
            actions.insert(replica.key.clone(), true);
            enabled += 1;
        }
    }
    actions
}

fn log_replica_list(description: &str, replicas: &[Instance]) {
    if replicas.is_empty() {
        tracing::debug!("semi-sync: {}: (none)", description);
        return;
    }
    tracing::debug!("semi-sync: {}:", description);
    for replica in replicas {
        tracing::debug!(
            "semi-sync: - {}: semi-sync enabled = {}, priority = {}, promotion rule = {}, last check = {}, replicating = {}",
            replica.key,
            replica.semi_sync_replica_enabled,
            replica.semi_sync_priority,
            replica.promotion_rule,
            replica.is_last_check_valid,
            replica.replica_running()
        );
    }
}

fn log_analysis(master: &Instance, classification: &SemiSyncClassification, actions: &SemiSyncActions) {
    tracing::debug!("semi-sync: analysis results for cluster {}:", master.cluster_name);
    tracing::debug!(
        "semi-sync: master = {}, master semi-sync wait count = {}, master semi-sync replica count = {}",
        master.key,
        master.semi_sync_master_wait_for_replica_count,
        master.semi_sync_master_clients
    );
    log_replica_list("possible semi-sync replicas (in priority order)", &classification.candidates);
    log_replica_list("always-async replicas", &classification.async_replicas);
    log_replica_list("excluded replicas (defunct)", &classification.excluded);
    if actions.is_empty() {
        tracing::debug!("semi-sync: suggested actions: (none)");
    }
    for (key, enable) in actions {
        tracing::debug!("semi-sync: - {}: should set semi-sync enabled = {}", key, enable);
    }
}

impl ReplicationController {
    /// Read a master and its replicas and compute semi-sync actions without
    /// applying them.
    ///
    /// Replicas are read live; when any of those reads fails the locally
    /// tracked replica list is used instead.
    pub async fn analyze_semi_sync_replica_topology(
        &self,
        master_key: &InstanceKey,
        include: Option<&InstanceKey>,
        exact: bool,
    ) -> Result<SemiSyncAnalysis> {
        let master = self.reader.read_topology_instance(master_key).await?;
        let replicas = match self.reader.read_topology_instances(&master.replicas).await {
            Ok(replicas) => replicas,
            Err(e) => {
                tracing::debug!("semi-sync: falling back to tracked replicas of {}: {}", master_key, e);
                self.reader.read_replica_instances(master_key).await?
            }
        };

        let classification = classify_and_prioritize(replicas.clone(), include);
        let actions = determine_semi_sync_actions(&master, &classification, exact);
        log_analysis(&master, &classification, &actions);

        Ok(SemiSyncAnalysis {
            master,
            replicas,
            classification,
            actions,
        })
    }

    /// Set the source-side semi-sync flag
    pub async fn set_semi_sync_master(&self, key: &InstanceKey, enable: bool) -> OpResult {
        let instance = self.read(key).await?;
        self.check_noop("set-semi-sync-master", &instance)?;

        let sql = if instance.semi_sync_master_plugin_new_version {
            "set @@global.rpl_semi_sync_source_enabled=?"
        } else {
            "set @@global.rpl_semi_sync_master_enabled=?"
        };
        self.exec(key, Statement::new(sql).bind(enable)).await.logged(&instance)?;

        self.read(key).await
    }

    /// Set the replica-side semi-sync flag, bouncing the IO thread when it is
    /// running so the setting takes effect
    pub async fn set_semi_sync_replica(&self, key: &InstanceKey, enable: bool) -> OpResult {
        let instance = self.read(key).await?;
        if instance.semi_sync_replica_enabled == enable {
            return Ok(instance);
        }
        self.check_noop("set-semi-sync-replica", &instance)?;

        let sql = if instance.semi_sync_replica_plugin_new_version {
            "set @@global.rpl_semi_sync_replica_enabled=?"
        } else {
            "set @@global.rpl_semi_sync_slave_enabled=?"
        };
        self.exec(key, Statement::new(sql).bind(enable)).await.logged(&instance)?;

        if instance.replication_io_thread_running {
            let qsp = instance.qsp();
            if let Err(e) = self.exec(key, qsp.stop_io_thread()).await {
                tracing::debug!("semi-sync: {}: ignoring IO thread stop error: {}", key, e);
            }
            self.exec(key, qsp.start_io_thread()).await.logged(&instance)?;
        }

        self.read(key).await
    }

    /// Turn off the source-side flag on a replica with positive priority
    pub async fn maybe_disable_semi_sync_master(&self, replica: Instance) -> OpResult {
        if replica.semi_sync_priority > 0 && replica.semi_sync_master_enabled {
            tracing::info!("semi-sync: {}: setting rpl_semi_sync_master_enabled: false", replica.key);
            return self.set_semi_sync_master(&replica.key, false).await.map_err(|e| {
                tracing::warn!(
                    "semi-sync: {}: cannot disable rpl_semi_sync_master_enabled; that's not that bad though",
                    replica.key
                );
                e
            });
        }
        Ok(replica)
    }

    /// Set the replica-side flag according to policy.
    ///
    /// With exact or locked-master recovery configured, the replica is only
    /// touched when the topology analysis lists an action for it. Otherwise a
    /// replica with positive priority acks unless its promotion rule is
    /// `must_not`.
    pub async fn maybe_enable_semi_sync_replica(&self, replica: Instance) -> OpResult {
        if !self.config.semi_sync_analysis_enabled() {
            return self.maybe_enable_semi_sync_replica_legacy(replica).await;
        }

        let analysis = self
            .analyze_semi_sync_replica_topology(
                &replica.master_key,
                Some(&replica.key),
                self.config.enforce_exact_semi_sync_replicas,
            )
            .await
            .map_err(|e| Error::Internal(format!("semi-sync: {}", e)))
            .logged(&replica)?;

        if let Some(&enable) = analysis.actions.get(&replica.key) {
            tracing::info!(
                "semi-sync: {}: setting rpl_semi_sync_slave_enabled={}, restarting slave_io thread",
                replica.key,
                enable
            );
            self.set_semi_sync_replica(&replica.key, enable).await?;
            return Ok(replica);
        }

        // Other replicas needing changes are left for a later recovery.
        tracing::info!(
            "semi-sync: {}: no action taken; this may lead to future recoveries",
            replica.key
        );
        Ok(replica)
    }

    async fn maybe_enable_semi_sync_replica_legacy(&self, replica: Instance) -> OpResult {
        if replica.semi_sync_priority == 0 {
            return Ok(replica);
        }
        let enable = replica.promotion_rule != PromotionRule::MustNot;
        tracing::info!(
            "semi-sync: {}: setting rpl_semi_sync_slave_enabled = {} (legacy behavior)",
            replica.key,
            enable
        );
        self.set_semi_sync_replica(&replica.key, enable).await
    }

    /// Apply the analysed action for one replica, if there is one
    pub async fn apply_semi_sync_action(&self, analysis: &SemiSyncAnalysis, key: &InstanceKey) -> OpResult<bool> {
        let Some(&enable) = analysis.actions.get(key) else {
            return Ok(false);
        };
        self.set_semi_sync_replica(key, enable).await?;
        self.audit("semi-sync-replica", key, format!("set semi-sync enabled = {}", enable))
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTopology;

    fn replica(name: &str, priority: u32, rule: PromotionRule, enabled: bool) -> Instance {
        let mut instance = Instance::new(InstanceKey::new(name, 3306));
        instance.master_key = InstanceKey::new("master", 3306);
        instance.read_binlog_coordinates = crate::instance::BinlogCoordinates::new("mysql-bin.000001", 4);
        instance.replication_threads_exist = true;
        instance.replication_io_thread_running = true;
        instance.replication_sql_thread_running = true;
        instance.semi_sync_priority = priority;
        instance.promotion_rule = rule;
        instance.semi_sync_replica_enabled = enabled;
        instance
    }

    fn master(wait_count: u32, clients: u32) -> Instance {
        let mut instance = Instance::new(InstanceKey::new("master", 3306));
        instance.semi_sync_master_wait_for_replica_count = wait_count;
        instance.semi_sync_master_clients = clients;
        instance
    }

    fn keys(instances: &[Instance]) -> Vec<String> {
        instances.iter().map(|i| i.key.hostname.clone()).collect()
    }

    #[test]
    fn test_prioritization_order() {
        let replicas = vec![
            replica("a", 1, PromotionRule::Prefer, false),
            replica("b", 3, PromotionRule::Neutral, false),
            replica("c", 3, PromotionRule::Prefer, false),
        ];
        let classification = classify_and_prioritize(replicas, None);
        assert_eq!(keys(&classification.candidates), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ties_break_by_host_port() {
        let replicas = vec![
            replica("db3", 2, PromotionRule::Neutral, false),
            replica("db1", 2, PromotionRule::Neutral, false),
            replica("db2", 2, PromotionRule::Neutral, false),
        ];
        let classification = classify_and_prioritize(replicas, None);
        assert_eq!(keys(&classification.candidates), vec!["db1", "db2", "db3"]);
    }

    #[test]
    fn test_classification() {
        let mut stale = replica("stale", 5, PromotionRule::Neutral, false);
        stale.is_last_check_valid = false;
        let mut stopped = replica("stopped", 5, PromotionRule::Neutral, false);
        stopped.replication_sql_thread_running = false;
        let mut included = replica("included", 5, PromotionRule::Neutral, false);
        included.replication_io_thread_running = false;
        let mut stale_included = replica("stale-included", 5, PromotionRule::Neutral, false);
        stale_included.is_last_check_valid = false;
        let async_replica = replica("async", 0, PromotionRule::Neutral, true);

        let classification = classify_and_prioritize(
            vec![stale, stopped, included, async_replica, stale_included.clone()],
            Some(&InstanceKey::new("included", 3306)),
        );
        assert_eq!(keys(&classification.candidates), vec!["included"]);
        assert_eq!(keys(&classification.async_replicas), vec!["async"]);
        assert_eq!(keys(&classification.excluded), vec!["stale", "stopped", "stale-included"]);

        // Invalid last check excludes even the explicitly included replica
        let classification = classify_and_prioritize(vec![stale_included], Some(&InstanceKey::new("stale-included", 3306)));
        assert_eq!(classification.excluded.len(), 1);
    }

    #[test]
    fn test_exact_topology_actions() {
        let classification = SemiSyncClassification {
            candidates: vec![
                replica("r1", 3, PromotionRule::Neutral, true),
                replica("r2", 2, PromotionRule::Neutral, false),
                replica("r3", 1, PromotionRule::Neutral, true),
            ],
            async_replicas: vec![
                replica("a1", 0, PromotionRule::Neutral, true),
                replica("a2", 0, PromotionRule::Neutral, false),
            ],
            excluded: vec![],
        };
        let actions = determine_semi_sync_actions(&master(2, 2), &classification, true);

        let expected: SemiSyncActions = [
            (InstanceKey::new("r2", 3306), true),
            (InstanceKey::new("r3", 3306), false),
            (InstanceKey::new("a1", 3306), false),
        ]
        .into_iter()
        .collect();
        assert_eq!(actions, expected);
    }

    #[test]
    fn test_enough_topology_actions() {
        let classification = SemiSyncClassification {
            candidates: vec![
                replica("r1", 3, PromotionRule::Neutral, false),
                replica("r2", 2, PromotionRule::Neutral, false),
                replica("r3", 1, PromotionRule::Neutral, false),
            ],
            ..Default::default()
        };
        let actions = determine_semi_sync_actions(&master(3, 1), &classification, false);

        let expected: SemiSyncActions = [
            (InstanceKey::new("r1", 3306), true),
            (InstanceKey::new("r2", 3306), true),
        ]
        .into_iter()
        .collect();
        assert_eq!(actions, expected);
    }

    #[test]
    fn test_enough_topology_never_disables() {
        let classification = SemiSyncClassification {
            candidates: vec![
                replica("r1", 3, PromotionRule::Neutral, true),
                replica("r2", 2, PromotionRule::Neutral, false),
            ],
            async_replicas: vec![replica("a1", 0, PromotionRule::Neutral, true)],
            excluded: vec![],
        };
        let actions = determine_semi_sync_actions(&master(2, 0), &classification, false);
        assert!(actions.values().all(|enable| *enable));
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_enough_topology_clients_exceed_wait_count() {
        let classification = SemiSyncClassification {
            candidates: vec![replica("r1", 3, PromotionRule::Neutral, false)],
            ..Default::default()
        };
        assert!(determine_semi_sync_actions(&master(1, 4), &classification, false).is_empty());
        assert!(determine_semi_sync_actions(&master(2, 2), &classification, false).is_empty());
    }

    #[test]
    fn test_analysis_serializes_actions_by_key() {
        let analysis = SemiSyncAnalysis {
            master: master(1, 0),
            replicas: vec![],
            classification: SemiSyncClassification::default(),
            actions: [(InstanceKey::new("r1", 3306), true)].into_iter().collect(),
        };
        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["actions"]["r1:3306"], serde_json::Value::Bool(true));
    }

    fn semi_sync_topology() -> FakeTopology {
        let fake = FakeTopology::new();
        fake.add_master("master", "5.7.40");
        fake.update(&InstanceKey::new("master", 3306), |m| {
            m.semi_sync_master_enabled = true;
            m.semi_sync_master_wait_for_replica_count = 1;
        });
        for (name, priority) in [("replica1", 2), ("replica2", 1)] {
            fake.add_replica(name, "master", "5.7.40");
            fake.update(&InstanceKey::new(name, 3306), |r| r.semi_sync_priority = priority);
        }
        fake
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_falls_back_to_tracked_replicas() {
        let fake = semi_sync_topology();
        fake.fail_reads(&InstanceKey::new("replica2", 3306), 1);
        let controller = fake.controller();

        let analysis = controller
            .analyze_semi_sync_replica_topology(&InstanceKey::new("master", 3306), None, true)
            .await
            .unwrap();
        assert_eq!(analysis.replicas.len(), 2);
        assert_eq!(analysis.actions.get(&InstanceKey::new("replica1", 3306)), Some(&true));
        assert_eq!(analysis.actions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maybe_enable_legacy_respects_must_not() {
        let fake = semi_sync_topology();
        let key = InstanceKey::new("replica1", 3306);
        fake.update(&key, |r| r.promotion_rule = PromotionRule::MustNot);
        let controller = fake.controller();

        let instance = controller
            .maybe_enable_semi_sync_replica(fake.instance(&key))
            .await
            .unwrap();
        assert!(!instance.semi_sync_replica_enabled);
        assert!(fake.statements_on(&key).is_empty());

        fake.update(&key, |r| r.promotion_rule = PromotionRule::Prefer);
        let instance = controller
            .maybe_enable_semi_sync_replica(fake.instance(&key))
            .await
            .unwrap();
        assert!(instance.semi_sync_replica_enabled);
        assert_eq!(
            fake.statements_on(&key),
            vec![
                "set @@global.rpl_semi_sync_slave_enabled=1",
                "stop slave io_thread",
                "start slave io_thread"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_maybe_enable_exact_mode_only_touches_listed_replica() {
        let fake = semi_sync_topology();
        let mut config = crate::config::WolfReplConfig::default();
        config.replication.enforce_exact_semi_sync_replicas = true;
        let controller = fake.controller_with(&config);

        let low = InstanceKey::new("replica2", 3306);
        controller
            .maybe_enable_semi_sync_replica(fake.instance(&low))
            .await
            .unwrap();
        assert!(fake.statements_on(&low).is_empty());

        let high = InstanceKey::new("replica1", 3306);
        controller
            .maybe_enable_semi_sync_replica(fake.instance(&high))
            .await
            .unwrap();
        assert!(fake.instance(&high).semi_sync_replica_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_semi_sync_replica_is_idempotent() {
        let fake = semi_sync_topology();
        let key = InstanceKey::new("replica1", 3306);
        fake.update(&key, |r| {
            r.semi_sync_replica_enabled = true;
            r.semi_sync_replica_plugin_new_version = true;
        });
        let controller = fake.controller();

        controller.set_semi_sync_replica(&key, true).await.unwrap();
        assert!(fake.statements_on(&key).is_empty());

        fake.update(&key, |r| r.replication_io_thread_running = false);
        let instance = controller.set_semi_sync_replica(&key, false).await.unwrap();
        assert!(!instance.semi_sync_replica_enabled);
        assert_eq!(
            fake.statements_on(&key),
            vec!["set @@global.rpl_semi_sync_replica_enabled=0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_maybe_disable_semi_sync_master() {
        let fake = semi_sync_topology();
        let key = InstanceKey::new("replica1", 3306);
        fake.update(&key, |r| r.semi_sync_master_enabled = true);
        let controller = fake.controller();

        let instance = controller
            .maybe_disable_semi_sync_master(fake.instance(&key))
            .await
            .unwrap();
        assert!(!instance.semi_sync_master_enabled);
        assert_eq!(
            fake.statements_on(&key),
            vec!["set @@global.rpl_semi_sync_master_enabled=0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_semi_sync_action() {
        let fake = semi_sync_topology();
        let controller = fake.controller();
        let analysis = controller
            .analyze_semi_sync_replica_topology(&InstanceKey::new("master", 3306), None, false)
            .await
            .unwrap();

        let high = InstanceKey::new("replica1", 3306);
        assert!(controller.apply_semi_sync_action(&analysis, &high).await.unwrap());
        assert!(!controller
            .apply_semi_sync_action(&analysis, &InstanceKey::new("replica2", 3306))
            .await
            .unwrap());
        assert!(fake.instance(&high).semi_sync_replica_enabled);
        assert_eq!(fake.audits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semi_sync_noop() {
        let fake = semi_sync_topology();
        let controller = fake.controller().with_noop(true);
        let key = InstanceKey::new("replica1", 3306);

        let err = controller.set_semi_sync_replica(&key, true).await.unwrap_err();
        assert!(err.error.is_noop());
        let err = controller.set_semi_sync_master(&key, true).await.unwrap_err();
        assert!(err.error.is_noop());
        assert!(fake.statements().is_empty());
    }
}
