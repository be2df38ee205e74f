//! Small value types shared by the replication operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Per-instance hint ranking eligibility to become a future source.
///
/// Variants are declared best-first; the derived order is the promotion order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionRule {
    Must,
    Prefer,
    #[default]
    Neutral,
    PreferNot,
    MustNot,
}

impl PromotionRule {
    /// Strictly more eligible for promotion than `other`
    pub fn better_than(&self, other: &PromotionRule) -> bool {
        self < other
    }
}

impl fmt::Display for PromotionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromotionRule::Must => "must",
            PromotionRule::Prefer => "prefer",
            PromotionRule::Neutral => "neutral",
            PromotionRule::PreferNot => "prefer_not",
            PromotionRule::MustNot => "must_not",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PromotionRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "must" => Ok(PromotionRule::Must),
            "prefer" => Ok(PromotionRule::Prefer),
            "neutral" => Ok(PromotionRule::Neutral),
            "prefer_not" => Ok(PromotionRule::PreferNot),
            "must_not" => Ok(PromotionRule::MustNot),
            other => Err(Error::InvalidArgument(format!("unknown promotion rule: {}", other))),
        }
    }
}

/// Caller's directive on whether a master change should adopt, avoid, or
/// preserve GTID based replication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationGtidHint {
    Deny,
    #[default]
    Neutral,
    Force,
}

impl FromStr for OperationGtidHint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" | "nogtid" => Ok(OperationGtidHint::Deny),
            "neutral" => Ok(OperationGtidHint::Neutral),
            "force" => Ok(OperationGtidHint::Force),
            other => Err(Error::InvalidArgument(format!("unknown GTID hint: {}", other))),
        }
    }
}

/// Observed combined state of the IO and SQL threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationThreadState {
    NoThread,
    Stopped,
    Running,
    Other,
}

impl ReplicationThreadState {
    pub fn from_flags(threads_exist: bool, io_running: bool, sql_running: bool) -> Self {
        if !threads_exist {
            return ReplicationThreadState::NoThread;
        }
        match (io_running, sql_running) {
            (true, true) => ReplicationThreadState::Running,
            (false, false) => ReplicationThreadState::Stopped,
            _ => ReplicationThreadState::Other,
        }
    }
}

/// How bulk operations stop their replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReplicationMethod {
    None,
    Nice,
    Plain,
}

impl fmt::Display for StopReplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReplicationMethod::None => write!(f, "NoStopReplication"),
            StopReplicationMethod::Nice => write!(f, "StopReplicationNice"),
            StopReplicationMethod::Plain => write!(f, "StopReplicationPlain"),
        }
    }
}

/// Credentials a replica uses to connect to its source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationCredentials {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_cert: String,
    pub ssl_key: String,
    pub ssl_ca_cert: String,
}
