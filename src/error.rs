//! WolfRepl Error Types

use std::time::Duration;
use thiserror::Error;

use crate::instance::{BinlogCoordinates, Instance, InstanceKey};

/// Result type alias for WolfRepl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a public topology operation: on failure the best-known
/// snapshot of the instance travels with the error.
pub type OpResult<T = Instance> = std::result::Result<T, OperationError>;

/// MySQL error raised when `CHANGE MASTER TO` / `RESET SLAVE` trips over
/// https://bugs.mysql.com/bug.php?id=83713
pub const ER_MASTER_INFO: u16 = 1201;

/// MaxScale answers `STOP SLAVE` on a stopped replica with this error.
pub const ER_SLAVE_NOT_RUNNING: u16 = 1199;
const MAXSCALE_NOT_RUNNING_MESSAGE: &str = "Slave connection is not running";

/// WolfRepl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Error {}: {message}", fmt_code(.code))]
    Statement { code: Option<u16>, message: String },

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceKey),

    // Precondition errors
    #[error("instance is not a replica: {0}")]
    NotReplica(InstanceKey),

    #[error("{operation}: cannot operate on {key} because replication threads are not stopped")]
    ReplicationRunning { operation: String, key: InstanceKey },

    #[error("Replication SQL thread is running on {0}")]
    SqlThreadRunning(InstanceKey),

    #[error("No SQL error on {0}")]
    NoSqlError(InstanceKey),

    #[error("Empty user in replication credentials: {0}")]
    EmptyCredentials(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Dry-run
    #[error("noop: aborting {operation} operation on {key}; signalling error but nothing went wrong.")]
    Noop { operation: String, key: InstanceKey },

    // Replication state errors
    #[error("Replication not running on {0}")]
    ReplicationNotRunning(InstanceKey),

    #[error("START SLAVE UNTIL is past coordinates on {key}: {target}")]
    PastCoordinates { key: InstanceKey, target: BinlogCoordinates },

    #[error("Unsupported for replication dialect: {0}")]
    DialectUnsupported(String),

    #[error("Invalid binlog coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("GTID error: {0}")]
    Gtid(String),

    // Timeouts
    #[error("{operation} timeout on {key} after duration {after:?}")]
    Timeout { operation: String, key: InstanceKey, after: Duration },

    #[error("{operation} stale coordinates timeout on {key} after duration {after:?}")]
    StaleCoordinates { operation: String, key: InstanceKey, after: Duration },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Topology operation panicked: {0}")]
    Panicked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_code(code: &Option<u16>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
}

impl Error {
    /// Build an error for a failed SQL statement
    pub fn statement(code: Option<u16>, message: impl Into<String>) -> Self {
        Error::Statement { code, message: message.into() }
    }

    /// Check if this error is a dry-run abort
    pub fn is_noop(&self) -> bool {
        matches!(self, Error::Noop { .. })
    }

    /// Check if this error is any flavor of timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::StaleCoordinates { .. })
    }

    /// Check if this error rejected the operation before any mutation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::NotReplica(_)
                | Error::ReplicationRunning { .. }
                | Error::SqlThreadRunning(_)
                | Error::NoSqlError(_)
                | Error::EmptyCredentials(_)
                | Error::InvalidArgument(_)
        )
    }

    /// MySQL server error number, when the server reported one
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Statement { code, .. } => *code,
            Error::Database(sqlx::Error::Database(e)) => e
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|e| e.number()),
            _ => None,
        }
    }

    /// Error 1201: could not initialize master info structure
    pub fn is_master_info_init_failure(&self) -> bool {
        self.code() == Some(ER_MASTER_INFO)
    }

    /// The single error MaxScale raises on `STOP SLAVE` when already stopped
    pub fn is_maxscale_not_running(&self) -> bool {
        match self {
            Error::Statement { code: Some(ER_SLAVE_NOT_RUNNING), message } => {
                message == MAXSCALE_NOT_RUNNING_MESSAGE
            }
            _ => false,
        }
    }
}

/// A failed operation together with the instance snapshot read last
#[derive(Error, Debug)]
#[error("{error}")]
pub struct OperationError {
    #[source]
    pub error: Error,
    pub instance: Option<Box<Instance>>,
}

impl OperationError {
    pub fn new(error: Error, instance: Option<Instance>) -> Self {
        Self { error, instance: instance.map(Box::new) }
    }

    /// The snapshot that was current when the operation failed, if any
    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_deref()
    }

    pub fn into_parts(self) -> (Error, Option<Instance>) {
        (self.error, self.instance.map(|i| *i))
    }
}

impl From<Error> for OperationError {
    fn from(error: Error) -> Self {
        Self { error, instance: None }
    }
}

/// Attach an instance snapshot to a plain `Result`
pub trait WithSnapshot<T> {
    fn snapshot(self, instance: &Instance) -> OpResult<T>;
}

impl<T> WithSnapshot<T> for Result<T> {
    fn snapshot(self, instance: &Instance) -> OpResult<T> {
        self.map_err(|error| OperationError::new(error, Some(instance.clone())))
    }
}
