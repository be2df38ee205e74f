//! Version-aware replication statements
//!
//! MySQL 8.0.26 renamed the replication vocabulary (`STOP REPLICA`,
//! `CHANGE REPLICATION SOURCE TO`, `source_pos_wait()`), and 8.4 dropped the
//! old spellings of `SHOW MASTER STATUS` and `RESET MASTER`. MariaDB keeps the
//! classic statements. Placeholders are `?` and are bound by the caller.

/// Parse the leading `major.minor.patch` of a server version string
pub fn parse_version(version: &str) -> (u32, u32, u32) {
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Statement provider for one server flavor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatements {
    replica_terms: bool,
    binary_log_terms: bool,
}

impl QueryStatements {
    /// Pick the vocabulary for a server reporting `version`
    pub fn for_version(version: &str) -> Self {
        if version.contains("MariaDB") || version.to_lowercase().contains("maxscale") {
            return Self::default();
        }
        let v = parse_version(version);
        Self {
            replica_terms: v >= (8, 0, 26),
            binary_log_terms: v >= (8, 4, 0),
        }
    }

    pub fn uses_replica_terms(&self) -> bool {
        self.replica_terms
    }

    fn pick(&self, legacy: &'static str, modern: &'static str) -> &'static str {
        if self.replica_terms {
            modern
        } else {
            legacy
        }
    }

    pub fn stop_replica(&self) -> &'static str {
        self.pick("stop slave", "stop replica")
    }

    pub fn start_replica(&self) -> &'static str {
        self.pick("start slave", "start replica")
    }

    pub fn stop_io_thread(&self) -> &'static str {
        self.pick("stop slave io_thread", "stop replica io_thread")
    }

    pub fn start_io_thread(&self) -> &'static str {
        self.pick("start slave io_thread", "start replica io_thread")
    }

    pub fn stop_sql_thread(&self) -> &'static str {
        self.pick("stop slave sql_thread", "stop replica sql_thread")
    }

    pub fn start_sql_thread(&self) -> &'static str {
        self.pick("start slave sql_thread", "start replica sql_thread")
    }

    pub fn reset_replica(&self) -> &'static str {
        self.pick("reset slave", "reset replica")
    }

    pub fn reset_replica_all(&self) -> &'static str {
        self.pick("reset slave all", "reset replica all")
    }

    pub fn show_replica_status(&self) -> &'static str {
        self.pick("show slave status", "show replica status")
    }

    pub fn show_replica_hosts(&self) -> &'static str {
        self.pick("show slave hosts", "show replicas")
    }

    pub fn show_master_status(&self) -> &'static str {
        if self.binary_log_terms {
            "show binary log status"
        } else {
            "show master status"
        }
    }

    pub fn reset_master(&self) -> &'static str {
        if self.binary_log_terms {
            "reset binary logs and gtids"
        } else {
            "reset master"
        }
    }

    pub fn change_master_to_host_port(&self) -> &'static str {
        self.pick(
            "change master to master_host=?, master_port=?",
            "change replication source to source_host=?, source_port=?",
        )
    }

    pub fn change_master_to_host_port_log(&self) -> &'static str {
        self.pick(
            "change master to master_host=?, master_port=?, master_log_file=?, master_log_pos=?",
            "change replication source to source_host=?, source_port=?, source_log_file=?, source_log_pos=?",
        )
    }

    /// MariaDB only
    pub fn change_master_to_host_port_log_gtid_no(&self) -> &'static str {
        "change master to master_host=?, master_port=?, master_log_file=?, master_log_pos=?, master_use_gtid=no"
    }

    /// MariaDB only; `gtid_position` is `slave_pos` or `current_pos`
    pub fn change_master_to_host_port_use_gtid(&self, gtid_position: &str) -> String {
        format!(
            "change master to master_host=?, master_port=?, master_use_gtid={}",
            gtid_position
        )
    }

    pub fn change_master_to_host_port_log_autoposition_no(&self) -> &'static str {
        self.pick(
            "change master to master_host=?, master_port=?, master_log_file=?, master_log_pos=?, master_auto_position=0",
            "change replication source to source_host=?, source_port=?, source_log_file=?, source_log_pos=?, source_auto_position=0",
        )
    }

    pub fn change_master_to_host_port_autoposition_yes(&self) -> &'static str {
        self.pick(
            "change master to master_host=?, master_port=?, master_auto_position=1",
            "change replication source to source_host=?, source_port=?, source_auto_position=1",
        )
    }

    /// Replaces the source host so a reset replica no longer reports the old one
    pub fn change_master_to_blank_host(&self) -> &'static str {
        self.pick(
            "change master to master_host='_'",
            "change replication source to source_host='_'",
        )
    }

    pub fn change_master_to_master_delay(&self, seconds: u32) -> String {
        format!(
            "{} {}",
            self.pick("change master to master_delay =", "change replication source to source_delay ="),
            seconds
        )
    }

    pub fn change_master_to_master_ssl(&self) -> &'static str {
        self.pick("change master to master_ssl=1", "change replication source to source_ssl=1")
    }

    pub fn change_master_to_get_source_public_key(&self) -> &'static str {
        self.pick(
            "change master to get_master_public_key=1",
            "change replication source to get_source_public_key=1",
        )
    }

    /// `CHANGE ... TO` prefix for a comma-joined parameter list
    pub fn change_master_to_with_params(&self, params: &[&str]) -> String {
        format!(
            "{} {}",
            self.pick("change master to", "change replication source to"),
            params.join(", ")
        )
    }

    pub fn master_user_param(&self) -> &'static str {
        self.pick("master_user=?", "source_user=?")
    }

    pub fn master_password_param(&self) -> &'static str {
        self.pick("master_password=?", "source_password=?")
    }

    pub fn master_ssl_ca_param(&self) -> &'static str {
        self.pick("master_ssl_ca=?", "source_ssl_ca=?")
    }

    pub fn master_ssl_cert_param(&self) -> &'static str {
        self.pick("master_ssl_cert=?", "source_ssl_cert=?")
    }

    pub fn master_ssl_key_param(&self) -> &'static str {
        self.pick("master_ssl_key=?", "source_ssl_key=?")
    }

    pub fn master_ssl_param(&self) -> &'static str {
        self.pick("master_ssl=1", "source_ssl=1")
    }

    pub fn start_until_master_log(&self) -> &'static str {
        self.pick(
            "start slave until master_log_file=?, master_log_pos=?",
            "start replica until source_log_file=?, source_log_pos=?",
        )
    }

    pub fn set_skip_counter(&self) -> &'static str {
        self.pick(
            "set global sql_slave_skip_counter := 1",
            "set global sql_replica_skip_counter := 1",
        )
    }

    pub fn select_master_pos_wait(&self) -> &'static str {
        self.pick("select master_pos_wait(?, ?)", "select source_pos_wait(?, ?)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.32-log"), (8, 0, 32));
        assert_eq!(parse_version("10.6.12-MariaDB-log"), (10, 6, 12));
        assert_eq!(parse_version("5.7"), (5, 7, 0));
        assert_eq!(parse_version(""), (0, 0, 0));
    }

    #[test]
    fn test_vocabulary_by_version() {
        let legacy = QueryStatements::for_version("5.7.40-log");
        assert_eq!(legacy.stop_replica(), "stop slave");
        assert_eq!(legacy.show_master_status(), "show master status");

        let mariadb = QueryStatements::for_version("10.11.2-MariaDB");
        assert!(!mariadb.uses_replica_terms());
        assert_eq!(mariadb.start_io_thread(), "start slave io_thread");

        let modern = QueryStatements::for_version("8.0.35");
        assert_eq!(modern.stop_replica(), "stop replica");
        assert_eq!(modern.reset_master(), "reset master");
        assert!(modern.change_master_to_host_port().starts_with("change replication source to"));

        let lts = QueryStatements::for_version("8.4.0");
        assert_eq!(lts.show_master_status(), "show binary log status");
        assert_eq!(lts.reset_master(), "reset binary logs and gtids");
    }

    #[test]
    fn test_params_and_delay() {
        let qsp = QueryStatements::for_version("5.7.40");
        assert_eq!(
            qsp.change_master_to_with_params(&[qsp.master_user_param(), qsp.master_password_param()]),
            "change master to master_user=?, master_password=?"
        );
        assert_eq!(qsp.change_master_to_master_delay(30), "change master to master_delay = 30");
    }
}
