//! Oracle GTID sets
//!
//! Parses `Executed_Gtid_Set` values such as
//! `00020192-1111-1111-1111-111111111111:1-20,00020193-1111-1111-1111-111111111111:1-5:8`
//! and computes the next transaction identifier a replica expects.

use std::fmt;

use crate::error::{Error, Result};

/// A contiguous run of transaction numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GtidInterval {
    pub start: u64,
    pub end: u64,
}

/// All transactions of one server UUID in a GTID set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleGtidSetEntry {
    pub uuid: String,
    pub intervals: Vec<GtidInterval>,
}

impl OracleGtidSetEntry {
    /// Parse `uuid:1-20:25`
    pub fn parse(token: &str) -> Result<Self> {
        let mut parts = token.trim().split(':');
        let uuid = parts
            .next()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Gtid(format!("missing server uuid in '{}'", token)))?
            .to_string();

        let mut intervals = Vec::new();
        for range in parts {
            let (start, end) = match range.split_once('-') {
                Some((s, e)) => (parse_number(s, token)?, parse_number(e, token)?),
                None => {
                    let n = parse_number(range, token)?;
                    (n, n)
                }
            };
            if end < start {
                return Err(Error::Gtid(format!("inverted interval in '{}'", token)));
            }
            intervals.push(GtidInterval { start, end });
        }
        if intervals.is_empty() {
            return Err(Error::Gtid(format!("no transaction range in '{}'", token)));
        }

        Ok(Self { uuid, intervals })
    }

    /// Highest transaction number recorded for this server
    pub fn last_transaction(&self) -> u64 {
        self.intervals.iter().map(|i| i.end).max().unwrap_or(0)
    }

    /// GTID of the transaction following the last one recorded
    pub fn next_gtid(&self) -> String {
        format!("{}:{}", self.uuid, self.last_transaction() + 1)
    }
}

impl fmt::Display for OracleGtidSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for interval in &self.intervals {
            if interval.start == interval.end {
                write!(f, ":{}", interval.start)?;
            } else {
                write!(f, ":{}-{}", interval.start, interval.end)?;
            }
        }
        Ok(())
    }
}

fn parse_number(s: &str, token: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| Error::Gtid(format!("invalid transaction number '{}' in '{}'", s, token)))
}

/// A full Oracle GTID set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleGtidSet {
    pub entries: Vec<OracleGtidSetEntry>,
}

impl OracleGtidSet {
    pub fn parse(set: &str) -> Result<Self> {
        let entries = set
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(OracleGtidSetEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, uuid: &str) -> Option<&OracleGtidSetEntry> {
        self.entries.iter().find(|e| e.uuid.eq_ignore_ascii_case(uuid))
    }

    /// Next GTID to be applied from the given source; the last entry of the
    /// set is used when the source uuid is unknown or absent.
    pub fn next_gtid(&self, source_uuid: Option<&str>) -> Result<String> {
        let entry = source_uuid
            .and_then(|uuid| self.entry(uuid))
            .or_else(|| self.entries.last())
            .ok_or_else(|| Error::Gtid("empty executed GTID set; cannot compute next GTID".into()))?;
        Ok(entry.next_gtid())
    }
}

impl fmt::Display for OracleGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self.entries.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", tokens.join(","))
    }
}
