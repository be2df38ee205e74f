//! Binlog coordinates
//!
//! A replication stream position: `(log file, byte offset)`. Coordinates are
//! ordered by the numeric suffix of the log file and then by position, which
//! is only meaningful for coordinates drawn from the same stream lineage.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Size of the binlog magic header; the first event of every file starts here
pub const BINLOG_HEADER_SIZE: u64 = 4;

/// A position in a binary (or relay) log
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: u64,
}

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log_file.is_empty()
    }

    fn split(&self) -> (&str, &str) {
        match self.log_file.rsplit_once('.') {
            Some((prefix, num)) => (prefix, num),
            None => ("", self.log_file.as_str()),
        }
    }

    /// Numeric suffix of the log file and its digit count; `(0, 0)` if unparsable
    pub fn file_number(&self) -> (u64, usize) {
        let (_, num) = self.split();
        match num.parse::<u64>() {
            Ok(n) => (n, num.len()),
            Err(_) => (0, 0),
        }
    }

    /// Number of log rotations from `self` to `other` (negative when `other` is older)
    pub fn file_number_distance(&self, other: &BinlogCoordinates) -> i64 {
        let (this_number, _) = self.file_number();
        let (other_number, _) = other.file_number();
        other_number as i64 - this_number as i64
    }

    /// Strictly smaller in the stream order
    pub fn smaller_than(&self, other: &BinlogCoordinates) -> bool {
        self.cmp(other) == Ordering::Less
    }

    /// Smaller than or equal to
    pub fn smaller_than_or_equals(&self, other: &BinlogCoordinates) -> bool {
        self.cmp(other) != Ordering::Greater
    }

    /// Same log file, regardless of position
    pub fn same_file(&self, other: &BinlogCoordinates) -> bool {
        self.log_file == other.log_file
    }

    /// Start of the next log file in the sequence
    pub fn next_file_coordinates(&self) -> Result<BinlogCoordinates> {
        let (prefix, _) = self.split();
        let (number, width) = self.file_number();
        if width == 0 {
            return Err(Error::InvalidCoordinates(format!(
                "cannot compute next file of {}",
                self.log_file
            )));
        }
        let next = format!("{:0width$}", number + 1, width = width);
        let log_file = if prefix.is_empty() && !self.log_file.contains('.') {
            next
        } else {
            format!("{}.{}", prefix, next)
        };
        Ok(BinlogCoordinates::new(log_file, BINLOG_HEADER_SIZE))
    }
}

impl Ord for BinlogCoordinates {
    fn cmp(&self, other: &Self) -> Ordering {
        let (this_prefix, _) = self.split();
        let (other_prefix, _) = other.split();
        this_prefix
            .cmp(other_prefix)
            .then_with(|| self.file_number().0.cmp(&other.file_number().0))
            .then_with(|| self.log_file.cmp(&other.log_file))
            .then_with(|| self.log_pos.cmp(&other.log_pos))
    }
}

impl PartialOrd for BinlogCoordinates {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}
