//! Instance identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Default MySQL port, used when a key is parsed without one
pub const DEFAULT_PORT: u16 = 3306;

/// Identity of a database instance: `(hostname, port)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// A key is usable when it names a host and a port
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.hostname != "_" && self.port > 0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl FromStr for InstanceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty instance key".into()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidArgument(format!("invalid port in instance key: {}", s)))?;
                if host.is_empty() {
                    return Err(Error::InvalidArgument(format!("empty hostname in instance key: {}", s)));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let key: InstanceKey = "db1.example.com:3307".parse().unwrap();
        assert_eq!(key, InstanceKey::new("db1.example.com", 3307));
        assert_eq!(key.to_string(), "db1.example.com:3307");

        let key: InstanceKey = "db2".parse().unwrap();
        assert_eq!(key.port, DEFAULT_PORT);

        assert!("db3:notaport".parse::<InstanceKey>().is_err());
        assert!(":3306".parse::<InstanceKey>().is_err());
    }

    #[test]
    fn test_validity() {
        assert!(InstanceKey::new("db1", 3306).is_valid());
        assert!(!InstanceKey::new("", 3306).is_valid());
        assert!(!InstanceKey::new("_", 3306).is_valid());
        assert!(!InstanceKey::new("db1", 0).is_valid());
    }
}
