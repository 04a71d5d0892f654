//! Binlog positions and file-name ordering.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// A position inside the master's binlog: file name plus byte offset.
///
/// An empty name means "unknown, let the upstream decide where to start".
/// Positions order by the numeric suffix of the file name first, then by
/// offset, so `mysql-bin.000010:4` sorts after `mysql-bin.000009:500`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub name: String,
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_name = match (binlog_file_index(&self.name), binlog_file_index(&other.name)) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            // Unparsable names fall back to plain lexicographic order.
            _ => self.name.cmp(&other.name),
        };
        by_name.then(self.pos.cmp(&other.pos))
    }
}

/// Parse the numeric suffix of a binlog file name (`mysql-bin.000042` -> 42).
pub fn binlog_file_index(name: &str) -> Result<u64> {
    let (_, suffix) = name
        .rsplit_once('.')
        .ok_or_else(|| RelayError::InvalidBinlogFilename(name.to_string()))?;
    suffix
        .parse::<u64>()
        .map_err(|_| RelayError::InvalidBinlogFilename(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_index() {
        assert_eq!(binlog_file_index("mysql-bin.000001").unwrap(), 1);
        assert_eq!(binlog_file_index("mysql-bin.000042").unwrap(), 42);
        assert!(binlog_file_index("mysql-bin").is_err());
        assert!(binlog_file_index("mysql-bin.abc").is_err());
    }

    #[test]
    fn test_order_within_one_file() {
        let a = Position::new("mysql-bin.000001", 4);
        let b = Position::new("mysql-bin.000001", 120);
        assert!(a < b);
    }

    #[test]
    fn test_order_across_files_is_numeric() {
        // Offset must not override the file ordering.
        let a = Position::new("mysql-bin.000009", 5000);
        let b = Position::new("mysql-bin.000010", 4);
        assert!(a < b);
    }

    #[test]
    fn test_display() {
        let pos = Position::new("mysql-bin.000002", 200);
        assert_eq!(pos.to_string(), "(mysql-bin.000002, 200)");
    }
}
