//! Relay configuration types.
//!
//! The core consumes an already-constructed [`RelayConfig`]; assembling it
//! from CLI flags or a config file is the caller's job (see `main.rs`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream server flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    MySql,
    MariaDb,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::MySql => "mysql",
            Flavor::MariaDb => "mariadb",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" => Ok(Flavor::MySql),
            "mariadb" => Ok(Flavor::MariaDb),
            other => Err(format!("unknown flavor {other:?}, expected \"mysql\" or \"mariadb\"")),
        }
    }
}

/// Connection options for the upstream master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl MasterConfig {
    /// `host:port`, used as the master label on gauges and in logs.
    pub fn node(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
        }
    }
}

/// Static configuration of one relay instance.
///
/// Updating any of these requires a stop/restart; there is no online
/// reconfiguration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Server id this relay presents to the master. Must differ from the
    /// master's own `server_id`.
    pub server_id: u32,
    pub flavor: Flavor,
    pub from: MasterConfig,
    pub charset: String,
    /// Use GTID-based start-sync and keep a GTID cursor in meta. When
    /// disabled the upstream stream runs in raw mode and only positions are
    /// tracked.
    pub enable_gtid: bool,
    /// Allow a one-shot GTID resync when the master reports purged binlogs.
    /// Only meaningful together with `enable_gtid`.
    pub auto_fix_gtid: bool,
    /// Root directory for relay log sub-directories; created if absent.
    pub relay_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            flavor: Flavor::MySql,
            from: MasterConfig::default(),
            charset: "utf8mb4".to_string(),
            enable_gtid: false,
            auto_fix_gtid: false,
            relay_dir: PathBuf::from("relay-logs"),
        }
    }
}
