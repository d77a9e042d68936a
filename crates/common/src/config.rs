//! Daemon config loader using TOML and serde.
//! Fields mirror the `weftd` flags; any value given on the command line
//! overrides the file.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::capacity::{Capacity, GIB};

/// Errors from reading or parsing a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Node capacity totals as written in the config file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CapacityConfig {
    #[serde(default)]
    pub cru: u64,
    #[serde(default)]
    pub mru_gib: u64,
    #[serde(default)]
    pub hru_gib: u64,
    #[serde(default)]
    pub sru_gib: u64,
    #[serde(default)]
    pub ipv4u: u64,
}

impl CapacityConfig {
    /// Expand GiB-denominated fields into a byte-valued [`Capacity`].
    pub fn to_capacity(&self) -> Capacity {
        Capacity {
            cru: self.cru,
            mru: self.mru_gib.saturating_mul(GIB),
            hru: self.hru_gib.saturating_mul(GIB),
            sru: self.sru_gib.saturating_mul(GIB),
            ipv4u: self.ipv4u,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Optional node id. If absent the daemon generates one.
    pub node_id: Option<String>,

    /// Working directory for the reservation store and node identity.
    pub data_dir: Option<String>,

    /// Bind address for the admission API (e.g. "127.0.0.1:2021").
    pub listen_addr: Option<String>,

    /// Path to the twins registry file (public keys and admin set).
    pub twins_file: Option<String>,

    /// Total node capacity offered for provisioning.
    pub capacity: Option<CapacityConfig>,

    /// Capacity held back for the node runtime itself, charged up front.
    pub reserved: Option<CapacityConfig>,

    /// Janitor scan interval in seconds.
    pub janitor_interval_secs: Option<u64>,

    /// Use mock primitive backends instead of real ones.
    pub mock_primitives: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: None,
            data_dir: Some("./data".to_string()),
            listen_addr: Some("127.0.0.1:2021".to_string()),
            twins_file: Some("./twins.toml".to_string()),
            capacity: Some(CapacityConfig {
                cru: 4,
                mru_gib: 8,
                hru_gib: 0,
                sru_gib: 100,
                ipv4u: 0,
            }),
            reserved: None,
            janitor_interval_secs: Some(10),
            mock_primitives: Some(true),
        }
    }
}

/// Load config from a TOML file path.
/// If the file is missing or fails to parse, an error is returned.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: Config = toml::from_str(&s)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let def = Config::default();
        assert!(def.data_dir.is_some());
        assert!(def.listen_addr.is_some());
        assert!(def.capacity.is_some());
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        use std::io::Write;
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            node_id = "node-xyz"
            data_dir = "./mydata"
            listen_addr = "0.0.0.0:2021"
            janitor_interval_secs = 5

            [capacity]
            cru = 8
            mru_gib = 16
            sru_gib = 250
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.node_id.unwrap(), "node-xyz");
        assert_eq!(cfg.janitor_interval_secs.unwrap(), 5);
        let cap = cfg.capacity.unwrap().to_capacity();
        assert_eq!(cap.cru, 8);
        assert_eq!(cap.mru, 16 * GIB);
        assert_eq!(cap.ipv4u, 0);
    }
}
