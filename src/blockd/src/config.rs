//! Daemon configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RamdiskConfig {
    pub block_size: u32,
    pub block_count: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_transfer_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Bytes moved per transaction; must be a block multiple.
    pub transfer_size: u32,
    /// Total bytes written and read back.
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub default_log_level: String,
    pub ramdisk: RamdiskConfig,
    pub workload: WorkloadConfig,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_log_level: default_log_level(),
            ramdisk: RamdiskConfig {
                block_size: 512,
                block_count: 8192,
                max_transfer_size: 0,
            },
            workload: WorkloadConfig {
                transfer_size: 4096,
                total_bytes: 1 << 22,
            },
        }
    }
}
