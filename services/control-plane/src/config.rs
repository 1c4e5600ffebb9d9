use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

use crate::db::DbConfig;
use crate::transfers::TransferSweeperConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,

    /// Cap on how many addresses one CIDR spec may expand to.
    pub allocation_expansion_limit: u64,

    /// Timeout for outbound daemon calls.
    pub daemon_timeout: Duration,

    pub sweeper: TransferSweeperConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("GANTRY_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("GANTRY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("GANTRY_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        let allocation_expansion_limit = env_u64("GANTRY_ALLOCATION_CIDR_LIMIT", 1024);

        let daemon_timeout = Duration::from_secs(env_u64("GANTRY_DAEMON_TIMEOUT_SECS", 30));

        let sweeper = TransferSweeperConfig {
            interval: Duration::from_secs(env_u64("GANTRY_TRANSFER_SWEEP_INTERVAL_SECS", 60)),
            expiry: Duration::from_secs(env_u64("GANTRY_TRANSFER_EXPIRY_SECS", 900)),
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            allocation_expansion_limit,
            daemon_timeout,
            sweeper,
        })
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
