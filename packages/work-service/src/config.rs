//! Host configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Configuration for a work-service host process.
#[derive(Debug, Clone)]
pub struct WorkConfig {
    pub database_url: String,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub invisibility: Duration,
    pub lease_cap: Duration,
    /// Base instance name; must be unique per process for lease repair.
    pub instance_name: String,
    /// Root directory for log blobs. Unset means logs are captured
    /// in-memory only and no artifacts are written.
    pub log_root: Option<PathBuf>,
}

impl WorkConfig {
    /// Load configuration from environment variables (and `.env` in
    /// development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_count: parse_var("WORK_WORKER_COUNT", 2)?,
            poll_interval: Duration::from_secs(parse_var("WORK_POLL_INTERVAL_SECS", 10)?),
            invisibility: Duration::from_secs(parse_var("WORK_INVISIBILITY_SECS", 1_800)?),
            lease_cap: Duration::from_secs(parse_var("WORK_LEASE_CAP_SECS", 7_200)?),
            instance_name: env::var("WORK_INSTANCE_NAME")
                .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4())),
            log_root: env::var("WORK_LOG_ROOT").ok().map(PathBuf::from),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .ok()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}
