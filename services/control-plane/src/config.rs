use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::bus::PubsubConfig;
use crate::db::DbConfig;
use crate::orchestrator::Settings;
use crate::remote::GcpConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,

    /// `None` selects the in-memory store.
    pub database: Option<DbConfig>,

    /// Secret the `/tasks` endpoints require.
    pub task_token: Option<String>,

    pub settings: Settings,
    pub refresh_interval: Duration,
    pub gcp: GcpConfig,
    pub pubsub: PubsubConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("BATCHFLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("BATCHFLEET_LISTEN_ADDR is not a socket address")?;

        let log_level = var("BATCHFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = var("BATCHFLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_lookup(&var);

        let task_token = var("BATCHFLEET_TASK_TOKEN").filter(|t| !t.is_empty());
        if task_token.is_none() && !dev_mode {
            bail!("BATCHFLEET_TASK_TOKEN must be set outside dev mode");
        }

        let seconds = |key: &str, default: u64| -> Result<Duration> {
            match var(key) {
                Some(raw) => raw
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a whole number of seconds")),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let settings = Settings {
            poll_interval: seconds("BATCHFLEET_POLL_INTERVAL_SECS", 30)?,
            publish_retry: seconds("BATCHFLEET_PUBLISH_RETRY_SECS", 30)?,
        };
        let refresh_interval = seconds("BATCHFLEET_REFRESH_INTERVAL_SECS", 300)?;

        let access_token = var("BATCHFLEET_GCP_ACCESS_TOKEN");
        let mut gcp = GcpConfig {
            access_token: access_token.clone(),
            ..Default::default()
        };
        if let Some(url) = var("BATCHFLEET_DEPLOYMENT_MANAGER_URL") {
            gcp.deployment_manager_url = url;
        }
        if let Some(url) = var("BATCHFLEET_COMPUTE_URL") {
            gcp.compute_url = url;
        }
        let mut pubsub = PubsubConfig {
            access_token,
            ..Default::default()
        };
        if let Some(url) = var("BATCHFLEET_PUBSUB_URL") {
            pubsub.base_url = url;
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            task_token,
            settings,
            refresh_interval,
            gcp,
            pubsub,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_dev_defaults() {
        let config = load(&[("BATCHFLEET_DEV", "true")]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert!(config.database.is_none());
        assert!(config.task_token.is_none());
        assert_eq!(config.settings.poll_interval, Duration::from_secs(30));
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_task_token_required_outside_dev() {
        assert!(load(&[]).is_err());
        let config = load(&[("BATCHFLEET_TASK_TOKEN", "s3cret")]).unwrap();
        assert_eq!(config.task_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BATCHFLEET_DEV", "1"),
            ("BATCHFLEET_POLL_INTERVAL_SECS", "5"),
            ("BATCHFLEET_PUBSUB_URL", "http://localhost:8085/v1"),
            ("BATCHFLEET_GCP_ACCESS_TOKEN", "tok"),
        ])
        .unwrap();
        assert_eq!(config.settings.poll_interval, Duration::from_secs(5));
        assert_eq!(config.pubsub.base_url, "http://localhost:8085/v1");
        assert_eq!(config.gcp.access_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_bad_interval_rejected() {
        assert!(load(&[("BATCHFLEET_DEV", "1"), ("BATCHFLEET_POLL_INTERVAL_SECS", "soon")]).is_err());
    }
}
