//! Framework configuration
//!
//! Every duration is stored in milliseconds so config files stay plain
//! numbers (`election_timeout_ms = 3000`).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Leader election timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// How long a candidate waits for an `ElectionResponse`
    pub election_timeout_ms: u64,
    /// Leader heartbeat period
    pub heartbeat_period_ms: u64,
    /// Heartbeat age after which followers start an election
    pub heartbeat_timeout_ms: u64,
    /// Granularity of the per-service monitor loop
    pub tick_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 3_000,
            heartbeat_period_ms: 2_000,
            heartbeat_timeout_ms: 5_000,
            tick_ms: 100,
        }
    }
}

impl ElectionConfig {
    /// Election timeout
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Heartbeat period
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    /// Heartbeat timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Monitor tick
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Transaction engine timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    /// Commit deadline counted from the transaction start time
    pub commit_timeout_ms: u64,
    /// Bound on each fan-out request; defaults to twice the election timeout
    pub fanout_timeout_ms: Option<u64>,
    /// How long a write waits for a leader to become known
    pub leader_wait_ms: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            commit_timeout_ms: 20_000,
            fanout_timeout_ms: None,
            leader_wait_ms: 10_000,
        }
    }
}

/// Recovery of late joiners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run recovery when a follower activates a service
    pub enabled: bool,
    /// Wait before asking the leader, so a leader can be learned
    pub grace_period_ms: u64,
    /// Records per page while paging through the leader's data
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_ms: 5_000,
            page_size: 50,
        }
    }
}

impl SyncConfig {
    /// Grace period
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Cache engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Capacity of the bounded notification queue of each cache
    pub notification_queue: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            notification_queue: 1024,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlexusConfig {
    /// Leader election
    pub election: ElectionConfig,
    /// Transactions
    pub transaction: TransactionSettings,
    /// Recovery
    pub sync: SyncConfig,
    /// Caches
    pub cache: CacheSettings,
}

impl PlexusConfig {
    /// Short timers for in-process clusters
    pub fn fast() -> Self {
        Self {
            election: ElectionConfig {
                election_timeout_ms: 300,
                heartbeat_period_ms: 100,
                heartbeat_timeout_ms: 600,
                tick_ms: 20,
            },
            transaction: TransactionSettings {
                commit_timeout_ms: 5_000,
                fanout_timeout_ms: Some(1_500),
                leader_wait_ms: 3_000,
            },
            sync: SyncConfig {
                enabled: true,
                grace_period_ms: 400,
                page_size: 50,
            },
            cache: CacheSettings::default(),
        }
    }

    /// Load from a `.toml`, `.yml` or `.yaml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("yml") | Some("yaml") => Self::from_yaml_str(&content)?,
            other => {
                return Err(Error::config(format!(
                    "unsupported config extension {other:?} for {}",
                    path.display()
                )));
            }
        };
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse TOML
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| Error::config(format!("yaml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the election timeout
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election.election_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the commit deadline
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.transaction.commit_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable/disable recovery on activation
    pub fn with_sync(mut self, enabled: bool) -> Self {
        self.sync.enabled = enabled;
        self
    }

    /// Bound on each fan-out request
    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(
            self.transaction
                .fanout_timeout_ms
                .unwrap_or(2 * self.election.election_timeout_ms),
        )
    }

    /// Commit deadline
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction.commit_timeout_ms)
    }

    /// Leader wait
    pub fn leader_wait(&self) -> Duration {
        Duration::from_millis(self.transaction.leader_wait_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let e = &self.election;
        if e.election_timeout_ms == 0 || e.heartbeat_period_ms == 0 || e.tick_ms == 0 {
            return Err(Error::config("election timers must be non-zero"));
        }
        if e.heartbeat_timeout_ms <= e.heartbeat_period_ms {
            return Err(Error::config(
                "heartbeat_timeout_ms must exceed heartbeat_period_ms",
            ));
        }
        if self.transaction.commit_timeout_ms == 0 {
            return Err(Error::config("commit_timeout_ms must be non-zero"));
        }
        if self.sync.page_size == 0 {
            return Err(Error::config("sync.page_size must be at least 1"));
        }
        if self.cache.notification_queue == 0 {
            return Err(Error::config("cache.notification_queue must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlexusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.election.election_timeout(), Duration::from_secs(3));
        assert_eq!(config.fanout_timeout(), Duration::from_secs(6));
        assert_eq!(config.commit_timeout(), Duration::from_secs(20));
        assert_eq!(config.sync.page_size, 50);
    }

    #[test]
    fn test_fast_profile_is_valid() {
        assert!(PlexusConfig::fast().validate().is_ok());
    }

    #[test]
    fn test_toml_partial() {
        let config = PlexusConfig::from_toml_str(
            r#"
            [election]
            election_timeout_ms = 1000

            [transaction]
            fanout_timeout_ms = 750
            "#,
        )
        .unwrap();
        assert_eq!(config.election.election_timeout_ms, 1000);
        assert_eq!(config.election.heartbeat_period_ms, 2000);
        assert_eq!(config.fanout_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn test_yaml_rejects_bad_heartbeat() {
        let result = PlexusConfig::from_yaml_str(
            "election:\n  heartbeat_period_ms: 5000\n  heartbeat_timeout_ms: 1000\n",
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plexus.yml");
        std::fs::write(&path, "sync:\n  page_size: 10\n").unwrap();
        let config = PlexusConfig::from_file(&path).unwrap();
        assert_eq!(config.sync.page_size, 10);

        let bad = dir.path().join("plexus.ini");
        std::fs::write(&bad, "").unwrap();
        assert!(PlexusConfig::from_file(&bad).is_err());
    }
}
