use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::actor::RetryConfig;
use crate::constants::{
    BLOCK_SIZE_OPTIMIZATION_DIFFERENCE, DEFAULT_DOWNLOAD_BLOCK_SIZE, DEFAULT_MAX_QUOTA,
    DOWNLOADED_QUOTA_SAFETY_THRESHOLD, MAX_MAILBOX_FAILURES, NORMALIZATION_WINDOW,
    OPTIMIZATION_INTERVAL_SECS, PARALLEL_OPTIMIZATION_DIFFERENCE, POSTPONE_DELAY_SECS,
    THROUGHPUT_THRESHOLD,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Accounts that can be imported
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Which account to use by default (index into accounts)
    #[serde(default)]
    pub default_account: Option<usize>,
    /// Tuning of the sync engine
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Authentication method for an account
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// LOGIN with a stored password
    #[default]
    Password,
    /// XOAUTH2 with an access token obtained elsewhere
    OAuth2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    /// Login name, if it differs from the email address
    #[serde(default)]
    pub username: Option<String>,
    pub imap: ImapConfig,
    #[serde(default)]
    pub auth: AuthMethod,
    /// Bytes one session may download before it is postponed
    #[serde(default = "default_max_quota")]
    pub max_quota: u64,
}

impl AccountConfig {
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between two parallel optimizer runs
    #[serde(default = "default_optimization_interval_secs")]
    pub optimization_interval_secs: u64,
    /// Workers started per increase
    #[serde(default = "default_parallel_optimization_difference")]
    pub parallel_optimization_difference: usize,
    /// Tolerated throughput drop (bytes/ms) that still counts as no drop
    #[serde(default = "default_throughput_threshold")]
    pub throughput_threshold: f64,
    /// Messages added to or removed from a fetch block per adjustment
    #[serde(default = "default_block_size_optimization_difference")]
    pub block_size_optimization_difference: u32,
    #[serde(default = "default_initial_download_block_size")]
    pub initial_download_block_size: u32,
    /// Finished measurement windows averaged into the normalized score
    #[serde(default = "default_normalization_window")]
    pub normalization_window: usize,
    #[serde(default = "default_quota_safety_threshold")]
    pub quota_safety_threshold: u64,
    #[serde(default = "default_postpone_delay_secs")]
    pub postpone_delay_secs: u64,
    /// Failed workers tolerated per mailbox and session
    #[serde(default = "default_max_mailbox_failures")]
    pub max_mailbox_failures: u32,
    /// Backoff for the mailbox discovery connection
    #[serde(default)]
    pub discovery_retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            optimization_interval_secs: default_optimization_interval_secs(),
            parallel_optimization_difference: default_parallel_optimization_difference(),
            throughput_threshold: default_throughput_threshold(),
            block_size_optimization_difference: default_block_size_optimization_difference(),
            initial_download_block_size: default_initial_download_block_size(),
            normalization_window: default_normalization_window(),
            quota_safety_threshold: default_quota_safety_threshold(),
            postpone_delay_secs: default_postpone_delay_secs(),
            max_mailbox_failures: default_max_mailbox_failures(),
            discovery_retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn optimization_interval(&self) -> Duration {
        Duration::from_secs(self.optimization_interval_secs)
    }

    pub fn postpone_delay(&self) -> Duration {
        Duration::from_secs(self.postpone_delay_secs)
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_max_quota() -> u64 {
    DEFAULT_MAX_QUOTA
}

fn default_optimization_interval_secs() -> u64 {
    OPTIMIZATION_INTERVAL_SECS
}

fn default_parallel_optimization_difference() -> usize {
    PARALLEL_OPTIMIZATION_DIFFERENCE
}

fn default_throughput_threshold() -> f64 {
    THROUGHPUT_THRESHOLD
}

fn default_block_size_optimization_difference() -> u32 {
    BLOCK_SIZE_OPTIMIZATION_DIFFERENCE
}

fn default_initial_download_block_size() -> u32 {
    DEFAULT_DOWNLOAD_BLOCK_SIZE
}

fn default_normalization_window() -> usize {
    NORMALIZATION_WINDOW
}

fn default_quota_safety_threshold() -> u64 {
    DOWNLOADED_QUOTA_SAFETY_THRESHOLD
}

fn default_postpone_delay_secs() -> u64 {
    POSTPONE_DELAY_SECS
}

fn default_max_mailbox_failures() -> u32 {
    MAX_MAILBOX_FAILURES
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("imap-adsync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("imap-adsync");
        Ok(dir)
    }

    pub fn state_db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("state.db"))
    }

    /// Get the default account (first account or the one specified by default_account)
    pub fn default_account(&self) -> Option<&AccountConfig> {
        if let Some(idx) = self.default_account {
            self.accounts.get(idx)
        } else {
            self.accounts.first()
        }
    }

    pub fn account_by_email(&self, email: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.email == email)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 email = \"you@example.com\"\n\n\
                 [accounts.imap]\n\
                 server = \"imap.example.com\"\n\n\
                 [sync]\n\
                 optimization_interval_secs = 5",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if let Some(idx) = config.default_account
            && idx >= config.accounts.len()
        {
            anyhow::bail!(
                "default_account = {} but only {} account(s) are configured",
                idx,
                config.accounts.len()
            );
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = path
            .parent()
            .context("Config path has no parent directory")?;

        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        Ok(())
    }
}
