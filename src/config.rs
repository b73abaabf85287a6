// src/config.rs
//! Configuration file parsing
//!
//! TOML configuration with the following sections, all optional:
//! - [store] - Store root, commit retry policy
//! - [keys] - Key table database path
//! - [catalog] - Catalog service URL and call spacing
//! - [manifests] - Manifest download URL
//! - [reconcile] - Scheduled pass interval, on-demand budget
//! - [analysis] - DLC analysis budget

use crate::store::RetryPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub keys: KeysSection,

    #[serde(default)]
    pub catalog: CatalogSection,

    #[serde(default)]
    pub manifests: ManifestsSection,

    #[serde(default)]
    pub reconcile: ReconcileSection,

    #[serde(default)]
    pub analysis: AnalysisSection,
}

#[derive(Debug, Deserialize)]
pub struct StoreSection {
    /// Directory holding one subdirectory per title
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Total write attempts per commit, counting the first; 4 is one try plus 3 retries
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base retry delay (e.g. "1s"); attempt n waits n times this
    #[serde(default = "default_one_second")]
    pub retry_delay: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_one_second(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KeysSection {
    /// SQLite database for the depot key table
    #[serde(default = "default_keys_db")]
    pub db_path: PathBuf,
}

impl Default for KeysSection {
    fn default() -> Self {
        Self {
            db_path: default_keys_db(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CatalogSection {
    /// Catalog service base URL; without it the catalog is never consulted
    #[serde(default)]
    pub base_url: Option<String>,

    /// Minimum spacing between catalog calls
    #[serde(default = "default_one_second")]
    pub min_interval: String,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            base_url: None,
            min_interval: default_one_second(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ManifestsSection {
    /// Base URL serving `<depot>_<revision>.manifest`
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileSection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between scheduled passes
    #[serde(default = "default_reconcile_interval")]
    pub interval: String,

    /// Wall-clock budget for on-demand single-title runs
    #[serde(default = "default_budget")]
    pub on_demand_budget: String,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reconcile_interval(),
            on_demand_budget: default_budget(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalysisSection {
    #[serde(default = "default_budget")]
    pub budget: String,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            budget: default_budget(),
        }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/lib/depotkeep/store")
}

fn default_keys_db() -> PathBuf {
    PathBuf::from("/var/lib/depotkeep/keys.db")
}

fn default_retry_attempts() -> u32 {
    crate::store::DEFAULT_RETRY_ATTEMPTS
}

fn default_one_second() -> String {
    "1s".to_string()
}

fn default_reconcile_interval() -> String {
    "6h".to_string()
}

fn default_budget() -> String {
    "15s".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.retry_attempts == 0 {
            anyhow::bail!("store.retry_attempts must be at least 1");
        }

        self.retry_policy()?;
        self.catalog_min_interval()?;
        self.on_demand_budget()?;
        self.analysis_budget()?;

        if self.reconcile_interval()?.is_zero() {
            anyhow::bail!("reconcile.interval must be greater than zero");
        }

        for (field, url) in [
            ("catalog.base_url", &self.catalog.base_url),
            ("manifests.base_url", &self.manifests.base_url),
        ] {
            if let Some(url) = url
                && !(url.starts_with("http://") || url.starts_with("https://"))
            {
                anyhow::bail!("{} must be an http(s) URL, got '{}'", field, url);
            }
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            attempts: self.store.retry_attempts,
            delay: parse_duration(&self.store.retry_delay).context("store.retry_delay")?,
        })
    }

    pub fn catalog_min_interval(&self) -> Result<Duration> {
        parse_duration(&self.catalog.min_interval).context("catalog.min_interval")
    }

    pub fn reconcile_interval(&self) -> Result<Duration> {
        parse_duration(&self.reconcile.interval).context("reconcile.interval")
    }

    pub fn on_demand_budget(&self) -> Result<Duration> {
        parse_duration(&self.reconcile.on_demand_budget).context("reconcile.on_demand_budget")
    }

    pub fn analysis_budget(&self) -> Result<Duration> {
        parse_duration(&self.analysis.budget).context("analysis.budget")
    }
}

/// Parse a compact duration string (e.g. "250ms", "15s", "6h", "1w")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    if s.is_empty() || !s.is_ascii() {
        anyhow::bail!("Invalid duration '{}'", s);
    }

    if let Some(num_str) = s.strip_suffix("ms") {
        let num: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid duration number: {}", num_str))?;
        return Ok(Duration::from_millis(num));
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        _ => anyhow::bail!("Invalid duration unit in '{}'", s),
    };

    let num: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}
