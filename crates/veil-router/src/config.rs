//! Router configuration
//!
//! Loaded from YAML; every field has a default so a partial file is enough.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use veil_garlic::GarlicConfig;
use veil_tunnel::{PoolConfig, DEFAULT_MAX_TRANSIT_TUNNELS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Tunnel pool settings applied to every local destination
    #[serde(default)]
    pub tunnels: PoolConfig,

    #[serde(default)]
    pub transit: TransitConfig,

    #[serde(default)]
    pub garlic: GarlicConfig,

    /// Messages queued per destination while no tunnel is ready
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// How long a peer that failed a build stays out of new paths
    #[serde(default = "default_exclusion_secs")]
    pub exclusion_secs: u64,

    /// Ask the network database for more peers below this many
    #[serde(default = "default_min_known_peers")]
    pub min_known_peers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitConfig {
    #[serde(default = "default_max_transit_tunnels")]
    pub max_tunnels: usize,
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_exclusion_secs() -> u64 {
    600
}

fn default_min_known_peers() -> usize {
    32
}

fn default_max_transit_tunnels() -> usize {
    DEFAULT_MAX_TRANSIT_TUNNELS
}

impl Default for TransitConfig {
    fn default() -> Self {
        TransitConfig {
            max_tunnels: default_max_transit_tunnels(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            tunnels: PoolConfig::default(),
            transit: TransitConfig::default(),
            garlic: GarlicConfig::default(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            exclusion_secs: default_exclusion_secs(),
            min_known_peers: default_min_known_peers(),
        }
    }
}

impl RouterConfig {
    /// Load and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: RouterConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tunnels
            .validate()
            .context("Invalid tunnel configuration")?;
        if self.outbound_queue_capacity == 0 {
            bail!("outbound_queue_capacity must be positive");
        }
        if self.garlic.one_time_tag_capacity == 0 {
            bail!("garlic.one_time_tag_capacity must be positive");
        }
        Ok(())
    }
}
