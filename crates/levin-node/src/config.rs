//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use levin_p2p::OverlayConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Overlay configuration.
    #[serde(default)]
    pub overlay: OverlayConfig,
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_args(args);
        Ok(config)
    }

    /// Override file values with flags given on the command line.
    fn apply_args(&mut self, args: &Args) {
        let overlay = &mut self.overlay;

        if let Some(ref bind_ip) = args.bind_ip {
            overlay.bind_ip = bind_ip.clone();
        }
        if let Some(port) = args.port {
            overlay.bind_port = port;
        }
        if let Some(port) = args.external_port {
            overlay.external_port = Some(port);
        }
        if let Some(target) = args.target_connections {
            overlay.target_connections = target;
        }
        if let Some(max) = args.max_incoming {
            overlay.max_incoming = Some(max);
        }
        if !args.seed.is_empty() {
            overlay.seed_peers = args.seed.clone();
        }
        if let Some(ref state_file) = args.state_file {
            overlay.state_file = state_file.clone();
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
