//! Configuration management for the scheduler server
//!
//! Loads and validates `server.toml` at startup and the machine types file
//! on demand, so lease-management configuration can change without a
//! restart. The scheduler configuration itself is immutable for the
//! process lifetime.

use anyhow::{Context, Result};
use shared::config::{MachineTypeConfig, MachineTypesConfig, SchedulerConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct ConfigManager {
    /// The validated scheduler configuration.
    pub server_config: SchedulerConfig,
    /// Path of the machine types file, when lease management is enabled.
    machine_types_path: Option<PathBuf>,
    /// Last successfully loaded machine types.
    machine_types: MachineTypesConfig,
}

impl ConfigManager {
    /// Loads the server configuration and, if configured, the machine types
    /// file next to it.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let content = std::fs::read_to_string(config_path).with_context(|| {
            format!("Failed to read config file: {}", config_path.display())
        })?;
        let server_config = SchedulerConfig::from_toml(&content)?;

        let machine_types_path = server_config.machine_types_file.as_ref().map(|file| {
            let path = PathBuf::from(file);
            if path.is_relative() {
                // Relative paths resolve against the server config file.
                config_path
                    .parent()
                    .map(|dir| dir.join(&path))
                    .unwrap_or(path)
            } else {
                path
            }
        });

        let mut manager = Self {
            server_config,
            machine_types_path,
            machine_types: MachineTypesConfig::default(),
        };
        if manager.machine_types_path.is_some() {
            manager.reload_machine_types()?;
            info!(
                machine_types = manager.machine_types.machine_types.len(),
                "Machine types loaded"
            );
        }
        Ok(manager)
    }

    /// Applies command-line overrides on top of the loaded configuration.
    pub fn apply_overrides(
        &mut self,
        listen_address: Option<String>,
        api_key: Option<String>,
        data_dir: Option<String>,
    ) -> Result<()> {
        if let Some(listen_address) = listen_address {
            self.server_config.listen_address = listen_address;
        }
        if let Some(api_key) = api_key {
            self.server_config.api_key = api_key;
        }
        if let Some(data_dir) = data_dir {
            self.server_config.data_dir = data_dir;
        }
        self.server_config.validate()
    }

    /// Re-reads the machine types file. On a parse or validation error the
    /// previous configuration stays in effect.
    pub fn reload_machine_types(&mut self) -> Result<()> {
        let Some(path) = &self.machine_types_path else {
            return Ok(());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read machine types: {}", path.display()))?;
        match MachineTypesConfig::from_toml(&content) {
            Ok(config) => {
                self.machine_types = config;
                Ok(())
            }
            Err(e) => {
                warn!("Keeping previous machine types, reload failed: {}", e);
                Ok(())
            }
        }
    }

    /// The currently effective machine type configurations.
    pub fn machine_types(&self) -> Vec<MachineTypeConfig> {
        self.machine_types.machine_types.clone()
    }
}
