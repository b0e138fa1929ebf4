//! Application configuration, persisted as JSON under the platform config
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::discovery::DISCOVERY_PORT;
use crate::transfer::TRANSFER_PORT;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "gobyte";
const APP_NAME: &str = "gobyte";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// UDP port for presence broadcasts.
    pub broadcast_port: u16,
    /// TCP port the transfer listener binds and advertises.
    pub transfer_port: u16,
    /// Directory holding the local identity certificate and key.
    pub cert_dir: PathBuf,
    /// Directory holding pinned peer fingerprints.
    pub trust_dir: PathBuf,
    /// Directory incoming files are written under.
    pub download_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        let base = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gobyte");

        Self {
            broadcast_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            cert_dir: base.join("cert"),
            trust_dir: base.join("trust"),
            download_dir: base.join("files"),
        }
    }
}

impl AppConfig {
    fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load the persisted config, falling back to defaults when missing or
    /// unreadable.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Persist the config, creating parent directories as needed.
    pub fn save(&self) -> std::io::Result<()> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }
}
