//! Storage layer for the data directory (settings file and housekeeping)

use crate::error::IpafetchError;
use ipafetch_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for the ipafetch data directory
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, IpafetchError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("manifests.db")
    }

    // ========================================================================
    // Settings (JSON file)
    // ========================================================================

    /// Load settings, writing defaults on first run.
    ///
    /// The device identifier is generated once and then kept stable.
    pub async fn load_settings(&self) -> Result<Settings, IpafetchError> {
        let path = self.data_dir.join(SETTINGS_FILE);

        if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let settings: Settings = serde_json::from_str(&content)?;
            validate(&settings)?;
            return Ok(settings);
        }

        let settings = Settings::with_data_dir(&self.data_dir);
        info!(
            "Creating default settings with device identifier {}",
            settings.device_identifier
        );
        self.save_settings(&settings).await?;
        Ok(settings)
    }

    /// Validate and write settings
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), IpafetchError> {
        validate(settings)?;
        let path = self.data_dir.join(SETTINGS_FILE);
        let temp = self.data_dir.join(format!("{}.tmp", SETTINGS_FILE));
        fs::write(&temp, serde_json::to_string_pretty(settings)?).await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    /// Defaults for this data directory, keeping the current device identifier
    pub async fn reset_settings(&self) -> Result<Settings, IpafetchError> {
        let current = self.load_settings().await?;
        let settings = Settings {
            device_identifier: current.device_identifier,
            ..Settings::with_data_dir(&self.data_dir)
        };
        self.save_settings(&settings).await?;
        Ok(settings)
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Remove every empty directory below the data directory.
    ///
    /// Returns how many directories were removed.
    pub async fn prune_empty_dirs(&self) -> usize {
        let mut removed = 0;
        // Post-order: collect directories first, deepest last, then walk backwards
        let mut dirs = Vec::new();
        let mut pending = vec![self.data_dir.clone()];
        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    pending.push(path.clone());
                    dirs.push(path);
                }
            }
        }

        for dir in dirs.iter().rev() {
            if is_empty_dir(dir).await {
                match fs::remove_dir(dir).await {
                    Ok(()) => {
                        debug!("Pruned empty directory {:?}", dir);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to prune {:?}: {}", dir, e),
                }
            }
        }
        removed
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

fn validate(settings: &Settings) -> Result<(), IpafetchError> {
    if settings.max_concurrent_transfers == 0 {
        return Err(IpafetchError::InvalidConfig(
            "max_concurrent_transfers must be at least 1".to_string(),
        ));
    }
    if settings.device_identifier.trim().is_empty() {
        return Err(IpafetchError::InvalidConfig(
            "device_identifier must not be empty".to_string(),
        ));
    }
    for (name, value) in [
        ("storefront_endpoint", &settings.storefront_endpoint),
        ("version_catalog_url", &settings.version_catalog_url),
    ] {
        url::Url::parse(value)
            .map_err(|e| IpafetchError::InvalidConfig(format!("{}: {}", name, e)))?;
    }
    Ok(())
}
