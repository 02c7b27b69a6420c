//! Shared types for ipafetch
//!
//! This crate contains the data structures shared between the core
//! library and the CLI: accounts, license vouchers, manifests and events.

mod account;

pub use account::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Acquisition Types
// ============================================================================

/// License voucher ("sinf") for one signed component of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseVoucher {
    pub component_id: i64,
    pub payload: Vec<u8>,
}

/// Display metadata returned alongside a transfer URL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub item_id: i64,
    pub bundle_id: String,
    pub name: String,
    pub artist: Option<String>,
    pub seller: Option<String>,
    pub genre: Option<String>,
    pub release_date: Option<String>,
    pub artwork_url: Option<String>,
    pub file_size: Option<u64>,
    pub description: Option<String>,
}

/// Everything needed to start a byte transfer for one package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub transfer_url: String,
    pub vouchers: Vec<LicenseVoucher>,
    pub short_version: String,
    pub build_version: String,
    pub metadata: PackageMetadata,
    pub acquired_at: DateTime<Utc>,
}

/// A historical build listed by the version catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    pub version_string: String,
    pub version_id: String,
    pub release_date: String,
    pub release_notes: Option<String>,
}

// ============================================================================
// Manifest Types
// ============================================================================

/// Identity of a manifest: bundle id plus optional external version id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestKey {
    pub bundle_id: String,
    pub external_version_id: Option<String>,
}

impl ManifestKey {
    pub fn new(bundle_id: impl Into<String>, external_version_id: Option<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            external_version_id: external_version_id.filter(|v| !v.trim().is_empty()),
        }
    }

    /// Version component as stored on disk and in the database ('' when absent)
    pub fn version_key(&self) -> &str {
        self.external_version_id.as_deref().unwrap_or("")
    }

    /// Parse the `bundle[@version]` form used on the command line
    pub fn parse(value: &str) -> Self {
        match value.split_once('@') {
            Some((bundle, version)) => Self::new(bundle, Some(version.to_string())),
            None => Self::new(value, None),
        }
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.external_version_id {
            Some(version) => write!(f, "{}@{}", self.bundle_id, version),
            None => f.write_str(&self.bundle_id),
        }
    }
}

/// Status of a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Pending => "pending",
            ManifestStatus::Downloading => "downloading",
            ManifestStatus::Paused => "paused",
            ManifestStatus::Completed => "completed",
            ManifestStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ManifestStatus::Pending),
            "downloading" => Some(ManifestStatus::Downloading),
            "paused" => Some(ManifestStatus::Paused),
            "completed" => Some(ManifestStatus::Completed),
            "failed" => Some(ManifestStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ManifestStatus::Completed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Paused and failed manifests go back through `pending` when re-queued
    /// behind the concurrency cap, or straight to `downloading` when a slot
    /// is free. Nothing leaves `completed`.
    pub fn can_transition_to(&self, next: ManifestStatus) -> bool {
        use ManifestStatus::*;
        if *self == next {
            return !matches!(self, Completed);
        }
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Paused, Pending)
                | (Failed, Downloading)
                | (Failed, Pending)
        )
    }

    /// User actions valid in this state
    pub fn available_actions(&self) -> &'static [ManifestAction] {
        match self {
            ManifestStatus::Pending => &[ManifestAction::Cancel],
            ManifestStatus::Downloading => &[ManifestAction::Pause, ManifestAction::Cancel],
            ManifestStatus::Paused => &[ManifestAction::Resume, ManifestAction::Cancel],
            ManifestStatus::Failed => &[ManifestAction::Retry, ManifestAction::Cancel],
            ManifestStatus::Completed => &[ManifestAction::Install, ManifestAction::Delete],
        }
    }

    pub fn allows(&self, action: ManifestAction) -> bool {
        self.available_actions().contains(&action)
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions a user can take on a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestAction {
    Pause,
    Resume,
    Retry,
    Cancel,
    Install,
    Delete,
}

impl ManifestAction {
    pub fn label(&self) -> &'static str {
        match self {
            ManifestAction::Pause => "Pause",
            ManifestAction::Resume => "Resume",
            ManifestAction::Retry => "Retry",
            ManifestAction::Cancel => "Cancel",
            ManifestAction::Install => "Install",
            ManifestAction::Delete => "Delete",
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, ManifestAction::Cancel | ManifestAction::Delete)
    }
}

impl fmt::Display for ManifestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The persisted record tracking one requested package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManifest {
    pub key: ManifestKey,
    pub item_id: i64,
    pub account_id: Uuid,
    pub name: String,
    pub artist: Option<String>,
    pub artwork_url: Option<String>,
    pub status: ManifestStatus,
    /// Fraction in `[0, 1]`
    pub progress: f64,
    pub rate_label: String,
    pub last_error: Option<String>,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub transfer_url: String,
    pub short_version: String,
    pub build_version: String,
    #[serde(default)]
    pub vouchers: Vec<LicenseVoucher>,
    pub descriptor_acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub descriptor_stale: bool,
    pub artifact_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PackageManifest {
    /// Build a fresh `pending` manifest from an acquisition result
    pub fn new(key: ManifestKey, account_id: Uuid, descriptor: &TransferDescriptor) -> Self {
        Self {
            key,
            item_id: descriptor.metadata.item_id,
            account_id,
            name: descriptor.metadata.name.clone(),
            artist: descriptor.metadata.artist.clone(),
            artwork_url: descriptor.metadata.artwork_url.clone(),
            status: ManifestStatus::Pending,
            progress: 0.0,
            rate_label: String::new(),
            last_error: None,
            bytes_received: 0,
            total_bytes: descriptor.metadata.file_size,
            transfer_url: descriptor.transfer_url.clone(),
            short_version: descriptor.short_version.clone(),
            build_version: descriptor.build_version.clone(),
            vouchers: descriptor.vouchers.clone(),
            descriptor_acquired_at: descriptor.acquired_at,
            descriptor_stale: false,
            artifact_path: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn available_actions(&self) -> &'static [ManifestAction] {
        self.status.available_actions()
    }

    /// One-line status text for list views
    pub fn hint(&self) -> String {
        if let Some(error) = &self.last_error {
            return error.clone();
        }
        match self.status {
            ManifestStatus::Pending => "Pending...".to_string(),
            ManifestStatus::Downloading => {
                let percent = format!("{}%", (self.progress * 100.0) as u32);
                if self.rate_label.is_empty() {
                    percent
                } else {
                    format!("{} {}/s", percent, self.rate_label)
                }
            }
            ManifestStatus::Paused => "Paused".to_string(),
            ManifestStatus::Completed => "Completed".to_string(),
            ManifestStatus::Failed => "Failed".to_string(),
        }
    }
}

/// Render a byte rate for `PackageManifest::rate_label`
pub fn format_rate(bytes_per_second: u64) -> String {
    if bytes_per_second == 0 {
        return String::new();
    }
    human_bytes::human_bytes(bytes_per_second as f64)
}

// ============================================================================
// Settings Types
// ============================================================================

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Where finished artifacts and their vouchers are written
    pub downloads_dir: PathBuf,
    pub max_concurrent_transfers: u32,
    pub storefront_endpoint: String,
    pub user_agent: String,
    /// Device identifier sent as `guid`
    pub device_identifier: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Transfer URLs older than this are re-acquired before a retry
    pub descriptor_ttl_secs: u64,
    pub version_catalog_url: String,
}

pub const DEFAULT_STOREFRONT_ENDPOINT: &str =
    "https://p25-buy.itunes.apple.com/WebObjects/MZFinance.woa/wa/volumeStoreDownloadProduct";

pub const DEFAULT_USER_AGENT: &str =
    "Configurator/2.15 (Macintosh; OS X 11.0.0; 16G29) AppleWebKit/2603.3.8";

pub const DEFAULT_VERSION_CATALOG_URL: &str =
    "https://api.timbrd.com/apple/app-version/index.php";

impl Settings {
    /// Default settings rooted at a data directory
    pub fn with_data_dir(data_dir: &std::path::Path) -> Self {
        Self {
            downloads_dir: data_dir.join("downloads"),
            ..Self::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downloads_dir: dirs::download_dir()
                .map(|p| p.join("ipafetch"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            max_concurrent_transfers: 3,
            storefront_endpoint: DEFAULT_STOREFRONT_ENDPOINT.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            device_identifier: generate_device_identifier(),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            descriptor_ttl_secs: 3600,
            version_catalog_url: DEFAULT_VERSION_CATALOG_URL.to_string(),
        }
    }
}

/// Twelve uppercase hex digits, the shape of a hardware address
pub fn generate_device_identifier() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_uppercase()
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    ManifestAdded {
        manifest: PackageManifest,
    },
    ManifestProgress {
        key: ManifestKey,
        bytes_received: u64,
        total_bytes: Option<u64>,
        progress: f64,
        rate_label: String,
    },
    ManifestStatusChanged {
        key: ManifestKey,
        status: ManifestStatus,
        error: Option<String>,
    },
    ManifestRemoved {
        key: ManifestKey,
    },
    AccountUpdated {
        id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_never_goes_back() {
        for next in [
            ManifestStatus::Pending,
            ManifestStatus::Downloading,
            ManifestStatus::Paused,
            ManifestStatus::Failed,
            ManifestStatus::Completed,
        ] {
            assert!(!ManifestStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_transitions() {
        assert!(ManifestStatus::Pending.can_transition_to(ManifestStatus::Downloading));
        assert!(ManifestStatus::Downloading.can_transition_to(ManifestStatus::Paused));
        assert!(ManifestStatus::Failed.can_transition_to(ManifestStatus::Downloading));
        assert!(!ManifestStatus::Pending.can_transition_to(ManifestStatus::Completed));
        assert!(!ManifestStatus::Paused.can_transition_to(ManifestStatus::Completed));
    }

    #[test]
    fn test_available_actions() {
        assert_eq!(
            ManifestStatus::Downloading.available_actions(),
            &[ManifestAction::Pause, ManifestAction::Cancel]
        );
        assert!(ManifestStatus::Failed.allows(ManifestAction::Retry));
        assert!(!ManifestStatus::Completed.allows(ManifestAction::Resume));
        assert!(!ManifestStatus::Pending.allows(ManifestAction::Pause));
    }

    #[test]
    fn test_manifest_key_parse_and_display() {
        let key = ManifestKey::parse("com.example.app@8123");
        assert_eq!(key.bundle_id, "com.example.app");
        assert_eq!(key.external_version_id.as_deref(), Some("8123"));
        assert_eq!(key.to_string(), "com.example.app@8123");

        let key = ManifestKey::new("com.example.app", Some(String::new()));
        assert_eq!(key.external_version_id, None);
        assert_eq!(key.version_key(), "");
    }

    #[test]
    fn test_device_identifier_shape() {
        let id = generate_device_identifier();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
