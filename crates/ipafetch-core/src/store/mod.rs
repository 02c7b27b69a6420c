//! Manifest store - single source of truth for every requested package
//!
//! All manifest mutations funnel through one async mutex so progress
//! callbacks and user actions never race on read/modify/write. Every
//! change is written to SQLite before the matching event is broadcast.

mod persistence;

pub use persistence::*;

use crate::error::IpafetchError;
use chrono::Utc;
use ipafetch_types::{
    format_rate, CoreEvent, ManifestKey, ManifestStatus, PackageManifest, TransferDescriptor,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

/// A status change plus the fields that travel with it
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: ManifestStatus,
    pub progress: Option<f64>,
    pub rate_label: Option<String>,
    /// Always written; `None` clears a previous error
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
}

impl StatusUpdate {
    pub fn new(status: ManifestStatus) -> Self {
        Self {
            status,
            progress: None,
            rate_label: None,
            error: None,
            artifact_path: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            rate_label: Some(String::new()),
            error: Some(error.into()),
            ..Self::new(ManifestStatus::Failed)
        }
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn rate_label(mut self, rate_label: impl Into<String>) -> Self {
        self.rate_label = Some(rate_label.into());
        self
    }

    pub fn artifact(mut self, path: PathBuf) -> Self {
        self.artifact_path = Some(path);
        self
    }
}

/// Owned, synchronized manifest store
#[derive(Clone)]
pub struct ManifestStore {
    db: ManifestDatabase,
    manifests: Arc<Mutex<HashMap<ManifestKey, PackageManifest>>>,
    downloads_dir: PathBuf,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl ManifestStore {
    /// Open the store, reloading every manifest from disk.
    ///
    /// A manifest that was `downloading` when the process stopped comes
    /// back as `paused`.
    pub async fn open(
        db_path: impl AsRef<Path>,
        downloads_dir: PathBuf,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Result<Self, IpafetchError> {
        let db = ManifestDatabase::new(db_path).await?;
        tokio::fs::create_dir_all(&downloads_dir).await?;

        let mut manifests = HashMap::new();
        for mut manifest in db.load_all_manifests().await? {
            if manifest.status == ManifestStatus::Downloading {
                info!("Restoring interrupted download {} as paused", manifest.key);
                manifest.status = ManifestStatus::Paused;
                manifest.rate_label.clear();
                db.upsert_manifest(&manifest, false).await?;
            }
            manifests.insert(manifest.key.clone(), manifest);
        }

        info!("Loaded {} manifests from database", manifests.len());

        Ok(Self {
            db,
            manifests: Arc::new(Mutex::new(manifests)),
            downloads_dir,
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Directory holding the artifact and vouchers of one manifest.
    ///
    /// Distinct keys always map to distinct directories: `latest` is only
    /// used without a version id, explicit ids live under `v-<id>`.
    pub fn artifact_dir(&self, key: &ManifestKey) -> PathBuf {
        let version = match &key.external_version_id {
            Some(version) => format!("v-{}", encode_component(version)),
            None => "latest".to_string(),
        };
        self.downloads_dir
            .join(encode_component(&key.bundle_id))
            .join(version)
    }

    /// Return the existing manifest for `manifest.key`, or insert `manifest`
    /// as a new `pending` entry. The flag is `true` when a new entry was created.
    pub async fn upsert(
        &self,
        mut manifest: PackageManifest,
    ) -> Result<(PackageManifest, bool), IpafetchError> {
        let mut manifests = self.manifests.lock().await;

        if let Some(existing) = manifests.get(&manifest.key) {
            return Ok((existing.clone(), false));
        }

        manifest.status = ManifestStatus::Pending;
        self.db.upsert_manifest(&manifest, true).await?;
        manifests.insert(manifest.key.clone(), manifest.clone());
        self.emit(CoreEvent::ManifestAdded {
            manifest: manifest.clone(),
        });

        Ok((manifest, true))
    }

    pub async fn get(&self, key: &ManifestKey) -> Option<PackageManifest> {
        self.manifests.lock().await.get(key).cloned()
    }

    pub async fn require(&self, key: &ManifestKey) -> Result<PackageManifest, IpafetchError> {
        self.get(key)
            .await
            .ok_or_else(|| IpafetchError::NotFound(key.clone()))
    }

    /// All manifests, newest first
    pub async fn list(&self) -> Vec<PackageManifest> {
        let mut manifests: Vec<_> = self.manifests.lock().await.values().cloned().collect();
        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        manifests
    }

    /// Apply a validated status transition
    pub async fn update_status(
        &self,
        key: &ManifestKey,
        update: StatusUpdate,
    ) -> Result<PackageManifest, IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        let manifest = manifests
            .get_mut(key)
            .ok_or_else(|| IpafetchError::NotFound(key.clone()))?;

        if !manifest.status.can_transition_to(update.status) {
            return Err(IpafetchError::InvalidTransition {
                key: key.clone(),
                from: manifest.status,
                to: update.status,
            });
        }

        let mut next = manifest.clone();
        next.status = update.status;
        if let Some(progress) = update.progress {
            next.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(rate_label) = update.rate_label {
            next.rate_label = rate_label;
        }
        next.last_error = update.error;
        if let Some(path) = update.artifact_path {
            next.artifact_path = Some(path);
        }
        if update.status == ManifestStatus::Completed {
            next.completed_at = Some(Utc::now());
            next.rate_label.clear();
        }

        self.db.upsert_manifest(&next, false).await?;
        *manifest = next.clone();

        self.emit(CoreEvent::ManifestStatusChanged {
            key: key.clone(),
            status: next.status,
            error: next.last_error.clone(),
        });

        Ok(next)
    }

    /// Record transfer progress for a `downloading` manifest.
    ///
    /// Progress never moves backwards unless `restarted` is set, which the
    /// transfer backend signals when the server refused to resume.
    pub async fn update_progress(
        &self,
        key: &ManifestKey,
        bytes_received: u64,
        total_bytes: Option<u64>,
        bytes_per_second: u64,
        restarted: bool,
    ) -> Result<(), IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        let Some(manifest) = manifests.get_mut(key) else {
            return Err(IpafetchError::NotFound(key.clone()));
        };
        if manifest.status != ManifestStatus::Downloading {
            return Ok(());
        }

        let total = total_bytes.or(manifest.total_bytes);
        let fraction = match total {
            Some(total) if total > 0 => (bytes_received as f64 / total as f64).min(1.0),
            _ => manifest.progress,
        };
        if !restarted && fraction < manifest.progress {
            return Ok(());
        }

        manifest.bytes_received = bytes_received;
        manifest.total_bytes = total;
        manifest.progress = fraction;
        manifest.rate_label = format_rate(bytes_per_second);

        self.emit(CoreEvent::ManifestProgress {
            key: key.clone(),
            bytes_received,
            total_bytes: total,
            progress: fraction,
            rate_label: manifest.rate_label.clone(),
        });
        Ok(())
    }

    /// Forget transfer progress; the next attempt starts from byte zero
    pub async fn reset_progress(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        let Some(manifest) = manifests.get_mut(key) else {
            return Err(IpafetchError::NotFound(key.clone()));
        };
        if manifest.bytes_received == 0 && manifest.progress == 0.0 {
            return Ok(());
        }

        let mut next = manifest.clone();
        next.bytes_received = 0;
        next.progress = 0.0;
        next.rate_label.clear();

        self.db.upsert_manifest(&next, false).await?;
        *manifest = next;

        self.emit(CoreEvent::ManifestProgress {
            key: key.clone(),
            bytes_received: 0,
            total_bytes: manifest.total_bytes,
            progress: 0.0,
            rate_label: String::new(),
        });
        Ok(())
    }

    /// Swap in a freshly acquired descriptor (new URL and vouchers)
    pub async fn replace_descriptor(
        &self,
        key: &ManifestKey,
        descriptor: &TransferDescriptor,
    ) -> Result<PackageManifest, IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        let manifest = manifests
            .get_mut(key)
            .ok_or_else(|| IpafetchError::NotFound(key.clone()))?;

        let mut next = manifest.clone();
        next.transfer_url = descriptor.transfer_url.clone();
        next.vouchers = descriptor.vouchers.clone();
        next.short_version = descriptor.short_version.clone();
        next.build_version = descriptor.build_version.clone();
        next.descriptor_acquired_at = descriptor.acquired_at;
        next.descriptor_stale = false;
        if descriptor.metadata.file_size.is_some() {
            next.total_bytes = descriptor.metadata.file_size;
        }

        self.db.upsert_manifest(&next, true).await?;
        *manifest = next.clone();
        Ok(next)
    }

    /// Flag the stored transfer URL as unusable
    pub async fn mark_stale(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        if let Some(manifest) = manifests.get_mut(key) {
            manifest.descriptor_stale = true;
            self.db.upsert_manifest(manifest, false).await?;
        }
        Ok(())
    }

    /// Delete a manifest and everything written for it. Irreversible.
    pub async fn remove(&self, key: &ManifestKey) -> Result<bool, IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        let existed = manifests.remove(key).is_some();

        self.db.delete_manifest(key).await?;
        remove_dir_if_exists(&self.artifact_dir(key)).await;

        if existed {
            info!("Removed manifest {}", key);
            self.emit(CoreEvent::ManifestRemoved { key: key.clone() });
        }
        Ok(existed)
    }

    /// Delete every manifest and every artifact. Irreversible.
    pub async fn remove_all(&self) -> Result<(), IpafetchError> {
        let mut manifests = self.manifests.lock().await;
        let keys: Vec<ManifestKey> = manifests.keys().cloned().collect();

        self.db.delete_all().await?;
        for key in &keys {
            remove_dir_if_exists(&self.artifact_dir(key)).await;
        }
        manifests.clear();

        for key in keys {
            self.emit(CoreEvent::ManifestRemoved { key });
        }
        Ok(())
    }
}

async fn remove_dir_if_exists(dir: &Path) {
    if dir.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!("Failed to remove {:?}: {}", dir, e);
        }
    }
}

/// Injective path component encoding: unsafe bytes and a leading dot
/// become `%XX`
fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for (index, byte) in component.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && index > 0);
        if keep {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    if encoded.is_empty() {
        encoded.push('%');
    }
    encoded
}

/// Keep file names to a safe character set
pub(crate) fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipafetch_types::{LicenseVoucher, PackageMetadata};
    use uuid::Uuid;

    fn descriptor() -> TransferDescriptor {
        TransferDescriptor {
            transfer_url: "https://cdn/x.bin".to_string(),
            vouchers: vec![
                LicenseVoucher {
                    component_id: 0,
                    payload: b"one".to_vec(),
                },
                LicenseVoucher {
                    component_id: 1,
                    payload: b"two".to_vec(),
                },
            ],
            short_version: "1.2".to_string(),
            build_version: "1.2.0".to_string(),
            metadata: PackageMetadata {
                item_id: 42,
                bundle_id: "com.example.app".to_string(),
                name: "Example".to_string(),
                ..PackageMetadata::default()
            },
            acquired_at: Utc::now(),
        }
    }

    async fn open(dir: &Path) -> ManifestStore {
        let (tx, _) = broadcast::channel(64);
        ManifestStore::open(dir.join("manifests.db"), dir.join("downloads"), tx)
            .await
            .unwrap()
    }

    fn manifest(key: &ManifestKey) -> PackageManifest {
        PackageManifest::new(key.clone(), Uuid::new_v4(), &descriptor())
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let key = ManifestKey::new("com.example.app", None);

        let (first, created) = store.upsert(manifest(&key)).await.unwrap();
        assert!(created);
        store
            .update_status(&key, StatusUpdate::new(ManifestStatus::Downloading))
            .await
            .unwrap();

        let (second, created) = store.upsert(manifest(&key)).await.unwrap();
        assert!(!created);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.status, ManifestStatus::Downloading);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_versions_are_distinct_identities() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;

        store
            .upsert(manifest(&ManifestKey::new("com.example.app", None)))
            .await
            .unwrap();
        store
            .upsert(manifest(&ManifestKey::new("com.example.app", Some("9".to_string()))))
            .await
            .unwrap();

        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let key = ManifestKey::new("com.example.app", None);
        store.upsert(manifest(&key)).await.unwrap();

        let err = store
            .update_status(&key, StatusUpdate::new(ManifestStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, IpafetchError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let key = ManifestKey::new("com.example.app", None);
        store.upsert(manifest(&key)).await.unwrap();
        store
            .update_status(&key, StatusUpdate::new(ManifestStatus::Downloading))
            .await
            .unwrap();

        store.update_progress(&key, 60, Some(100), 10, false).await.unwrap();
        store.update_progress(&key, 30, Some(100), 10, false).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().progress, 0.6);

        store.update_progress(&key, 10, Some(100), 10, true).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().progress, 0.1);
    }

    #[tokio::test]
    async fn test_reset_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let mut events = store.subscribe();
        let key = ManifestKey::new("com.example.app", None);
        store.upsert(manifest(&key)).await.unwrap();
        store
            .update_status(&key, StatusUpdate::new(ManifestStatus::Downloading))
            .await
            .unwrap();
        store.update_progress(&key, 60, Some(100), 10, false).await.unwrap();

        store.reset_progress(&key).await.unwrap();
        let reset = store.get(&key).await.unwrap();
        assert_eq!(reset.bytes_received, 0);
        assert_eq!(reset.progress, 0.0);

        // A fresh transfer's first chunk is accepted after the reset
        store.update_progress(&key, 10, Some(100), 10, false).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().progress, 0.1);

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::ManifestProgress { progress: p, .. } = event {
                progress.push(p);
            }
        }
        assert_eq!(progress, vec![0.6, 0.0, 0.1]);

        assert!(matches!(
            store.reset_progress(&ManifestKey::new("com.example.other", None)).await,
            Err(IpafetchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_turns_downloading_into_paused() {
        let dir = tempfile::tempdir().unwrap();
        let key = ManifestKey::new("com.example.app", Some("77".to_string()));
        {
            let store = open(dir.path()).await;
            store.upsert(manifest(&key)).await.unwrap();
            store
                .update_status(
                    &key,
                    StatusUpdate::new(ManifestStatus::Downloading).progress(0.4),
                )
                .await
                .unwrap();
        }

        let store = open(dir.path()).await;
        let restored = store.get(&key).await.unwrap();
        assert_eq!(restored.status, ManifestStatus::Paused);
        assert_eq!(restored.progress, 0.4);
        assert_eq!(restored.vouchers.len(), 2);
        assert_eq!(restored.vouchers[1].payload, b"two");
    }

    #[tokio::test]
    async fn test_remove_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let key = ManifestKey::new("com.example.app", None);
        store.upsert(manifest(&key)).await.unwrap();

        let artifact_dir = store.artifact_dir(&key);
        tokio::fs::create_dir_all(&artifact_dir).await.unwrap();
        tokio::fs::write(artifact_dir.join("x.ipa"), b"bytes").await.unwrap();

        assert!(store.remove(&key).await.unwrap());
        assert!(!artifact_dir.exists());
        assert!(store.get(&key).await.is_none());
        assert!(!store.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_artifact_dirs_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;

        let keys = [
            ManifestKey::new("com.example.app", None),
            ManifestKey::new("com.example.app", Some("latest".to_string())),
            ManifestKey::new("com.example.app", Some("a/b".to_string())),
            ManifestKey::new("com.example.app", Some("a_b".to_string())),
            ManifestKey::new("com.example.app", Some("a%2Fb".to_string())),
        ];
        let dirs: std::collections::HashSet<PathBuf> =
            keys.iter().map(|key| store.artifact_dir(key)).collect();
        assert_eq!(dirs.len(), keys.len());

        assert!(store
            .artifact_dir(&keys[0])
            .ends_with(Path::new("com.example.app").join("latest")));
        assert!(store
            .artifact_dir(&keys[1])
            .ends_with(Path::new("com.example.app").join("v-latest")));
    }

    #[test]
    fn test_encode_component_stays_inside_parent() {
        assert_eq!(encode_component("com.example.app"), "com.example.app");
        assert_eq!(encode_component(".."), "%2E.");
        assert_eq!(encode_component("a/b"), "a%2Fb");
        assert_eq!(encode_component(""), "%");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("com.example.app"), "com.example.app");
        assert_eq!(sanitize("../etc"), "_etc");
        assert_eq!(sanitize(".."), "_");
    }
}
