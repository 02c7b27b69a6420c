//! ipafetch core - storefront acquisition and download engine
//!
//! This crate turns an account plus an item identifier into a licensed
//! artifact on disk: it talks to the storefront, records every request as a
//! persistent manifest and drives the resumable byte transfers.

mod accounts;
mod engine;
mod error;
mod storage;
mod store;
mod storefront;
mod versions;

pub use accounts::*;
pub use engine::*;
pub use error::*;
pub use storage::*;
pub use store::*;
pub use storefront::*;
pub use versions::*;

use ipafetch_types::{
    Account, AppVersion, CoreEvent, DirectoryServicesId, ManifestKey, PackageManifest, Settings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;
use uuid::Uuid;

/// The main ipafetch core instance
pub struct Ipafetch {
    /// Settings as loaded at startup; saved changes apply on the next start
    settings: Arc<RwLock<Settings>>,
    storage: Storage,
    accounts: AccountRegistry,
    orchestrator: DownloadOrchestrator,
    versions: VersionCatalog,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl Ipafetch {
    /// Open the data directory with the HTTP transfer backend
    pub async fn new(data_dir: PathBuf) -> Result<Self, IpafetchError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        let backend = Arc::new(HttpTransferBackend::new(&settings)?);
        Self::assemble(storage, settings, backend).await
    }

    /// Open the data directory with explicit settings and transfer backend
    pub async fn with_backend(
        data_dir: PathBuf,
        settings: Settings,
        backend: Arc<dyn TransferBackend>,
    ) -> Result<Self, IpafetchError> {
        let storage = Storage::new(data_dir).await?;
        storage.save_settings(&settings).await?;
        Self::assemble(storage, settings, backend).await
    }

    async fn assemble(
        storage: Storage,
        settings: Settings,
        backend: Arc<dyn TransferBackend>,
    ) -> Result<Self, IpafetchError> {
        let pruned = storage.prune_empty_dirs().await;
        if pruned > 0 {
            info!("Pruned {} empty directories", pruned);
        }

        let (event_tx, _) = broadcast::channel(1000);

        let store = ManifestStore::open(
            storage.database_path(),
            settings.downloads_dir.clone(),
            event_tx.clone(),
        )
        .await?;
        let accounts = AccountRegistry::load(storage.data_dir().to_path_buf()).await?;
        let storefront = StorefrontClient::new(&settings)?;
        let versions = VersionCatalog::new(&settings)?;
        let orchestrator =
            DownloadOrchestrator::new(&settings, store, accounts.clone(), storefront, backend);

        Ok(Self {
            settings: Arc::new(RwLock::new(settings)),
            storage,
            accounts,
            orchestrator,
            versions,
            event_tx,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn orchestrator(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Acquire an item and queue its download
    pub async fn request_download(
        &self,
        account_id: Uuid,
        item_id: &str,
        external_version_id: Option<String>,
    ) -> Result<PackageManifest, IpafetchError> {
        let result = self
            .orchestrator
            .request_download(account_id, item_id, external_version_id)
            .await;
        // Cookies changed whatever the outcome
        if !matches!(result, Err(IpafetchError::AccountNotFound(_))) {
            self.emit(CoreEvent::AccountUpdated { id: account_id });
        }
        result
    }

    pub async fn pause(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        self.orchestrator.pause(key).await
    }

    pub async fn resume(&self, key: &ManifestKey) -> Result<PackageManifest, IpafetchError> {
        self.orchestrator.resume(key).await
    }

    pub async fn retry(&self, key: &ManifestKey) -> Result<PackageManifest, IpafetchError> {
        self.orchestrator.retry(key).await
    }

    pub async fn cancel(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        self.orchestrator.cancel(key).await
    }

    pub async fn delete(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        self.orchestrator.delete(key).await
    }

    pub async fn remove_all(&self) -> Result<(), IpafetchError> {
        self.orchestrator.remove_all().await
    }

    /// Pause every running download (used on shutdown)
    pub async fn pause_all(&self) -> Result<(), IpafetchError> {
        for manifest in self.list_manifests().await {
            if manifest.status.allows(ipafetch_types::ManifestAction::Pause) {
                self.orchestrator.pause(&manifest.key).await?;
            }
        }
        Ok(())
    }

    /// Queue pending manifests left over from an earlier run
    pub async fn restore(&self) -> usize {
        self.orchestrator.restore().await
    }

    pub async fn list_manifests(&self) -> Vec<PackageManifest> {
        self.orchestrator.store().list().await
    }

    pub async fn get_manifest(&self, key: &ManifestKey) -> Result<PackageManifest, IpafetchError> {
        self.orchestrator.store().require(key).await
    }

    pub async fn completed_artifact(
        &self,
        key: &ManifestKey,
    ) -> Result<CompletedArtifact, IpafetchError> {
        self.orchestrator.completed_artifact(key).await
    }

    pub async fn install(
        &self,
        key: &ManifestKey,
        trust: &dyn InstallTrust,
    ) -> Result<(), IpafetchError> {
        self.orchestrator.install(key, trust).await
    }

    /// Historical builds of an item, newest first
    pub async fn versions(&self, item_id: &str) -> Result<Vec<AppVersion>, IpafetchError> {
        self.versions.versions(item_id).await
    }

    // ========================================================================
    // Account Operations
    // ========================================================================

    pub async fn add_account(
        &self,
        email: String,
        directory_services_id: &str,
        store_front: String,
    ) -> Result<Account, IpafetchError> {
        let dsid = DirectoryServicesId::new(directory_services_id)
            .map_err(|e| IpafetchError::InvalidConfig(e.to_string()))?;
        let handle = self
            .accounts
            .add(Account::new(email, dsid, store_front))
            .await?;
        info!("Added account {}", handle.id());
        self.emit(CoreEvent::AccountUpdated { id: handle.id() });
        Ok(handle.snapshot())
    }

    pub fn list_accounts(&self) -> Vec<Account> {
        self.accounts.list()
    }

    pub async fn remove_account(&self, id: Uuid) -> Result<(), IpafetchError> {
        self.accounts.remove(id).await?;
        self.emit(CoreEvent::AccountUpdated { id });
        Ok(())
    }

    // ========================================================================
    // Settings Operations
    // ========================================================================

    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Save settings; transfer limits and endpoints apply on the next start
    pub async fn update_settings(&self, settings: Settings) -> Result<(), IpafetchError> {
        self.storage.save_settings(&settings).await?;
        *self.settings.write().await = settings;
        Ok(())
    }

    pub async fn reset_settings(&self) -> Result<Settings, IpafetchError> {
        let settings = self.storage.reset_settings().await?;
        *self.settings.write().await = settings.clone();
        Ok(settings)
    }
}
