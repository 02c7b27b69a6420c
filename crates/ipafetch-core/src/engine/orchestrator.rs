//! Download orchestrator - coordinates every transfer
//!
//! This is the top-level coordinator that:
//! - Admits pending manifests into a fixed number of transfer slots (FIFO)
//! - Pauses, resumes, retries and cancels transfers
//! - Re-acquires stale transfer URLs before moving bytes
//! - Writes license vouchers next to the artifact when a transfer completes

use crate::accounts::AccountRegistry;
use crate::engine::install::{
    artifact_file_name, require_non_empty, voucher_path, CompletedArtifact, InstallTrust,
};
use crate::engine::transfer::{
    TransferBackend, TransferControl, TransferEvent, TransferJob, TransferOutcome,
};
use crate::error::IpafetchError;
use crate::store::{sanitize, ManifestStore, StatusUpdate};
use crate::storefront::{AcquisitionRequest, StorefrontClient};
use chrono::Utc;
use ipafetch_types::{
    CoreEvent, ManifestAction, ManifestKey, ManifestStatus, PackageManifest, Settings,
    TransferDescriptor,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Transfer URL answers that mean the URL itself is no longer usable
const STALE_URL_STATUSES: [u16; 3] = [403, 404, 410];

/// Orchestrates acquisition, transfer and completion of manifests
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: ManifestStore,
    accounts: AccountRegistry,
    storefront: StorefrontClient,
    backend: Arc<dyn TransferBackend>,
    max_concurrent: usize,
    descriptor_ttl: chrono::Duration,
    slots: Mutex<Slots>,
}

/// Admission bookkeeping: waiting keys and running tasks
#[derive(Default)]
struct Slots {
    queue: VecDeque<ManifestKey>,
    active: HashMap<ManifestKey, TaskHandle>,
}

/// Handle to a running transfer task.
///
/// The handle keeps its slot until the task itself releases it.
struct TaskHandle {
    /// Distinguishes attempts for the same key
    attempt: Uuid,
    control: TransferControl,
    /// Cancelled once the task has released its slot
    done: CancellationToken,
}

impl DownloadOrchestrator {
    pub fn new(
        settings: &Settings,
        store: ManifestStore,
        accounts: AccountRegistry,
        storefront: StorefrontClient,
        backend: Arc<dyn TransferBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                accounts,
                storefront,
                backend,
                max_concurrent: settings.max_concurrent_transfers.max(1) as usize,
                descriptor_ttl: chrono::Duration::seconds(settings.descriptor_ttl_secs as i64),
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    pub fn store(&self) -> &ManifestStore {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.store.subscribe()
    }

    /// Number of transfers currently holding a slot
    pub fn active_count(&self) -> usize {
        self.inner.slots.lock().active.len()
    }

    /// Keys waiting for a slot, in admission order
    pub fn queued(&self) -> Vec<ManifestKey> {
        self.inner.slots.lock().queue.iter().cloned().collect()
    }

    // ========================================================================
    // User Actions
    // ========================================================================

    /// Acquire an item for an account and schedule its transfer.
    ///
    /// Re-requesting an identity that already exists reuses its manifest:
    /// a paused or failed one gets the fresh descriptor and is queued again,
    /// a downloading or completed one is returned untouched.
    pub async fn request_download(
        &self,
        account_id: Uuid,
        item_id: &str,
        external_version_id: Option<String>,
    ) -> Result<PackageManifest, IpafetchError> {
        let account = self.inner.accounts.get(account_id)?;
        let request = AcquisitionRequest::new(item_id, external_version_id)?;

        let acquired = self.inner.storefront.acquire(&account, &request).await;
        self.inner.accounts.persist(&account).await?;
        let descriptor = acquired?;

        let key = ManifestKey::new(
            descriptor.metadata.bundle_id.clone(),
            request.external_version_id.clone(),
        );
        let seed = PackageManifest::new(key.clone(), account_id, &descriptor);
        let (manifest, created) = self.inner.store.upsert(seed).await?;

        if created {
            info!(
                "Queued {}: {} {} ({})",
                key, manifest.name, descriptor.short_version, descriptor.build_version
            );
            self.enqueue(&key);
        } else {
            match manifest.status {
                ManifestStatus::Pending => self.enqueue(&key),
                ManifestStatus::Paused | ManifestStatus::Failed => {
                    info!("Re-queueing existing manifest {} with a fresh descriptor", key);
                    if !same_build(&manifest, &descriptor) {
                        self.discard_partial(&key).await?;
                    }
                    self.inner.store.replace_descriptor(&key, &descriptor).await?;
                    self.inner
                        .store
                        .update_status(&key, StatusUpdate::new(ManifestStatus::Pending))
                        .await?;
                    self.enqueue(&key);
                }
                ManifestStatus::Downloading | ManifestStatus::Completed => {
                    debug!("{} is already {}", key, manifest.status);
                }
            }
        }

        self.pump();
        self.inner.store.require(&key).await
    }

    /// Suspend a running transfer, keeping its partial bytes.
    ///
    /// Returns once the task has stopped and the manifest is `paused`.
    pub async fn pause(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        let manifest = self.inner.store.require(key).await?;
        check_action(&manifest, ManifestAction::Pause)?;

        info!("Pausing download {}", key);
        let done = self.inner.slots.lock().active.get(key).map(|handle| {
            handle.control.pause.cancel();
            handle.done.clone()
        });
        match done {
            Some(done) => done.cancelled().await,
            None => {
                if let Some(current) = self.inner.store.get(key).await {
                    if current.status == ManifestStatus::Downloading {
                        self.inner
                            .store
                            .update_status(
                                key,
                                StatusUpdate::new(ManifestStatus::Paused).rate_label(""),
                            )
                            .await?;
                    }
                }
            }
        }

        self.pump();
        Ok(())
    }

    /// Continue a paused download
    pub async fn resume(&self, key: &ManifestKey) -> Result<PackageManifest, IpafetchError> {
        self.requeue(key, ManifestAction::Resume).await
    }

    /// Try a failed download again
    pub async fn retry(&self, key: &ManifestKey) -> Result<PackageManifest, IpafetchError> {
        self.requeue(key, ManifestAction::Retry).await
    }

    async fn requeue(
        &self,
        key: &ManifestKey,
        action: ManifestAction,
    ) -> Result<PackageManifest, IpafetchError> {
        let manifest = self.inner.store.require(key).await?;
        if manifest.status == ManifestStatus::Completed {
            return Err(IpafetchError::InvalidTransition {
                key: key.clone(),
                from: ManifestStatus::Completed,
                to: ManifestStatus::Downloading,
            });
        }
        check_action(&manifest, action)?;

        info!("{} requested for {}", action, key);
        let manifest = self
            .inner
            .store
            .update_status(key, StatusUpdate::new(ManifestStatus::Pending))
            .await?;
        self.enqueue(key);
        self.pump();
        Ok(manifest)
    }

    /// Stop a pending or running download and forget it.
    ///
    /// Partial bytes are deleted. Cancelling an identity that no longer
    /// exists is a no-op.
    pub async fn cancel(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        let Some(manifest) = self.inner.store.get(key).await else {
            debug!("Nothing to cancel for {}", key);
            return Ok(());
        };
        check_action(&manifest, ManifestAction::Cancel)?;

        info!("Cancelling download {}", key);
        let done = {
            let mut slots = self.inner.slots.lock();
            slots.queue.retain(|queued| queued != key);
            slots.active.get(key).map(|handle| {
                handle.control.cancel.cancel();
                handle.done.clone()
            })
        };
        if let Some(done) = done {
            done.cancelled().await;
        }

        self.inner.store.remove(key).await?;
        self.pump();
        Ok(())
    }

    /// Remove a completed download together with its artifact and vouchers
    pub async fn delete(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        let manifest = self.inner.store.require(key).await?;
        check_action(&manifest, ManifestAction::Delete)?;

        info!("Deleting download {}", key);
        self.inner.store.remove(key).await?;
        Ok(())
    }

    /// Cancel everything and delete every manifest and artifact
    pub async fn remove_all(&self) -> Result<(), IpafetchError> {
        let running: Vec<CancellationToken> = {
            let mut slots = self.inner.slots.lock();
            slots.queue.clear();
            slots
                .active
                .values()
                .map(|handle| {
                    handle.control.cancel.cancel();
                    handle.done.clone()
                })
                .collect()
        };

        info!("Removing all downloads ({} running)", running.len());
        for done in running {
            done.cancelled().await;
        }

        self.inner.store.remove_all().await
    }

    /// Queue every `pending` manifest again after a restart, oldest first.
    ///
    /// Returns how many were queued.
    pub async fn restore(&self) -> usize {
        let mut pending: Vec<PackageManifest> = self
            .inner
            .store
            .list()
            .await
            .into_iter()
            .filter(|m| m.status == ManifestStatus::Pending)
            .collect();
        pending.sort_by_key(|m| m.created_at);

        for manifest in &pending {
            self.enqueue(&manifest.key);
        }
        if !pending.is_empty() {
            info!("Restored {} pending downloads", pending.len());
        }
        self.pump();
        pending.len()
    }

    /// The verified artifact of a completed download
    pub async fn completed_artifact(
        &self,
        key: &ManifestKey,
    ) -> Result<CompletedArtifact, IpafetchError> {
        let manifest = self.inner.store.require(key).await?;
        check_action(&manifest, ManifestAction::Install)?;

        let artifact_path = manifest
            .artifact_path
            .clone()
            .ok_or_else(|| IpafetchError::Integrity(format!("{} has no artifact", key)))?;
        require_non_empty(&artifact_path).await?;

        if manifest.vouchers.is_empty() {
            return Err(IpafetchError::Integrity(format!("{} has no vouchers", key)));
        }
        let dir = self.inner.store.artifact_dir(key);
        let mut voucher_paths = Vec::with_capacity(manifest.vouchers.len());
        for (ordinal, voucher) in manifest.vouchers.iter().enumerate() {
            let path = voucher_path(&dir, ordinal, voucher);
            require_non_empty(&path).await?;
            voucher_paths.push(path);
        }

        Ok(CompletedArtifact {
            key: key.clone(),
            artifact_path,
            voucher_paths,
            vouchers: manifest.vouchers,
        })
    }

    /// Hand a completed download to the install-trust service
    pub async fn install(
        &self,
        key: &ManifestKey,
        trust: &dyn InstallTrust,
    ) -> Result<(), IpafetchError> {
        let artifact = self.completed_artifact(key).await?;
        info!("Installing {} from {:?}", key, artifact.artifact_path);
        trust.install(&artifact)
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn enqueue(&self, key: &ManifestKey) {
        let mut slots = self.inner.slots.lock();
        if slots.active.contains_key(key) || slots.queue.contains(key) {
            return;
        }
        slots.queue.push_back(key.clone());
    }

    /// Admit queued keys while slots are free
    fn pump(&self) {
        let mut slots = self.inner.slots.lock();
        while slots.active.len() < self.inner.max_concurrent {
            let Some(key) = slots.queue.pop_front() else {
                break;
            };

            let attempt = Uuid::new_v4();
            let control = TransferControl::new();
            let done = CancellationToken::new();
            let this = self.clone();
            let task_key = key.clone();
            let task_control = control.clone();
            let task_done = done.clone();
            tokio::spawn(async move {
                // Waiters wake even if the attempt panics
                let _done = task_done.drop_guard();
                this.run_attempt(&task_key, &task_control).await;
                this.release(&task_key, attempt);
            });

            slots.active.insert(
                key,
                TaskHandle {
                    attempt,
                    control,
                    done,
                },
            );
        }
    }

    /// Free the slot held by `attempt` and admit the next key
    fn release(&self, key: &ManifestKey, attempt: Uuid) {
        {
            let mut slots = self.inner.slots.lock();
            if slots.active.get(key).map(|h| h.attempt) == Some(attempt) {
                slots.active.remove(key);
            }
        }
        self.pump();
    }

    // ========================================================================
    // Transfer Attempt
    // ========================================================================

    async fn run_attempt(&self, key: &ManifestKey, control: &TransferControl) {
        let Err(e) = self.try_attempt(key, control).await else {
            return;
        };

        if control.cancel.is_cancelled() {
            debug!("Download {} stopped by cancellation: {}", key, e);
            return;
        }
        // Stop the backend if it is still running
        control.cancel.cancel();

        error!("Download {} failed: {}", key, e);
        if let Some(manifest) = self.inner.store.get(key).await {
            if manifest.status == ManifestStatus::Downloading {
                if let Err(e) = self
                    .inner
                    .store
                    .update_status(key, StatusUpdate::failed(e.to_string()))
                    .await
                {
                    warn!("Could not record failure of {}: {}", key, e);
                }
            }
        }
    }

    async fn try_attempt(
        &self,
        key: &ManifestKey,
        control: &TransferControl,
    ) -> Result<(), IpafetchError> {
        if control.cancel.is_cancelled() || self.inner.store.get(key).await.is_none() {
            return Ok(());
        }

        let manifest = self
            .inner
            .store
            .update_status(
                key,
                StatusUpdate::new(ManifestStatus::Downloading).rate_label(""),
            )
            .await?;
        info!(
            "Starting download {}: {} {} ({})",
            key, manifest.name, manifest.short_version, manifest.build_version
        );

        let manifest = if self.needs_acquisition(&manifest) {
            match self.reacquire(&manifest, control).await? {
                Some(manifest) => manifest,
                None => return Ok(()),
            }
        } else {
            manifest
        };

        let part_path = self.part_path(key);
        let resume_from = tokio::fs::metadata(&part_path)
            .await
            .ok()
            .map(|meta| meta.len())
            .filter(|len| *len > 0);
        if resume_from.is_none() {
            self.inner.store.reset_progress(key).await?;
        }

        let job = TransferJob {
            url: manifest.transfer_url.clone(),
            destination: part_path.clone(),
            resume_from,
            expected_size: manifest.total_bytes,
        };
        let mut events = self.inner.backend.begin(job, control.clone());

        let mut restarted = false;
        let outcome = loop {
            match events.recv().await {
                Some(TransferEvent::Progress {
                    bytes_received,
                    total_bytes,
                    bytes_per_second,
                }) => {
                    self.inner
                        .store
                        .update_progress(key, bytes_received, total_bytes, bytes_per_second, restarted)
                        .await?;
                    restarted = false;
                }
                Some(TransferEvent::Restarted) => {
                    warn!("Download {} restarted from zero", key);
                    restarted = true;
                }
                Some(TransferEvent::Finished(outcome)) => break outcome,
                None => {
                    break TransferOutcome::Failed {
                        reason: "transfer ended without a result".to_string(),
                        status: None,
                    }
                }
            }
        };

        match outcome {
            TransferOutcome::Completed { bytes, expected } => {
                self.finalize(&manifest, &part_path, bytes, expected).await
            }
            TransferOutcome::Paused { bytes } => {
                info!("Download {} paused at {} bytes", key, bytes);
                self.inner
                    .store
                    .update_status(key, StatusUpdate::new(ManifestStatus::Paused).rate_label(""))
                    .await?;
                Ok(())
            }
            TransferOutcome::Cancelled => {
                debug!("Download {} cancelled", key);
                Ok(())
            }
            TransferOutcome::Failed { reason, status } => {
                if status.is_some_and(|s| STALE_URL_STATUSES.contains(&s)) {
                    self.inner.store.mark_stale(key).await?;
                }
                Err(IpafetchError::Transfer { reason, status })
            }
        }
    }

    fn needs_acquisition(&self, manifest: &PackageManifest) -> bool {
        manifest.descriptor_stale
            || Utc::now() - manifest.descriptor_acquired_at > self.inner.descriptor_ttl
    }

    /// Run the storefront exchange again for a manifest whose URL is stale.
    ///
    /// `None` means the attempt was paused or cancelled meanwhile.
    async fn reacquire(
        &self,
        manifest: &PackageManifest,
        control: &TransferControl,
    ) -> Result<Option<PackageManifest>, IpafetchError> {
        let key = &manifest.key;
        info!("Transfer URL of {} is stale, acquiring a new one", key);

        let account = self.inner.accounts.get(manifest.account_id)?;
        let request =
            AcquisitionRequest::new(manifest.item_id.to_string(), key.external_version_id.clone())?;

        let acquired = tokio::select! {
            _ = control.cancel.cancelled() => return Ok(None),
            _ = control.pause.cancelled() => {
                self.inner
                    .store
                    .update_status(key, StatusUpdate::new(ManifestStatus::Paused))
                    .await?;
                return Ok(None);
            }
            acquired = self.inner.storefront.acquire(&account, &request) => acquired,
        };

        if let Err(e) = self.inner.accounts.persist(&account).await {
            warn!("Failed to persist account {}: {}", account.id(), e);
        }

        match acquired {
            Ok(descriptor) => {
                if !same_build(manifest, &descriptor) {
                    self.discard_partial(key).await?;
                }
                Ok(Some(
                    self.inner.store.replace_descriptor(key, &descriptor).await?,
                ))
            }
            Err(e) => {
                self.inner.store.mark_stale(key).await?;
                Err(e.into())
            }
        }
    }

    fn part_path(&self, key: &ManifestKey) -> PathBuf {
        self.inner
            .store
            .artifact_dir(key)
            .join(format!("{}.part", sanitize(&key.bundle_id)))
    }

    /// Drop partial bytes that belong to a different build
    async fn discard_partial(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        match tokio::fs::remove_file(self.part_path(key)).await {
            Ok(()) => info!("Build of {} changed, discarding partial bytes", key),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.store.reset_progress(key).await
    }

    /// Verify the transfer, move the artifact into place, persist vouchers,
    /// then mark the manifest completed
    async fn finalize(
        &self,
        manifest: &PackageManifest,
        part_path: &Path,
        bytes: u64,
        expected: Option<u64>,
    ) -> Result<(), IpafetchError> {
        let key = &manifest.key;

        if manifest.vouchers.is_empty() {
            return Err(IpafetchError::Integrity(format!(
                "{} has no license vouchers to persist",
                key
            )));
        }
        if let Err(e) = verify_size(part_path, bytes, expected.or(manifest.total_bytes)).await {
            if let Err(remove) = tokio::fs::remove_file(part_path).await {
                debug!("Could not remove {:?}: {}", part_path, remove);
            }
            return Err(e);
        }

        let dir = self.inner.store.artifact_dir(key);
        let artifact_path: PathBuf = dir.join(artifact_file_name(
            &key.bundle_id,
            &manifest.short_version,
            &manifest.build_version,
        ));
        tokio::fs::rename(part_path, &artifact_path).await?;

        for (ordinal, voucher) in manifest.vouchers.iter().enumerate() {
            tokio::fs::write(voucher_path(&dir, ordinal, voucher), &voucher.payload).await?;
        }

        self.inner
            .store
            .update_status(
                key,
                StatusUpdate::new(ManifestStatus::Completed)
                    .progress(1.0)
                    .artifact(artifact_path.clone()),
            )
            .await?;

        info!(
            "Download {} completed: {:?} with {} vouchers",
            key,
            artifact_path,
            manifest.vouchers.len()
        );
        Ok(())
    }
}

fn check_action(manifest: &PackageManifest, action: ManifestAction) -> Result<(), IpafetchError> {
    if manifest.status.allows(action) {
        Ok(())
    } else {
        Err(IpafetchError::ActionNotAvailable {
            key: manifest.key.clone(),
            action,
            status: manifest.status,
        })
    }
}

/// Whether a descriptor still points at the bytes a manifest was fetching.
///
/// Signed query strings change on every acquisition, so only the URL path
/// takes part in the comparison.
fn same_build(manifest: &PackageManifest, descriptor: &TransferDescriptor) -> bool {
    manifest.short_version == descriptor.short_version
        && manifest.build_version == descriptor.build_version
        && url_path(&manifest.transfer_url) == url_path(&descriptor.transfer_url)
}

fn url_path(value: &str) -> String {
    Url::parse(value)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// Received bytes must match the expected size and what is on disk
async fn verify_size(path: &Path, bytes: u64, expected: Option<u64>) -> Result<(), IpafetchError> {
    if bytes == 0 {
        return Err(IpafetchError::Integrity("received an empty artifact".to_string()));
    }
    if let Some(expected) = expected {
        if bytes != expected {
            return Err(IpafetchError::Integrity(format!(
                "received {} of {} bytes",
                bytes, expected
            )));
        }
    }
    let on_disk = tokio::fs::metadata(path).await?.len();
    if on_disk != bytes {
        return Err(IpafetchError::Integrity(format!(
            "{} bytes on disk but {} received",
            on_disk, bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.part");
        tokio::fs::write(&path, vec![0u8; 10]).await.unwrap();

        assert!(verify_size(&path, 10, Some(10)).await.is_ok());
        assert!(verify_size(&path, 10, None).await.is_ok());
        assert!(matches!(
            verify_size(&path, 8, Some(10)).await,
            Err(IpafetchError::Integrity(_))
        ));
        assert!(matches!(
            verify_size(&path, 12, None).await,
            Err(IpafetchError::Integrity(_))
        ));
        assert!(verify_size(&path, 0, None).await.is_err());
    }
}
