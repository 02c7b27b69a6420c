//! Shared fixtures for the orchestrator integration tests

#![allow(dead_code)]

use httpmock::prelude::*;
use httpmock::Mock;
use ipafetch_core::{
    Ipafetch, TransferBackend, TransferControl, TransferEvent, TransferJob, TransferOutcome,
};
use ipafetch_types::{ManifestKey, PackageManifest, Settings};
use parking_lot::Mutex;
use plist::{Dictionary, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

pub const DEVICE_ID: &str = "AABBCCDDEEFF";

// ============================================================================
// Storefront fixtures
// ============================================================================

/// A successful storefront answer with two vouchers and versions 1.2 / 1.2.0
pub fn success_body(bundle_id: &str, item_id: i64, url: &str) -> Vec<u8> {
    build_body(bundle_id, item_id, url, "1.2", "1.2.0")
}

/// A successful storefront answer for a specific build
pub fn build_body(bundle_id: &str, item_id: i64, url: &str, short: &str, build: &str) -> Vec<u8> {
    let mut metadata = Dictionary::new();
    metadata.insert("bundleShortVersionString".into(), Value::String(short.into()));
    metadata.insert("bundleVersion".into(), Value::String(build.into()));
    metadata.insert("itemId".into(), Value::Integer(item_id.into()));
    metadata.insert("softwareVersionBundleId".into(), Value::String(bundle_id.into()));
    metadata.insert("itemName".into(), Value::String(format!("App {}", item_id)));

    let sinfs = (0..2)
        .map(|id| {
            let mut sinf = Dictionary::new();
            sinf.insert("id".into(), Value::Integer((id as i64).into()));
            sinf.insert("sinf".into(), Value::Data(voucher_payload(id)));
            Value::Dictionary(sinf)
        })
        .collect();

    let mut item = Dictionary::new();
    item.insert("URL".into(), Value::String(url.into()));
    item.insert("metadata".into(), Value::Dictionary(metadata));
    item.insert("sinfs".into(), Value::Array(sinfs));

    let mut root = Dictionary::new();
    root.insert("songList".into(), Value::Array(vec![Value::Dictionary(item)]));
    to_xml(root)
}

pub fn failure_body(code: &str) -> Vec<u8> {
    let mut root = Dictionary::new();
    root.insert("failureType".into(), Value::String(code.into()));
    to_xml(root)
}

pub fn voucher_payload(ordinal: usize) -> Vec<u8> {
    format!("voucher-{}", ordinal).into_bytes()
}

fn to_xml(root: Dictionary) -> Vec<u8> {
    let mut out = Vec::new();
    Value::Dictionary(root).to_writer_xml(&mut out).unwrap();
    out
}

/// Storefront mocks for one item.
///
/// Re-acquisition asks for the numeric item id, so every answer is
/// registered for both the requested identifier and that id.
pub struct ItemMocks<'a> {
    mocks: Vec<Mock<'a>>,
}

impl<'a> ItemMocks<'a> {
    fn register(server: &'a MockServer, item: &str, item_id: i64, body: Vec<u8>) -> Self {
        let mut needles = vec![format!("<string>{}</string>", item)];
        let numeric = format!("<string>{}</string>", item_id);
        if !needles.contains(&numeric) {
            needles.push(numeric);
        }

        let mocks = needles
            .iter()
            .map(|needle| {
                server.mock(|when, then| {
                    when.method(POST).path("/buy").body_contains(needle.as_str());
                    then.status(200).body(body.clone());
                })
            })
            .collect();
        Self { mocks }
    }

    pub fn hits(&self) -> usize {
        self.mocks.iter().map(|mock| mock.hits()).sum()
    }

    /// Exactly one acquisition was answered
    pub fn assert(&self) {
        assert_eq!(self.hits(), 1);
    }

    pub fn delete(self) {
        for mut mock in self.mocks {
            mock.delete();
        }
    }
}

/// Answer acquisition requests for `item` with a success body
pub fn mock_item<'a>(server: &'a MockServer, item: &str, bundle_id: &str, item_id: i64) -> ItemMocks<'a> {
    let body = success_body(bundle_id, item_id, &format!("https://cdn/{}.bin", item_id));
    ItemMocks::register(server, item, item_id, body)
}

/// Answer acquisition requests for `item` with one specific build
pub fn mock_build<'a>(
    server: &'a MockServer,
    item: &str,
    bundle_id: &str,
    item_id: i64,
    url: &str,
    short: &str,
    build: &str,
) -> ItemMocks<'a> {
    let body = build_body(bundle_id, item_id, url, short, build);
    ItemMocks::register(server, item, item_id, body)
}

/// Answer acquisition requests for `item` with a storefront failure code
pub fn mock_failure<'a>(server: &'a MockServer, item: &str, item_id: i64, code: &str) -> ItemMocks<'a> {
    ItemMocks::register(server, item, item_id, failure_body(code))
}

pub fn settings(server: &MockServer, root: &Path, max_concurrent: u32) -> Settings {
    Settings {
        downloads_dir: root.join("downloads"),
        max_concurrent_transfers: max_concurrent,
        storefront_endpoint: server.url("/buy"),
        device_identifier: DEVICE_ID.to_string(),
        ..Settings::default()
    }
}

/// Core with one registered account
pub async fn core_with_account(
    server: &MockServer,
    root: &Path,
    max_concurrent: u32,
    backend: &ScriptedBackend,
) -> (Ipafetch, uuid::Uuid) {
    core_with_settings(root, settings(server, root, max_concurrent), backend).await
}

/// Core with explicit settings and one registered account
pub async fn core_with_settings(
    root: &Path,
    settings: Settings,
    backend: &ScriptedBackend,
) -> (Ipafetch, uuid::Uuid) {
    let core = Ipafetch::with_backend(root.to_path_buf(), settings, Arc::new(backend.clone()))
        .await
        .unwrap();
    let account = core
        .add_account(
            "someone@example.com".to_string(),
            "8675309",
            "143441-1,29".to_string(),
        )
        .await
        .unwrap();
    (core, account.id)
}

// ============================================================================
// Waiting
// ============================================================================

const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Poll a manifest until `check` holds
pub async fn wait_for_manifest(
    core: &Ipafetch,
    key: &ManifestKey,
    what: &str,
    check: impl Fn(&PackageManifest) -> bool,
) -> PackageManifest {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if let Ok(manifest) = core.get_manifest(key).await {
            if check(&manifest) {
                return manifest;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {} on {}", what, key);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll a synchronous condition
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Scripted transfer backend
// ============================================================================

/// Transfer backend that writes `total` filler bytes in `step` sized chunks.
///
/// A hold point makes transfers wait once they reach that many bytes until
/// released, paused or cancelled. Stopping on pause or cancel can be slowed
/// down, and a transfer can be told to end short of its size.
#[derive(Clone)]
pub struct ScriptedBackend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    total: u64,
    step: u64,
    hold: watch::Sender<Option<u64>>,
    state: Mutex<BackendState>,
}

#[derive(Default)]
struct BackendState {
    jobs: Vec<TransferJob>,
    running: usize,
    max_running: usize,
    stopping: usize,
    fail_next: Option<u16>,
    short_by: u64,
    stop_delay: Duration,
}

impl ScriptedBackend {
    pub fn new(total: u64, step: u64) -> Self {
        let (hold, _) = watch::channel(None);
        Self {
            inner: Arc::new(BackendInner {
                total,
                step,
                hold,
                state: Mutex::new(BackendState::default()),
            }),
        }
    }

    pub fn hold_at(&self, bytes: u64) {
        self.inner.hold.send_replace(Some(bytes));
    }

    pub fn release(&self) {
        self.inner.hold.send_replace(None);
    }

    /// Fail the next transfer with this HTTP status
    pub fn fail_next(&self, status: u16) {
        self.inner.state.lock().fail_next = Some(status);
    }

    /// End transfers `bytes` early while still reporting completion
    pub fn short_by(&self, bytes: u64) {
        self.inner.state.lock().short_by = bytes;
    }

    /// Take this long to stop after a pause or cancel
    pub fn stop_delay(&self, delay: Duration) {
        self.inner.state.lock().stop_delay = delay;
    }

    /// Transfers that have started stopping after a pause or cancel
    pub fn stopping(&self) -> usize {
        self.inner.state.lock().stopping
    }

    pub fn jobs(&self) -> Vec<TransferJob> {
        self.inner.state.lock().jobs.clone()
    }

    pub fn max_running(&self) -> usize {
        self.inner.state.lock().max_running
    }
}

impl TransferBackend for ScriptedBackend {
    fn begin(&self, job: TransferJob, control: TransferControl) -> mpsc::Receiver<TransferEvent> {
        let (tx, rx) = mpsc::channel(64);
        let inner = self.inner.clone();
        let fail = {
            let mut state = inner.state.lock();
            state.jobs.push(job.clone());
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            state.fail_next.take()
        };

        tokio::spawn(async move {
            let outcome = match fail {
                Some(status) => TransferOutcome::Failed {
                    reason: format!("HTTP {}", status),
                    status: Some(status),
                },
                None => inner.transfer(&job, &control, &tx).await,
            };
            inner.state.lock().running -= 1;
            let _ = tx.send(TransferEvent::Finished(outcome)).await;
        });

        rx
    }
}

impl BackendInner {
    async fn transfer(
        &self,
        job: &TransferJob,
        control: &TransferControl,
        tx: &mpsc::Sender<TransferEvent>,
    ) -> TransferOutcome {
        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        let mut received = tokio::fs::metadata(&job.destination)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&job.destination)
            .await
            .unwrap();
        let mut hold = self.hold.subscribe();
        let end = self.total.saturating_sub(self.state.lock().short_by);

        while received < end {
            if control.cancel.is_cancelled() {
                return self.stop(TransferOutcome::Cancelled).await;
            }
            if control.pause.is_cancelled() {
                return self.stop(TransferOutcome::Paused { bytes: received }).await;
            }

            let held = hold.borrow_and_update().is_some_and(|at| received >= at);
            if held {
                tokio::select! {
                    _ = control.cancel.cancelled() => {
                        return self.stop(TransferOutcome::Cancelled).await;
                    }
                    _ = control.pause.cancelled() => {
                        return self.stop(TransferOutcome::Paused { bytes: received }).await;
                    }
                    _ = hold.changed() => continue,
                }
            }

            let chunk = self.step.min(end - received);
            file.write_all(&vec![b'x'; chunk as usize]).await.unwrap();
            file.flush().await.unwrap();
            received += chunk;

            let _ = tx
                .send(TransferEvent::Progress {
                    bytes_received: received,
                    total_bytes: Some(self.total),
                    bytes_per_second: 1024,
                })
                .await;
            tokio::task::yield_now().await;
        }

        TransferOutcome::Completed {
            bytes: received,
            expected: Some(self.total),
        }
    }

    async fn stop(&self, outcome: TransferOutcome) -> TransferOutcome {
        let delay = {
            let mut state = self.state.lock();
            state.stopping += 1;
            state.stop_delay
        };
        tokio::time::sleep(delay).await;
        outcome
    }
}
