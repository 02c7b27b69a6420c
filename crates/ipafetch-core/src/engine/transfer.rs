//! Transfer backend - resumable byte transfer of one artifact
//!
//! The orchestrator only sees the `TransferBackend` trait: it submits a
//! job and reads progress events until a single terminal `Finished`.
//! `HttpTransferBackend` is the default implementation: one ranged GET
//! streamed straight into a `.part` file.

use crate::error::IpafetchError;
use futures::StreamExt;
use ipafetch_types::Settings;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum spacing between progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// One byte transfer request
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub url: String,
    pub destination: PathBuf,
    /// Bytes already on disk from an earlier attempt
    pub resume_from: Option<u64>,
    pub expected_size: Option<u64>,
}

/// Signals from the orchestrator to a running transfer
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    pub pause: CancellationToken,
    pub cancel: CancellationToken,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Events emitted by a running transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        bytes_received: u64,
        total_bytes: Option<u64>,
        bytes_per_second: u64,
    },
    /// The server ignored the resume offset; counting starts again from zero
    Restarted,
    /// Always the last event of a transfer
    Finished(TransferOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Completed { bytes: u64, expected: Option<u64> },
    Paused { bytes: u64 },
    Cancelled,
    Failed { reason: String, status: Option<u16> },
}

/// Capability to move bytes from a URL into a file
pub trait TransferBackend: Send + Sync + 'static {
    fn begin(&self, job: TransferJob, control: TransferControl) -> mpsc::Receiver<TransferEvent>;
}

/// Default backend: resumable HTTP range download
#[derive(Debug, Clone)]
pub struct HttpTransferBackend {
    client: Client,
}

impl HttpTransferBackend {
    pub fn new(settings: &Settings) -> Result<Self, IpafetchError> {
        // No overall timeout: artifacts are large and streams long-lived
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

impl TransferBackend for HttpTransferBackend {
    fn begin(&self, job: TransferJob, control: TransferControl) -> mpsc::Receiver<TransferEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();

        tokio::spawn(async move {
            let outcome = match run_transfer(&client, &job, &control, &tx).await {
                Ok(outcome) => outcome,
                Err(e) => TransferOutcome::Failed {
                    reason: e.to_string(),
                    status: None,
                },
            };
            let _ = tx.send(TransferEvent::Finished(outcome)).await;
        });

        rx
    }
}

async fn run_transfer(
    client: &Client,
    job: &TransferJob,
    control: &TransferControl,
    tx: &mpsc::Sender<TransferEvent>,
) -> Result<TransferOutcome, IpafetchError> {
    if let Some(parent) = job.destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // The file on disk is authoritative; the resume hint only has to agree
    let existing = match tokio::fs::metadata(&job.destination).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if let Some(hint) = job.resume_from {
        if hint != existing {
            debug!("Resume hint {} differs from {} bytes on disk", hint, existing);
        }
    }

    if let Some(expected) = job.expected_size {
        if existing > 0 && existing == expected {
            info!("Transfer of {:?} already complete on disk", job.destination);
            return Ok(TransferOutcome::Completed {
                bytes: existing,
                expected: Some(expected),
            });
        }
    }

    let mut request = client.get(&job.url);
    if existing > 0 {
        info!("Resuming {:?} from byte {}", job.destination, existing);
        request = request.header(RANGE, format!("bytes={}-", existing));
    }

    let response = tokio::select! {
        _ = control.cancel.cancelled() => return Ok(TransferOutcome::Cancelled),
        _ = control.pause.cancelled() => return Ok(TransferOutcome::Paused { bytes: existing }),
        response = request.send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        warn!("Transfer of {} answered HTTP {}", job.url, status);
        return Ok(TransferOutcome::Failed {
            reason: format!("Server returned HTTP {}", status.as_u16()),
            status: Some(status.as_u16()),
        });
    }

    let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
    let mut received = if resumed { existing } else { 0 };
    if existing > 0 && !resumed {
        info!("Server ignored range request for {}, restarting", job.url);
        let _ = tx.send(TransferEvent::Restarted).await;
    }

    let total = total_size(&response, received).or(job.expected_size);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(resumed)
        .truncate(!resumed)
        .open(&job.destination)
        .await?;

    let mut meter = SpeedMeter::new(received);
    let mut last_emit = Instant::now();
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => {
                info!("Transfer of {:?} cancelled", job.destination);
                return Ok(TransferOutcome::Cancelled);
            }
            _ = control.pause.cancelled() => {
                file.flush().await?;
                info!("Transfer of {:?} paused at {} bytes", job.destination, received);
                return Ok(TransferOutcome::Paused { bytes: received });
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;

        if last_emit.elapsed() >= PROGRESS_INTERVAL {
            let _ = tx
                .send(TransferEvent::Progress {
                    bytes_received: received,
                    total_bytes: total,
                    bytes_per_second: meter.sample(received),
                })
                .await;
            last_emit = Instant::now();
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    let _ = tx
        .send(TransferEvent::Progress {
            bytes_received: received,
            total_bytes: total,
            bytes_per_second: meter.sample(received),
        })
        .await;

    Ok(TransferOutcome::Completed {
        bytes: received,
        expected: total,
    })
}

/// Full artifact size from `Content-Range` (206) or `Content-Length` plus offset
fn total_size(response: &reqwest::Response, offset: u64) -> Option<u64> {
    let header = |name: HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
    };

    if let Some(total) = header(CONTENT_RANGE)
        .and_then(|range| range.rsplit('/').next())
        .and_then(|total| total.parse::<u64>().ok())
    {
        return Some(total);
    }

    header(CONTENT_LENGTH)
        .and_then(|len| len.parse::<u64>().ok())
        .map(|len| len + offset)
}

/// Windowed average smoothed with an exponential moving average
struct SpeedMeter {
    samples: Vec<f64>,
    smoothed: f64,
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedMeter {
    const ALPHA: f64 = 0.15;
    const WINDOW: usize = 10;

    fn new(start_bytes: u64) -> Self {
        Self {
            samples: Vec::with_capacity(Self::WINDOW),
            smoothed: 0.0,
            last_bytes: start_bytes,
            last_time: Instant::now(),
        }
    }

    fn sample(&mut self, bytes: u64) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        let instant = if elapsed > 0.0 {
            bytes.saturating_sub(self.last_bytes) as f64 / elapsed
        } else {
            0.0
        };

        self.samples.push(instant);
        if self.samples.len() > Self::WINDOW {
            self.samples.remove(0);
        }
        let window_avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;

        self.smoothed = if self.smoothed == 0.0 {
            window_avg
        } else {
            Self::ALPHA * window_avg + (1.0 - Self::ALPHA) * self.smoothed
        };
        self.last_bytes = bytes;
        self.last_time = now;
        self.smoothed as u64
    }
}
