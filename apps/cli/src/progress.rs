//! Progress bar utilities for CLI downloads

use anyhow::Result;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ipafetch_core::Ipafetch;
use ipafetch_types::{CoreEvent, ManifestKey, ManifestStatus, PackageManifest};
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;

/// Manages progress bars for multiple downloads
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<ManifestKey, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a manifest
    pub fn add_manifest(&mut self, manifest: &PackageManifest) -> Result<ProgressBar> {
        let pb = self
            .multi
            .add(ProgressBar::new(manifest.total_bytes.unwrap_or(0)));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:30!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
                .progress_chars("█▓▒░  "),
        );
        pb.set_message(manifest.name.clone());
        pb.set_position(manifest.bytes_received);

        self.bars.insert(manifest.key.clone(), pb.clone());
        Ok(pb)
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::ManifestProgress {
                key,
                bytes_received,
                total_bytes,
                ..
            } => {
                if let Some(pb) = self.bars.get(key) {
                    if let Some(total) = total_bytes {
                        pb.set_length(*total);
                    }
                    pb.set_position(*bytes_received);
                }
            }

            CoreEvent::ManifestStatusChanged { key, status, error } => {
                if let Some(pb) = self.bars.get(key) {
                    match status {
                        ManifestStatus::Completed => {
                            pb.finish_with_message(format!(
                                "{} Download complete",
                                style("✓").green().bold()
                            ));
                        }
                        ManifestStatus::Failed => {
                            pb.abandon_with_message(format!(
                                "{} Failed: {}",
                                style("✗").red().bold(),
                                error.as_deref().unwrap_or("Unknown error")
                            ));
                        }
                        ManifestStatus::Paused => {
                            pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
                        }
                        ManifestStatus::Pending | ManifestStatus::Downloading => {}
                    }
                }
            }

            CoreEvent::ManifestRemoved { key } => {
                if let Some(pb) = self.bars.get(key) {
                    pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            pb.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Show progress for `keys` until none of them is pending or downloading.
///
/// Ctrl-C pauses every running download before returning.
pub async fn follow(core: &Ipafetch, keys: &[ManifestKey]) -> Result<()> {
    let mut events = core.subscribe();
    let mut progress = DownloadProgress::new();
    for key in keys {
        if let Ok(manifest) = core.get_manifest(key).await {
            progress.add_manifest(&manifest)?;
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if settled(core, keys).await {
            break;
        }
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => progress.handle_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                progress.clear();
                eprintln!("{} Pausing downloads...", style("⏸").yellow());
                core.pause_all().await?;
                break;
            }
        }
    }
    Ok(())
}

async fn settled(core: &Ipafetch, keys: &[ManifestKey]) -> bool {
    for key in keys {
        if let Ok(manifest) = core.get_manifest(key).await {
            if matches!(
                manifest.status,
                ManifestStatus::Pending | ManifestStatus::Downloading
            ) {
                return false;
            }
        }
    }
    true
}
