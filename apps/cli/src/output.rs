//! Output formatting utilities

use console::{style, StyledObject};
use ipafetch_types::{ManifestStatus, PackageManifest};
use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a green check followed by a message
pub fn success(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn status_icon(status: ManifestStatus) -> StyledObject<&'static str> {
    match status {
        ManifestStatus::Completed => style("✓").green(),
        ManifestStatus::Downloading => style("↓").cyan(),
        ManifestStatus::Paused => style("⏸").yellow(),
        ManifestStatus::Failed => style("✗").red(),
        ManifestStatus::Pending => style("·").dim(),
    }
}

/// Version column: `short (build)`
pub fn format_version(manifest: &PackageManifest) -> String {
    if manifest.short_version == manifest.build_version {
        manifest.short_version.clone()
    } else {
        format!("{} ({})", manifest.short_version, manifest.build_version)
    }
}

/// Size column: `received / total`
pub fn format_size(manifest: &PackageManifest) -> String {
    match manifest.total_bytes {
        Some(total) => format!(
            "{} / {}",
            format_bytes(manifest.bytes_received),
            format_bytes(total)
        ),
        None => format_bytes(manifest.bytes_received),
    }
}
