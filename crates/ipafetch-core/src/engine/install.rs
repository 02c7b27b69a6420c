//! Boundary to the install-trust service

use crate::error::IpafetchError;
use ipafetch_types::{LicenseVoucher, ManifestKey};
use std::path::{Path, PathBuf};

/// A finished artifact with every voucher file verified on disk
#[derive(Debug, Clone)]
pub struct CompletedArtifact {
    pub key: ManifestKey,
    pub artifact_path: PathBuf,
    pub voucher_paths: Vec<PathBuf>,
    pub vouchers: Vec<LicenseVoucher>,
}

/// Consumer of completed artifacts (side-loading onto a device)
pub trait InstallTrust: Send + Sync {
    fn install(&self, artifact: &CompletedArtifact) -> Result<(), IpafetchError>;
}

/// File name of the final artifact
pub fn artifact_file_name(bundle_id: &str, short_version: &str, build_version: &str) -> String {
    format!(
        "{}_{}_{}.ipa",
        crate::store::sanitize(bundle_id),
        crate::store::sanitize(short_version),
        crate::store::sanitize(build_version)
    )
}

/// Where the voucher at `ordinal` is written next to the artifact
pub fn voucher_path(artifact_dir: &Path, ordinal: usize, voucher: &LicenseVoucher) -> PathBuf {
    artifact_dir.join(format!("sinf-{}-{}.bin", ordinal, voucher.component_id))
}

/// Check that a file exists and is not empty
pub(crate) async fn require_non_empty(path: &Path) -> Result<(), IpafetchError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(IpafetchError::Integrity(format!("{:?} is empty", path))),
        Err(_) => Err(IpafetchError::Integrity(format!("{:?} is missing", path))),
    }
}
