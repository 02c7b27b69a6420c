//! Response side of the storefront acquisition exchange
//!
//! The property-list body is parsed into a free-form `plist::Value` tree
//! and then classified into `StorefrontResponse`, so every caller has to
//! handle each outcome explicitly.

use crate::error::{AcquisitionError, IncompleteReason, LicenseFailureKind};
use chrono::Utc;
use ipafetch_types::{LicenseVoucher, PackageMetadata, TransferDescriptor};
use plist::{Dictionary, Value};
use std::io::Cursor;
use tracing::debug;

/// Classified outcome of one storefront exchange
#[derive(Debug, Clone, PartialEq)]
pub enum StorefrontResponse {
    Success(TransferDescriptor),
    LicenseError {
        code: String,
        message: String,
        kind: LicenseFailureKind,
    },
    Empty,
    Incomplete(IncompleteReason),
    Malformed(String),
    Transport {
        status: u16,
    },
}

impl StorefrontResponse {
    /// Classify a raw HTTP status and body.
    ///
    /// `requested_item` is used as the fallback bundle id and display name
    /// when the metadata block does not carry them.
    pub fn classify(status: u16, body: &[u8], requested_item: &str) -> Self {
        if !(200..300).contains(&status) {
            return StorefrontResponse::Transport { status };
        }

        let root = match Value::from_reader(Cursor::new(body)) {
            Ok(value) => value,
            Err(e) => return StorefrontResponse::Malformed(e.to_string()),
        };
        let Some(dict) = root.as_dictionary() else {
            return StorefrontResponse::Malformed("top level is not a dictionary".to_string());
        };

        if let Some(failure) = dict.get("failureType") {
            return license_error(failure, dict);
        }

        let Some(item) = dict
            .get("songList")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
        else {
            return StorefrontResponse::Empty;
        };
        let Some(item) = item.as_dictionary() else {
            return StorefrontResponse::Malformed("songList entry is not a dictionary".to_string());
        };

        match parse_item(item, requested_item) {
            Ok(descriptor) => StorefrontResponse::Success(descriptor),
            Err(reason) => StorefrontResponse::Incomplete(reason),
        }
    }

    pub fn into_result(self) -> Result<TransferDescriptor, AcquisitionError> {
        match self {
            StorefrontResponse::Success(descriptor) => Ok(descriptor),
            StorefrontResponse::LicenseError {
                code,
                message,
                kind,
            } => Err(AcquisitionError::License {
                code,
                message,
                kind,
            }),
            StorefrontResponse::Empty => Err(AcquisitionError::EmptyResult),
            StorefrontResponse::Incomplete(reason) => {
                Err(AcquisitionError::IncompleteResponse(reason))
            }
            StorefrontResponse::Malformed(detail) => {
                Err(AcquisitionError::MalformedResponse(detail))
            }
            StorefrontResponse::Transport { status } => Err(AcquisitionError::Transport { status }),
        }
    }
}

fn license_error(failure: &Value, dict: &Dictionary) -> StorefrontResponse {
    let code = match failure {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i
            .as_signed()
            .map(|v| v.to_string())
            .or_else(|| i.as_unsigned().map(|v| v.to_string()))
            .unwrap_or_default(),
        _ => String::new(),
    };
    let kind = LicenseFailureKind::from_code(&code);
    let message = match kind {
        LicenseFailureKind::PasswordTokenExpired => {
            "Password token has expired, sign in again".to_string()
        }
        LicenseFailureKind::LicenseRequired => {
            "A license is required, purchase or obtain this app first".to_string()
        }
        LicenseFailureKind::Other => dict
            .get("customerMessage")
            .and_then(Value::as_string)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Download failed: {}", code)),
    };
    StorefrontResponse::LicenseError {
        code,
        message,
        kind,
    }
}

fn parse_item(item: &Dictionary, requested_item: &str) -> Result<TransferDescriptor, IncompleteReason> {
    let transfer_url = item
        .get("URL")
        .and_then(Value::as_string)
        .filter(|s| !s.is_empty())
        .ok_or(IncompleteReason::MissingTransferUrl)?;
    let metadata = item
        .get("metadata")
        .and_then(Value::as_dictionary)
        .ok_or(IncompleteReason::MissingMetadata)?;
    let short_version = metadata
        .get("bundleShortVersionString")
        .and_then(Value::as_string)
        .ok_or(IncompleteReason::MissingShortVersion)?;
    let build_version = metadata
        .get("bundleVersion")
        .and_then(Value::as_string)
        .ok_or(IncompleteReason::MissingBuildVersion)?;
    let metadata = parse_metadata(metadata, requested_item)?;

    let vouchers = parse_vouchers(item);
    if vouchers.is_empty() {
        return Err(IncompleteReason::NoVouchers);
    }

    Ok(TransferDescriptor {
        transfer_url: transfer_url.to_string(),
        vouchers,
        short_version: short_version.to_string(),
        build_version: build_version.to_string(),
        metadata,
        acquired_at: Utc::now(),
    })
}

fn parse_metadata(
    metadata: &Dictionary,
    requested_item: &str,
) -> Result<PackageMetadata, IncompleteReason> {
    let item_id = metadata
        .get("itemId")
        .and_then(integer_value)
        .ok_or(IncompleteReason::MissingItemId)?;
    let text = |key: &str| {
        metadata
            .get(key)
            .and_then(Value::as_string)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(PackageMetadata {
        item_id,
        bundle_id: text("softwareVersionBundleId").unwrap_or_else(|| requested_item.to_string()),
        name: text("itemName")
            .or_else(|| text("bundleDisplayName"))
            .unwrap_or_else(|| requested_item.to_string()),
        artist: text("artistName"),
        seller: text("playlistName"),
        genre: text("genre"),
        release_date: text("releaseDate"),
        artwork_url: text("softwareIcon57x57URL").or_else(|| text("artworkURL")),
        file_size: metadata
            .get("asset-info")
            .and_then(Value::as_dictionary)
            .and_then(|info| info.get("file-size"))
            .and_then(integer_value)
            .and_then(|size| u64::try_from(size).ok()),
        description: text("description"),
    })
}

/// Vouchers in received order; entries without both fields are skipped
fn parse_vouchers(item: &Dictionary) -> Vec<LicenseVoucher> {
    let Some(entries) = item.get("sinfs").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let entry = entry.as_dictionary()?;
            let component_id = entry.get("id").and_then(Value::as_signed_integer);
            let payload = entry.get("sinf").and_then(Value::as_data);
            match (component_id, payload) {
                (Some(component_id), Some(payload)) => Some(LicenseVoucher {
                    component_id,
                    payload: payload.to_vec(),
                }),
                _ => {
                    debug!("Skipping malformed sinf entry {}", index);
                    None
                }
            }
        })
        .collect()
}

/// Integers sometimes arrive as strings
fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => i.as_signed(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
