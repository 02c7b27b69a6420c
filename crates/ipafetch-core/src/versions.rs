//! Version catalog - lists historical builds of an item
//!
//! The catalog answers `GET <url>?id=<item>` with a JSON array. Entries come
//! back newest first so the first entry's id selects the latest build.

use crate::error::IpafetchError;
use chrono::NaiveDateTime;
use ipafetch_types::{AppVersion, Settings};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    bundle_version: String,
    external_identifier: i64,
    created_at: String,
    #[serde(default)]
    release_notes: Option<String>,
}

/// Client for the version catalog service
#[derive(Debug, Clone)]
pub struct VersionCatalog {
    client: Client,
    endpoint: Url,
}

impl VersionCatalog {
    pub fn new(settings: &Settings) -> Result<Self, IpafetchError> {
        let endpoint = Url::parse(&settings.version_catalog_url).map_err(|e| {
            IpafetchError::InvalidConfig(format!(
                "version catalog {}: {}",
                settings.version_catalog_url, e
            ))
        })?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;

        Ok(Self { client, endpoint })
    }

    /// Every known build of `item_id`, newest first
    pub async fn versions(&self, item_id: &str) -> Result<Vec<AppVersion>, IpafetchError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("id", item_id);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IpafetchError::Transfer {
                reason: format!("version catalog returned HTTP {}", status.as_u16()),
                status: Some(status.as_u16()),
            });
        }

        let mut entries: Vec<CatalogEntry> = response.json().await?;
        entries.sort_by(|a, b| b.external_identifier.cmp(&a.external_identifier));
        info!("Version catalog lists {} builds of {}", entries.len(), item_id);

        Ok(entries
            .into_iter()
            .map(|entry| AppVersion {
                version_string: entry.bundle_version,
                version_id: entry.external_identifier.to_string(),
                release_date: format_release_date(&entry.created_at),
                release_notes: entry.release_notes,
            })
            .collect())
    }
}

/// `yyyy-mm-dd hh:mm:ss` becomes `yyyy-mm-dd`; anything else is kept as is
fn format_release_date(value: &str) -> String {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_format_release_date() {
        assert_eq!(format_release_date("2024-03-05 10:11:12"), "2024-03-05");
        assert_eq!(format_release_date("March 2024"), "March 2024");
    }

    #[tokio::test]
    async fn test_versions_sorted_newest_first() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/versions").query_param("id", "284882215");
            then.status(200).json_body(serde_json::json!([
                {"bundle_version": "1.0", "external_identifier": 100, "created_at": "2020-01-01 00:00:00"},
                {"bundle_version": "1.2", "external_identifier": 300, "created_at": "2022-06-30 08:00:00", "release_notes": "fixes"},
                {"bundle_version": "1.1", "external_identifier": 200, "created_at": "2021-01-01 00:00:00", "release_notes": null}
            ]));
        });

        let settings = Settings {
            version_catalog_url: server.url("/versions"),
            ..Settings::default()
        };
        let catalog = VersionCatalog::new(&settings).unwrap();
        let versions = catalog.versions("284882215").await.unwrap();

        mock.assert();
        let ids: Vec<&str> = versions.iter().map(|v| v.version_id.as_str()).collect();
        assert_eq!(ids, ["300", "200", "100"]);
        assert_eq!(versions[0].version_string, "1.2");
        assert_eq!(versions[0].release_date, "2022-06-30");
        assert_eq!(versions[0].release_notes.as_deref(), Some("fixes"));
    }

    #[tokio::test]
    async fn test_catalog_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/versions");
            then.status(500);
        });

        let settings = Settings {
            version_catalog_url: server.url("/versions"),
            ..Settings::default()
        };
        let catalog = VersionCatalog::new(&settings).unwrap();
        assert!(matches!(
            catalog.versions("1").await,
            Err(IpafetchError::Transfer { status: Some(500), .. })
        ));
    }
}
