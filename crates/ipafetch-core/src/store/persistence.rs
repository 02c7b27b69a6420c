//! SQLite-based persistence layer for manifests
//!
//! Stores manifests and their license vouchers in a relational database
//! for atomic, transactional updates.

use crate::error::IpafetchError;
use chrono::{DateTime, Utc};
use ipafetch_types::{LicenseVoucher, ManifestKey, ManifestStatus, PackageManifest};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Database connection pool for manifest persistence
#[derive(Clone, Debug)]
pub struct ManifestDatabase {
    pool: SqlitePool,
}

impl ManifestDatabase {
    /// Open (and create if needed) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, IpafetchError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS manifests (
                bundle_id TEXT NOT NULL,
                version_key TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                artist TEXT,
                artwork_url TEXT,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                rate_label TEXT NOT NULL DEFAULT '',
                error TEXT,
                bytes_received INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER,
                transfer_url TEXT NOT NULL,
                short_version TEXT NOT NULL,
                build_version TEXT NOT NULL,
                descriptor_acquired_at TEXT NOT NULL,
                descriptor_stale INTEGER NOT NULL DEFAULT 0,
                artifact_path TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                PRIMARY KEY (bundle_id, version_key)
            );

            CREATE TABLE IF NOT EXISTS vouchers (
                bundle_id TEXT NOT NULL,
                version_key TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                component_id INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (bundle_id, version_key, ordinal)
            );

            CREATE INDEX IF NOT EXISTS idx_manifests_status ON manifests(status);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Save or update a manifest row; vouchers are rewritten when `with_vouchers`
    pub async fn upsert_manifest(
        &self,
        manifest: &PackageManifest,
        with_vouchers: bool,
    ) -> Result<(), IpafetchError> {
        let mut tx = self.pool.begin().await?;
        let key = &manifest.key;

        sqlx::query(
            r#"
            INSERT INTO manifests (
                bundle_id, version_key, item_id, account_id, name, artist, artwork_url,
                status, progress, rate_label, error, bytes_received, total_bytes,
                transfer_url, short_version, build_version, descriptor_acquired_at,
                descriptor_stale, artifact_path, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bundle_id, version_key) DO UPDATE SET
                item_id = excluded.item_id,
                account_id = excluded.account_id,
                name = excluded.name,
                artist = excluded.artist,
                artwork_url = excluded.artwork_url,
                status = excluded.status,
                progress = excluded.progress,
                rate_label = excluded.rate_label,
                error = excluded.error,
                bytes_received = excluded.bytes_received,
                total_bytes = excluded.total_bytes,
                transfer_url = excluded.transfer_url,
                short_version = excluded.short_version,
                build_version = excluded.build_version,
                descriptor_acquired_at = excluded.descriptor_acquired_at,
                descriptor_stale = excluded.descriptor_stale,
                artifact_path = excluded.artifact_path,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(&key.bundle_id)
        .bind(key.version_key())
        .bind(manifest.item_id)
        .bind(manifest.account_id.to_string())
        .bind(&manifest.name)
        .bind(manifest.artist.as_ref())
        .bind(manifest.artwork_url.as_ref())
        .bind(manifest.status.as_str())
        .bind(manifest.progress)
        .bind(&manifest.rate_label)
        .bind(manifest.last_error.as_ref())
        .bind(manifest.bytes_received as i64)
        .bind(manifest.total_bytes.map(|s| s as i64))
        .bind(&manifest.transfer_url)
        .bind(&manifest.short_version)
        .bind(&manifest.build_version)
        .bind(manifest.descriptor_acquired_at.to_rfc3339())
        .bind(manifest.descriptor_stale as i64)
        .bind(
            manifest
                .artifact_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(manifest.created_at.to_rfc3339())
        .bind(manifest.completed_at.map(|d| d.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        if with_vouchers {
            sqlx::query("DELETE FROM vouchers WHERE bundle_id = ? AND version_key = ?")
                .bind(&key.bundle_id)
                .bind(key.version_key())
                .execute(&mut *tx)
                .await?;

            for (ordinal, voucher) in manifest.vouchers.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO vouchers (bundle_id, version_key, ordinal, component_id, payload)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&key.bundle_id)
                .bind(key.version_key())
                .bind(ordinal as i64)
                .bind(voucher.component_id)
                .bind(voucher.payload.as_slice())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load all manifests, newest first
    pub async fn load_all_manifests(&self) -> Result<Vec<PackageManifest>, IpafetchError> {
        let manifest_rows = sqlx::query("SELECT * FROM manifests ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let voucher_rows =
            sqlx::query("SELECT * FROM vouchers ORDER BY bundle_id, version_key, ordinal")
                .fetch_all(&self.pool)
                .await?;

        // Group vouchers by manifest
        let mut vouchers_map: HashMap<(String, String), Vec<LicenseVoucher>> = HashMap::new();
        for row in voucher_rows {
            let bundle_id: String = row.get("bundle_id");
            let version_key: String = row.get("version_key");
            vouchers_map
                .entry((bundle_id, version_key))
                .or_default()
                .push(LicenseVoucher {
                    component_id: row.get("component_id"),
                    payload: row.get("payload"),
                });
        }

        let mut manifests = Vec::with_capacity(manifest_rows.len());
        for row in manifest_rows {
            let bundle_id: String = row.get("bundle_id");
            let version_key: String = row.get("version_key");
            let vouchers = vouchers_map
                .remove(&(bundle_id, version_key))
                .unwrap_or_default();
            manifests.push(row_to_manifest(row, vouchers)?);
        }

        Ok(manifests)
    }

    /// Delete a manifest and its vouchers
    pub async fn delete_manifest(&self, key: &ManifestKey) -> Result<(), IpafetchError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM vouchers WHERE bundle_id = ? AND version_key = ?")
            .bind(&key.bundle_id)
            .bind(key.version_key())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM manifests WHERE bundle_id = ? AND version_key = ?")
            .bind(&key.bundle_id)
            .bind(key.version_key())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), IpafetchError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vouchers").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM manifests").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Convert a database row to a PackageManifest
fn row_to_manifest(
    row: SqliteRow,
    vouchers: Vec<LicenseVoucher>,
) -> Result<PackageManifest, IpafetchError> {
    let status_str: String = row.get("status");
    let status = ManifestStatus::parse(&status_str).unwrap_or(ManifestStatus::Pending);
    let version_key: String = row.get("version_key");

    Ok(PackageManifest {
        key: ManifestKey::new(row.get::<String, _>("bundle_id"), Some(version_key)),
        item_id: row.get("item_id"),
        account_id: Uuid::parse_str(row.get::<String, _>("account_id").as_str())
            .map_err(|e| IpafetchError::Serialization(e.to_string()))?,
        name: row.get("name"),
        artist: row.get("artist"),
        artwork_url: row.get("artwork_url"),
        status,
        progress: row.get("progress"),
        rate_label: row.get("rate_label"),
        last_error: row.get("error"),
        bytes_received: row.get::<i64, _>("bytes_received") as u64,
        total_bytes: row.get::<Option<i64>, _>("total_bytes").map(|s| s as u64),
        transfer_url: row.get("transfer_url"),
        short_version: row.get("short_version"),
        build_version: row.get("build_version"),
        vouchers,
        descriptor_acquired_at: parse_timestamp(row.get("descriptor_acquired_at"))?,
        descriptor_stale: row.get::<i64, _>("descriptor_stale") != 0,
        artifact_path: row
            .get::<Option<String>, _>("artifact_path")
            .map(PathBuf::from),
        created_at: parse_timestamp(row.get("created_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, IpafetchError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IpafetchError::Serialization(e.to_string()))
}
