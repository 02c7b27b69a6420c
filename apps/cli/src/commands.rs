//! CLI command implementations

use crate::output::{format_bytes, format_size, format_version, print_json, status_icon, success};
use crate::progress;
use crate::{AccountAction, ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use ipafetch_core::Ipafetch;
use ipafetch_types::{Account, ManifestKey, ManifestStatus, PackageManifest};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Account Commands
// ============================================================================

pub async fn account_action(core: &Ipafetch, action: AccountAction, format: OutputFormat) -> Result<()> {
    match action {
        AccountAction::List => {
            let accounts = core.list_accounts();

            match format {
                OutputFormat::Json => {
                    let summaries: Vec<_> = accounts.iter().map(account_summary).collect();
                    print_json(&summaries)?;
                }
                OutputFormat::Table => {
                    use tabled::{Table, Tabled};

                    #[derive(Tabled)]
                    struct AccountRow {
                        #[tabled(rename = "ID")]
                        id: String,
                        #[tabled(rename = "E-mail")]
                        email: String,
                        #[tabled(rename = "Storefront")]
                        store_front: String,
                        #[tabled(rename = "Cookies")]
                        cookies: usize,
                    }

                    let rows: Vec<_> = accounts
                        .iter()
                        .map(|a| AccountRow {
                            id: a.id.to_string(),
                            email: a.email.clone(),
                            store_front: a.store_front.clone(),
                            cookies: a.cookies.len(),
                        })
                        .collect();

                    println!("{}", Table::new(rows));
                }
                OutputFormat::Human => {
                    if accounts.is_empty() {
                        println!("No accounts. Add one with `ipafetch account add`.");
                        return Ok(());
                    }
                    for account in &accounts {
                        println!("{} {}", style("●").cyan(), style(&account.email).bold());
                        println!("    ID: {}", style(account.id).dim());
                        println!("    Storefront: {}", account.store_front);
                    }
                }
            }
        }

        AccountAction::Add {
            email,
            dsid,
            store_front,
        } => {
            let account = core.add_account(email, &dsid, store_front).await?;
            match format {
                OutputFormat::Json => print_json(&account_summary(&account))?,
                _ => {
                    success(format!("Added account {}", style(&account.email).cyan()));
                    println!("  ID: {}", account.id);
                }
            }
        }

        AccountAction::Remove { id } => {
            let id = Uuid::parse_str(&id)?;
            core.remove_account(id).await?;
            success("Account removed");
        }
    }

    Ok(())
}

fn account_summary(account: &Account) -> serde_json::Value {
    serde_json::json!({
        "id": account.id,
        "email": account.email,
        "store_front": account.store_front,
        "cookies": account.cookies.len(),
        "created_at": account.created_at,
    })
}

/// Accept an account id or the exact e-mail it was registered with
fn resolve_account(core: &Ipafetch, value: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(value) {
        return Ok(id);
    }
    core.list_accounts()
        .into_iter()
        .find(|a| a.email == value)
        .map(|a| a.id)
        .ok_or_else(|| anyhow!("No account with id or e-mail {}", value))
}

// ============================================================================
// Version Commands
// ============================================================================

pub async fn list_versions(core: &Ipafetch, item_id: &str, format: OutputFormat) -> Result<()> {
    let versions = core.versions(item_id).await?;

    match format {
        OutputFormat::Json => print_json(&versions)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct VersionRow {
                #[tabled(rename = "Version ID")]
                version_id: String,
                #[tabled(rename = "Version")]
                version: String,
                #[tabled(rename = "Released")]
                released: String,
            }

            let rows: Vec<_> = versions
                .iter()
                .map(|v| VersionRow {
                    version_id: v.version_id.clone(),
                    version: v.version_string.clone(),
                    released: v.release_date.clone(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if versions.is_empty() {
                println!("No versions found for {}", item_id);
                return Ok(());
            }
            for (index, version) in versions.iter().enumerate() {
                let marker = if index == 0 {
                    style("latest").green().to_string()
                } else {
                    String::new()
                };
                println!(
                    "{} {} {} {}",
                    style(&version.version_id).cyan(),
                    style(&version.version_string).bold(),
                    style(&version.release_date).dim(),
                    marker
                );
                if let Some(notes) = &version.release_notes {
                    for line in notes.lines().take(3) {
                        println!("    {}", style(line).dim());
                    }
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn download(
    core: &Ipafetch,
    item_id: &str,
    account: &str,
    version_id: Option<String>,
    detach: bool,
    format: OutputFormat,
) -> Result<()> {
    let account_id = resolve_account(core, account)?;
    let manifest = core.request_download(account_id, item_id, version_id).await?;

    match format {
        OutputFormat::Json => print_json(&manifest)?,
        _ => {
            success(format!(
                "Acquired {} {}",
                style(&manifest.name).cyan(),
                format_version(&manifest)
            ));
            println!("  Key: {}", manifest.key);
        }
    }

    if !detach {
        follow_and_report(core, vec![manifest.key], format).await?;
    }

    Ok(())
}

/// Drive every pending download left from earlier runs
pub async fn run_pending(core: &Ipafetch, format: OutputFormat) -> Result<()> {
    let queued = core.restore().await;
    let keys: Vec<ManifestKey> = core
        .list_manifests()
        .await
        .into_iter()
        .filter(|m| matches!(m.status, ManifestStatus::Pending | ManifestStatus::Downloading))
        .map(|m| m.key)
        .collect();

    if keys.is_empty() {
        println!("Nothing to download");
        return Ok(());
    }

    if !matches!(format, OutputFormat::Json) {
        println!("Running {} queued downloads", queued);
    }
    follow_and_report(core, keys, format).await
}

async fn follow_and_report(core: &Ipafetch, keys: Vec<ManifestKey>, format: OutputFormat) -> Result<()> {
    progress::follow(core, &keys).await?;

    let mut finished = Vec::new();
    for key in &keys {
        if let Ok(manifest) = core.get_manifest(key).await {
            finished.push(manifest);
        }
    }

    match format {
        OutputFormat::Json => print_json(&finished)?,
        _ => {
            for manifest in &finished {
                print_manifest_summary(manifest, false);
            }
        }
    }

    Ok(())
}

pub async fn list_downloads(
    core: &Ipafetch,
    status_filter: Option<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let status_filter = match status_filter {
        Some(value) => Some(
            ManifestStatus::parse(&value.to_lowercase())
                .ok_or_else(|| anyhow!("Unknown status: {}", value))?,
        ),
        None => None,
    };

    let manifests: Vec<_> = core
        .list_manifests()
        .await
        .into_iter()
        .filter(|m| status_filter.map_or(true, |status| m.status == status))
        .collect();

    match format {
        OutputFormat::Json => print_json(&manifests)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ManifestRow {
                #[tabled(rename = "Key")]
                key: String,
                #[tabled(rename = "Name")]
                name: String,
                #[tabled(rename = "Version")]
                version: String,
                #[tabled(rename = "Size")]
                size: String,
                #[tabled(rename = "Status")]
                status: String,
            }

            let rows: Vec<_> = manifests
                .iter()
                .map(|m| ManifestRow {
                    key: m.key.to_string(),
                    name: truncate(&m.name, 30),
                    version: format_version(m),
                    size: format_size(m),
                    status: m.hint(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if manifests.is_empty() {
                println!("No downloads found");
                return Ok(());
            }
            for manifest in &manifests {
                print_manifest_summary(manifest, show_all);
            }
        }
    }

    Ok(())
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let kept: String = value.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn print_manifest_summary(manifest: &PackageManifest, detailed: bool) {
    println!(
        "{} {} {}",
        status_icon(manifest.status),
        style(&manifest.name).bold(),
        style(format_version(manifest)).dim()
    );
    println!("    Key: {}", manifest.key);
    println!("    Status: {}", manifest.hint());

    if detailed {
        println!("    Item ID: {}", manifest.item_id);
        println!("    Account: {}", manifest.account_id);
        if let Some(artist) = &manifest.artist {
            println!("    Artist: {}", artist);
        }
        println!("    Size: {}", format_size(manifest));
        println!("    Vouchers: {}", manifest.vouchers.len());
        if let Some(path) = &manifest.artifact_path {
            println!("    Artifact: {}", path.display());
        }
        println!("    Added: {}", manifest.created_at.format("%Y-%m-%d %H:%M"));
        if let Some(completed) = manifest.completed_at {
            println!("    Completed: {}", completed.format("%Y-%m-%d %H:%M"));
        }
        if manifest.descriptor_stale {
            println!("    {}", style("Transfer URL expired; retry re-acquires it").yellow());
        }
        let actions: Vec<&str> = manifest
            .available_actions()
            .iter()
            .map(|a| a.label())
            .collect();
        println!("    Actions: {}", actions.join(", "));
    }

    if let Some(error) = &manifest.last_error {
        println!("    Error: {}", style(error).red());
    }
    println!();
}

pub async fn show_info(core: &Ipafetch, key: &str, format: OutputFormat) -> Result<()> {
    let key = ManifestKey::parse(key);
    let manifest = core.get_manifest(&key).await?;

    match format {
        OutputFormat::Json => print_json(&manifest)?,
        _ => print_manifest_summary(&manifest, true),
    }

    Ok(())
}

pub async fn resume_download(core: &Ipafetch, key: &str, format: OutputFormat) -> Result<()> {
    let key = ManifestKey::parse(key);
    core.resume(&key).await?;
    if !matches!(format, OutputFormat::Json) {
        success("Download resumed");
    }
    follow_and_report(core, vec![key], format).await
}

pub async fn retry_download(core: &Ipafetch, key: &str, format: OutputFormat) -> Result<()> {
    let key = ManifestKey::parse(key);
    core.retry(&key).await?;
    if !matches!(format, OutputFormat::Json) {
        success("Retrying download");
    }
    follow_and_report(core, vec![key], format).await
}

pub async fn cancel_download(core: &Ipafetch, key: &str, _format: OutputFormat) -> Result<()> {
    let key = ManifestKey::parse(key);
    core.cancel(&key).await?;
    success("Download cancelled");
    Ok(())
}

pub async fn delete_download(core: &Ipafetch, key: &str, _format: OutputFormat) -> Result<()> {
    let key = ManifestKey::parse(key);
    let manifest = core.get_manifest(&key).await?;
    core.delete(&key).await?;
    success(format!("Deleted {}", style(&manifest.name).cyan()));
    Ok(())
}

pub async fn clear_downloads(core: &Ipafetch, yes: bool, _format: OutputFormat) -> Result<()> {
    let manifests = core.list_manifests().await;
    if manifests.is_empty() {
        println!("No downloads found");
        return Ok(());
    }

    if !yes {
        use dialoguer::Confirm;

        let total: u64 = manifests.iter().map(|m| m.bytes_received).sum();
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete {} downloads and {} of files?",
                manifests.len(),
                format_bytes(total)
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    core.remove_all().await?;
    success(format!("Removed {} downloads", manifests.len()));
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    core: &Ipafetch,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.get_settings().await;

            match format {
                OutputFormat::Json => print_json(&settings)?,
                _ => {
                    println!("ipafetch Configuration:");
                    println!();
                    println!("  Downloads directory: {}", settings.downloads_dir.display());
                    println!(
                        "  Max concurrent transfers: {}",
                        settings.max_concurrent_transfers
                    );
                    println!("  Storefront endpoint: {}", settings.storefront_endpoint);
                    println!("  User agent: {}", settings.user_agent);
                    println!("  Device identifier: {}", settings.device_identifier);
                    println!("  Connect timeout: {}s", settings.connect_timeout_secs);
                    println!("  Read timeout: {}s", settings.read_timeout_secs);
                    println!("  Transfer URL lifetime: {}s", settings.descriptor_ttl_secs);
                    println!("  Version catalog: {}", settings.version_catalog_url);
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let settings = core.get_settings().await;
            let value = match key.as_str() {
                "downloads_dir" => settings.downloads_dir.display().to_string(),
                "max_concurrent_transfers" => settings.max_concurrent_transfers.to_string(),
                "storefront_endpoint" => settings.storefront_endpoint,
                "user_agent" => settings.user_agent,
                "device_identifier" => settings.device_identifier,
                "connect_timeout_secs" => settings.connect_timeout_secs.to_string(),
                "read_timeout_secs" => settings.read_timeout_secs.to_string(),
                "descriptor_ttl_secs" => settings.descriptor_ttl_secs.to_string(),
                "version_catalog_url" => settings.version_catalog_url,
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            };
            println!("{}", value);
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = core.get_settings().await;

            match key.as_str() {
                "downloads_dir" => settings.downloads_dir = PathBuf::from(value),
                "max_concurrent_transfers" => {
                    let max: u32 = value.parse()?;
                    if max == 0 {
                        return Err(anyhow!("max_concurrent_transfers must be at least 1"));
                    }
                    settings.max_concurrent_transfers = max;
                }
                "storefront_endpoint" => settings.storefront_endpoint = value,
                "user_agent" => settings.user_agent = value,
                "device_identifier" => settings.device_identifier = value,
                "connect_timeout_secs" => settings.connect_timeout_secs = value.parse()?,
                "read_timeout_secs" => settings.read_timeout_secs = value.parse()?,
                "descriptor_ttl_secs" => settings.descriptor_ttl_secs = value.parse()?,
                "version_catalog_url" => settings.version_catalog_url = value,
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            }

            core.update_settings(settings).await?;
            success("Config updated");
        }

        Some(ConfigAction::Reset) => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset all settings to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                core.reset_settings().await?;
                success("Settings reset to defaults");
            }
        }
    }

    Ok(())
}
