//! Account registry - owns every account and its cookie jar
//!
//! Accounts are stored as one JSON file each under `accounts/`.
//! All mutation goes through `AccountHandle`, which serializes cookie
//! merges so concurrent storefront exchanges never lose an update.

use crate::error::IpafetchError;
use ipafetch_types::{Account, StoredCookie};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared, lock-protected reference to one account
#[derive(Debug, Clone)]
pub struct AccountHandle {
    id: Uuid,
    inner: Arc<Mutex<Account>>,
    /// Held across snapshot and rename so the newest jar is written last
    persist_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AccountHandle {
    pub fn new(account: Account) -> Self {
        Self {
            id: account.id,
            inner: Arc::new(Mutex::new(account)),
            persist_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Copy of the account as it is right now
    pub fn snapshot(&self) -> Account {
        self.inner.lock().clone()
    }

    /// Merge response cookies into the jar under the account lock
    pub fn merge_cookies(&self, cookies: Vec<(String, StoredCookie)>) {
        if cookies.is_empty() {
            return;
        }
        let mut account = self.inner.lock();
        debug!("Merging {} cookies into account {}", cookies.len(), account.id);
        account.cookies.merge(cookies);
    }
}

/// Registry of all known accounts
#[derive(Debug, Clone)]
pub struct AccountRegistry {
    dir: PathBuf,
    accounts: Arc<RwLock<HashMap<Uuid, AccountHandle>>>,
}

impl AccountRegistry {
    /// Load every account stored under `<data_dir>/accounts`
    pub async fn load(data_dir: PathBuf) -> Result<Self, IpafetchError> {
        let dir = data_dir.join("accounts");
        fs::create_dir_all(&dir).await?;

        let mut accounts = HashMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = fs::read_to_string(&path).await?;
                match serde_json::from_str::<Account>(&content) {
                    Ok(account) => {
                        accounts.insert(account.id, AccountHandle::new(account));
                    }
                    Err(e) => warn!("Skipping unreadable account file {:?}: {}", path, e),
                }
            }
        }

        info!("Loaded {} accounts", accounts.len());

        Ok(Self {
            dir,
            accounts: Arc::new(RwLock::new(accounts)),
        })
    }

    /// Register and persist a new account
    pub async fn add(&self, account: Account) -> Result<AccountHandle, IpafetchError> {
        let handle = AccountHandle::new(account);
        self.persist(&handle).await?;
        self.accounts.write().insert(handle.id(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, id: Uuid) -> Result<AccountHandle, IpafetchError> {
        self.accounts
            .read()
            .get(&id)
            .cloned()
            .ok_or(IpafetchError::AccountNotFound(id))
    }

    /// Accounts sorted by creation time
    pub fn list(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .values()
            .map(AccountHandle::snapshot)
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        accounts
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), IpafetchError> {
        let removed = self.accounts.write().remove(&id);
        if removed.is_none() {
            return Err(IpafetchError::AccountNotFound(id));
        }
        let path = self.account_path(id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Write the current state of an account to disk
    pub async fn persist(&self, handle: &AccountHandle) -> Result<(), IpafetchError> {
        let _guard = handle.persist_lock.lock().await;
        let account = handle.snapshot();
        let content = serde_json::to_string_pretty(&account)?;
        let path = self.account_path(account.id);
        let temp = self
            .dir
            .join(format!("{}.{}.tmp", account.id, Uuid::new_v4().simple()));
        fs::write(&temp, content).await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    fn account_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipafetch_types::DirectoryServicesId;

    fn account() -> Account {
        Account::new(
            "someone@example.com".to_string(),
            DirectoryServicesId::new("9000").unwrap(),
            "143441-1,29".to_string(),
        )
    }

    #[tokio::test]
    async fn test_accounts_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AccountRegistry::load(dir.path().to_path_buf()).await.unwrap();

        let handle = registry.add(account()).await.unwrap();
        handle.merge_cookies(vec![("itspod".to_string(), StoredCookie::new("25"))]);
        registry.persist(&handle).await.unwrap();

        let reloaded = AccountRegistry::load(dir.path().to_path_buf()).await.unwrap();
        let restored = reloaded.get(handle.id()).unwrap().snapshot();
        assert_eq!(restored.cookies.get("itspod").unwrap().value, "25");
        assert_eq!(reloaded.list().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_merges_do_not_lose_cookies() {
        let handle = AccountHandle::new(account());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.merge_cookies(vec![(format!("c{}", i), StoredCookie::new(i.to_string()))]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handle.snapshot().cookies.len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persists_keep_newest_jar() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AccountRegistry::load(dir.path().to_path_buf()).await.unwrap();
        let handle = registry.add(account()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.merge_cookies(vec![(format!("c{}", i), StoredCookie::new(i.to_string()))]);
                registry.persist(&handle).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let reloaded = AccountRegistry::load(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reloaded.get(handle.id()).unwrap().snapshot().cookies.len(), 32);
    }

    #[tokio::test]
    async fn test_remove_unknown_account() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AccountRegistry::load(dir.path().to_path_buf()).await.unwrap();
        assert!(matches!(
            registry.remove(Uuid::new_v4()).await,
            Err(IpafetchError::AccountNotFound(_))
        ));
    }
}
