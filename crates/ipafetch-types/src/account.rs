//! Storefront accounts and their session cookies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Directory Services Identifier
// ============================================================================

/// The storefront's numeric account identifier ("DSID").
///
/// Always non-empty; there is no `Default` so a request can never be built
/// with a placeholder identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DirectoryServicesId(String);

impl DirectoryServicesId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidDirectoryServicesId> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidDirectoryServicesId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirectoryServicesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DirectoryServicesId {
    type Error = InvalidDirectoryServicesId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DirectoryServicesId> for String {
    fn from(id: DirectoryServicesId) -> Self {
        id.0
    }
}

/// Returned when an empty directory-services identifier is supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidDirectoryServicesId;

impl fmt::Display for InvalidDirectoryServicesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("directory services identifier must not be empty")
    }
}

impl std::error::Error for InvalidDirectoryServicesId {}

// ============================================================================
// Cookie Jar
// ============================================================================

/// A single cookie as remembered between storefront exchanges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl StoredCookie {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
        }
    }
}

/// Per-account session cookies, keyed by cookie name.
///
/// Responses are merged in; the jar is never replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CookieJar {
    cookies: BTreeMap<String, StoredCookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a single cookie
    pub fn set(&mut self, name: impl Into<String>, cookie: StoredCookie) {
        self.cookies.insert(name.into(), cookie);
    }

    pub fn get(&self, name: &str) -> Option<&StoredCookie> {
        self.cookies.get(name)
    }

    /// Union by name; values from `newer` win
    pub fn merge<I, N>(&mut self, newer: I)
    where
        I: IntoIterator<Item = (N, StoredCookie)>,
        N: Into<String>,
    {
        for (name, cookie) in newer {
            self.cookies.insert(name.into(), cookie);
        }
    }

    /// Render every cookie as a `Cookie` request header value
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, cookie)| format!("{}={}", name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoredCookie)> {
        self.cookies.iter()
    }
}

// ============================================================================
// Account
// ============================================================================

/// A signed-in storefront account.
///
/// Passwords and tokens live with the credential store, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub directory_services_id: DirectoryServicesId,
    /// Storefront / region code, e.g. "143441-1,29"
    pub store_front: String,
    #[serde(default)]
    pub cookies: CookieJar,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        email: String,
        directory_services_id: DirectoryServicesId,
        store_front: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            directory_services_id,
            store_front,
            cookies: CookieJar::new(),
            created_at: Utc::now(),
        }
    }
}
