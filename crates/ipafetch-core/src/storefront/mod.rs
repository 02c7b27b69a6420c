//! Storefront acquisition client
//!
//! Turns `(account, item id, optional version id)` into a
//! `TransferDescriptor` (download URL, license vouchers and version
//! strings) or a classified `AcquisitionError`.

mod request;
mod response;

pub use request::*;
pub use response::*;

use crate::accounts::AccountHandle;
use crate::error::{AcquisitionError, IpafetchError};
use chrono::{DateTime, Utc};
use ipafetch_types::{Settings, StoredCookie, TransferDescriptor};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{redirect, Client, Response};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Client for the storefront's download-product endpoint
#[derive(Debug, Clone)]
pub struct StorefrontClient {
    client: Client,
    endpoint: Url,
    device_identifier: String,
}

impl StorefrontClient {
    /// Create a client from settings
    pub fn new(settings: &Settings) -> Result<Self, IpafetchError> {
        let endpoint = Url::parse(&settings.storefront_endpoint).map_err(|e| {
            IpafetchError::InvalidConfig(format!(
                "storefront endpoint {}: {}",
                settings.storefront_endpoint, e
            ))
        })?;
        if settings.device_identifier.trim().is_empty() {
            return Err(IpafetchError::InvalidConfig(
                "device identifier must not be empty".to_string(),
            ));
        }

        // Redirects from this endpoint carry meaning and are reported, not followed
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::none())
            .http1_only()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.read_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            device_identifier: settings.device_identifier.clone(),
        })
    }

    /// Perform one acquisition exchange.
    ///
    /// Cookies returned by the server are merged into the account's jar
    /// whatever the outcome; callers persist the account afterwards.
    pub async fn acquire(
        &self,
        account: &AccountHandle,
        request: &AcquisitionRequest,
    ) -> Result<TransferDescriptor, AcquisitionError> {
        let session = account.snapshot();
        let dsid = session.directory_services_id.as_str();
        let body = encode_payload(request, &self.device_identifier)?;

        info!(
            "Requesting {} (version: {}) for account {}",
            request.item_id,
            request.external_version_id.as_deref().unwrap_or("latest"),
            session.id
        );

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, PLIST_CONTENT_TYPE)
            .header(DSID_HEADER, dsid)
            .header(DSID_HEADER_ALT, dsid);
        if let Some(cookie) = session.cookies.header_value() {
            builder = builder.header(COOKIE, cookie);
        }

        let response = builder.body(body).send().await?;

        account.merge_cookies(response_cookies(&response));

        let status = response.status().as_u16();
        if !response.status().is_success() {
            warn!("Storefront answered HTTP {} for {}", status, request.item_id);
            return Err(AcquisitionError::Transport { status });
        }

        let bytes = response.bytes().await?;
        let result = StorefrontResponse::classify(status, &bytes, &request.item_id).into_result();
        match &result {
            Ok(descriptor) => info!(
                "Acquired {} {} ({}) with {} vouchers",
                request.item_id,
                descriptor.short_version,
                descriptor.build_version,
                descriptor.vouchers.len()
            ),
            Err(e) => warn!("Acquisition of {} failed: {}", request.item_id, e),
        }
        result
    }
}

fn response_cookies(response: &Response) -> Vec<(String, StoredCookie)> {
    response
        .cookies()
        .map(|cookie| {
            (
                cookie.name().to_string(),
                StoredCookie {
                    value: cookie.value().to_string(),
                    domain: cookie.domain().map(str::to_string),
                    path: cookie.path().map(str::to_string),
                    expires: cookie.expires().map(DateTime::<Utc>::from),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use ipafetch_types::{Account, DirectoryServicesId};
    use plist::{Dictionary, Value};

    fn settings(endpoint: String) -> Settings {
        Settings {
            storefront_endpoint: endpoint,
            device_identifier: "AABBCCDDEEFF".to_string(),
            ..Settings::default()
        }
    }

    fn account() -> AccountHandle {
        let mut account = Account::new(
            "someone@example.com".to_string(),
            DirectoryServicesId::new("8675309").unwrap(),
            "143441-1,29".to_string(),
        );
        account.cookies.set("a", StoredCookie::new("1"));
        account.cookies.set("b", StoredCookie::new("2"));
        AccountHandle::new(account)
    }

    fn failure_body(code: &str) -> Vec<u8> {
        let mut root = Dictionary::new();
        root.insert("failureType".to_string(), Value::String(code.to_string()));
        let mut out = Vec::new();
        Value::Dictionary(root).to_writer_xml(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_headers_and_cookie_merge_on_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/buy")
                .header("content-type", PLIST_CONTENT_TYPE)
                .header("icloud-dsid", "8675309")
                .header("x-dsid", "8675309")
                .header("cookie", "a=1; b=2")
                .body_contains("salableAdamId");
            then.status(200)
                .header("set-cookie", "b=3; Path=/")
                .header("set-cookie", "c=4; Path=/")
                .body(failure_body("2034"));
        });

        let client = StorefrontClient::new(&settings(server.url("/buy"))).unwrap();
        let handle = account();
        let request = AcquisitionRequest::new("com.example.app", None).unwrap();

        let err = client.acquire(&handle, &request).await.unwrap_err();
        mock.assert();

        assert!(matches!(
            err,
            AcquisitionError::License {
                kind: crate::error::LicenseFailureKind::PasswordTokenExpired,
                ..
            }
        ));

        let jar = handle.snapshot().cookies;
        assert_eq!(jar.get("a").unwrap().value, "1");
        assert_eq!(jar.get("b").unwrap().value, "3");
        assert_eq!(jar.get("c").unwrap().value, "4");
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start();
        let target = server.mock(|when, then| {
            when.path("/elsewhere");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method(POST).path("/buy");
            then.status(302)
                .header("location", server.url("/elsewhere"))
                .header("set-cookie", "pod=25");
        });

        let client = StorefrontClient::new(&settings(server.url("/buy"))).unwrap();
        let handle = account();
        let request = AcquisitionRequest::new("com.example.app", None).unwrap();

        let err = client.acquire(&handle, &request).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Transport { status: 302 }));
        assert_eq!(target.hits(), 0);
        assert_eq!(handle.snapshot().cookies.get("pod").unwrap().value, "25");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(matches!(
            StorefrontClient::new(&settings("not a url".to_string())),
            Err(IpafetchError::InvalidConfig(_))
        ));
    }
}
