// RN Audible - React Native Audible Client
// Copyright (C) 2025 Henning Berge
//
// This program is a Rust port of Libation (https://github.com/rmcrackan/Libation)
// Original work Copyright (C) Libation contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! HTTP client for the Audible API
//!
//! `AudibleClient` wraps `reqwest::Client` with a bearer token and the
//! locale's API base URL. Requests go through [`send_with_retry`]:
//!
//! - Maximum 3 attempts (1 initial + 2 retries) by default
//! - Exponential backoff: 1s, 2s, 4s between retries
//! - Retry on: transient network errors, 5xx, 429
//! - No retry on: 4xx client errors, auth failures
//!
//! There is no token refresh inside the client. A 401/403 surfaces as
//! `AuthError` and the caller decides whether to refresh or re-authorize.

use crate::api::auth::Account;
use crate::api::locale::{Endpoints, Locale};
use crate::config::{CoreConfig, RetryPolicy};
use crate::error::{LibriSyncError, Result};
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Send a request, retrying transient failures with bounded backoff.
///
/// Returns the final response whatever its status once no retry applies;
/// callers map non-success statuses themselves. Transport errors that are
/// not transient, or that persist past the last attempt, become
/// `NetworkError`.
pub(crate) async fn send_with_retry<F>(
    policy: &RetryPolicy,
    endpoint: &str,
    build: F,
) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let retry_reason = match build().send().await {
            Ok(response) => {
                let status = response.status();
                let retryable_status =
                    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;

                if retryable_status && attempt < policy.max_attempts {
                    LibriSyncError::from_status(status.as_u16(), endpoint)
                } else {
                    return Ok(response);
                }
            }
            Err(e) => {
                let err = LibriSyncError::from(e);
                if !err.is_retryable() || attempt >= policy.max_attempts {
                    return Err(err);
                }
                err
            }
        };

        let delay = policy.delay_for(attempt);
        warn!(
            endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %retry_reason,
            "Retrying request"
        );
        sleep(delay).await;
    }
}

/// Bearer-authenticated JSON client for `https://api.audible.{tld}`
#[derive(Debug, Clone)]
pub struct AudibleClient {
    client: Client,
    base_url: String,
    access_token: String,
    retry: RetryPolicy,
}

impl AudibleClient {
    pub fn new(access_token: &str, locale: &Locale, config: &CoreConfig) -> Result<Self> {
        if access_token.trim().is_empty() {
            return Err(LibriSyncError::invalid_input("access token is empty"));
        }

        Ok(Self {
            client: config.http_client()?,
            base_url: Endpoints::resolve(locale, &config.endpoints).audible_api,
            access_token: access_token.to_string(),
            retry: config.retry,
        })
    }

    /// Client for an account, rejecting expired tokens up front
    pub fn for_account(account: &Account, config: &CoreConfig) -> Result<Self> {
        account.tokens.ensure_valid()?;
        let identity = account.identity()?;
        Self::new(&account.tokens.access_token, identity.locale(), config)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn bearer(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", self.access_token))
            .map_err(|_| LibriSyncError::invalid_input("access token contains invalid characters"))
    }

    /// GET with query parameters
    pub async fn get_with_query<T, Q>(&self, endpoint: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let bearer = self.bearer()?;

        let response = send_with_retry(&self.retry, endpoint, || {
            self.client
                .request(Method::GET, &url)
                .header(AUTHORIZATION, bearer.clone())
                .header(ACCEPT, "application/json")
                .query(query)
        })
        .await?;

        self.handle_response(endpoint, response).await
    }

    /// POST with JSON body
    pub async fn post<T, B>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let bearer = self.bearer()?;

        let response = send_with_retry(&self.retry, endpoint, || {
            self.client
                .request(Method::POST, &url)
                .header(AUTHORIZATION, bearer.clone())
                .header(ACCEPT, "application/json")
                .json(body)
        })
        .await?;

        self.handle_response(endpoint, response).await
    }

    async fn handle_response<T>(&self, endpoint: &str, response: Response) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            debug!(endpoint, status = status.as_u16(), "Request rejected");
            return Err(LibriSyncError::from_status(status.as_u16(), endpoint));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            LibriSyncError::format(format!("unexpected response from {}: {}", endpoint, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::locale::LocaleRegistry;
    use crate::config::EndpointOverrides;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> CoreConfig {
        CoreConfig::builder()
            .retry(3, Duration::from_millis(5))
            .endpoints(EndpointOverrides::all(server.uri()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_rejects_empty_token() {
        let us = LocaleRegistry::resolve("us").unwrap();
        let result = AudibleClient::new("  ", us, &CoreConfig::default());
        assert!(matches!(result, Err(LibriSyncError::InvalidInput(_))));
    }

    #[test]
    fn test_base_url_from_locale() {
        let uk = LocaleRegistry::resolve("uk").unwrap();
        let client = AudibleClient::new("token", uk, &CoreConfig::default()).unwrap();
        assert_eq!(client.base_url(), "https://api.audible.co.uk");
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/ping"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/ping"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let us = LocaleRegistry::resolve("us").unwrap();
        let client = AudibleClient::new("token", us, &config_for(&server)).unwrap();
        let value: serde_json::Value = client.get_with_query("/1.0/ping", &[("a", "b")]).await.unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/ping"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let us = LocaleRegistry::resolve("us").unwrap();
        let client = AudibleClient::new("token", us, &config_for(&server)).unwrap();
        let err = client
            .get_with_query::<serde_json::Value, _>("/1.0/ping", &[("a", "b")])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/ping"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let us = LocaleRegistry::resolve("us").unwrap();
        let client = AudibleClient::new("secret-token", us, &config_for(&server)).unwrap();
        let err = client
            .get_with_query::<serde_json::Value, _>("/1.0/ping", &[("a", "b")])
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
        assert!(!err.to_string().contains("secret-token"));
    }
}
