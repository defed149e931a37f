// LibriSync - Audible Library Sync for Mobile
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


//! Authentication with Audible via OAuth 2.0 + PKCE
//!
//! # Flow
//! 1. [`AuthSession::begin_authorization`] creates a PKCE verifier, its
//!    S256 challenge and a `state` nonce, and builds the Amazon sign-in URL.
//! 2. The user signs in; Amazon redirects to `/ap/maplanding` with
//!    `openid.oa2.authorization_code`.
//! 3. [`AuthSession::parse_callback`] extracts the code and checks `state`
//!    when the redirect echoes it.
//! 4. [`AuthSession::exchange_code`] registers the device at
//!    `/auth/register`, sending the code and verifier. The server recomputes
//!    the challenge, so only the holder of the verifier gets tokens.
//! 5. [`AuthSession::refresh`] trades the refresh token for a new access
//!    token at `/auth/token`.
//!
//! # States
//! ```text
//! Unauthenticated -> AuthorizationRequested -> CodeReceived -> Authenticated <-> Refreshing
//!                                                          \-> Failed          \-> Revoked
//! ```
//!
//! # Refresh policy
//! Refresh tokens are treated as non-rotating. A refreshed [`TokenSet`]
//! keeps the refresh token it was derived from unless the server sends a
//! replacement.

use crate::api::client::send_with_retry;
use crate::api::device::{DeviceIdentity, DeviceSerial, DEVICE_TYPE};
use crate::api::locale::{Endpoints, LocaleRegistry};
use crate::config::{CoreConfig, RetryPolicy};
use crate::error::{LibriSyncError, Result};
use crate::logging::mask;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// App identity sent with token refresh requests
const APP_NAME: &str = "Audible";
const APP_VERSION: &str = "3.56.2";

/// Tokens are refreshed this many seconds before they expire
const REFRESH_MARGIN_SECS: i64 = 300;

/// Verifier length limits from RFC 7636
const MIN_VERIFIER_LEN: usize = 43;
const MAX_VERIFIER_LEN: usize = 128;

// ============================================================================
// PKCE and state
// ============================================================================

/// PKCE code verifier and challenge pair (S256)
#[derive(Clone)]
pub struct PkceChallenge {
    /// 32 random bytes, base64url without padding (43 characters)
    pub verifier: String,
    /// base64url(SHA-256(verifier)) without padding
    pub challenge: String,
}

impl PkceChallenge {
    pub const METHOD: &'static str = "S256";

    /// Generate a new verifier and derive its challenge
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Rebuild the pair from a verifier kept by the caller
    pub fn from_verifier<S: Into<String>>(verifier: S) -> Self {
        let verifier = verifier.into();
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    /// One-way S256 transform of a verifier
    pub fn challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        general_purpose::URL_SAFE_NO_PAD.encode(digest)
    }

    /// Check a caller-supplied verifier against RFC 7636 before use
    pub fn validate_verifier(verifier: &str) -> Result<()> {
        let len = verifier.len();
        let allowed = verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));

        if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&len) || !allowed {
            return Err(LibriSyncError::invalid_input(
                "PKCE verifier must be 43-128 unreserved characters",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("verifier", &mask(&self.verifier))
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// OAuth state nonce, bound to one authorization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState(String);

impl OAuthState {
    /// Random UUID v4, 36 characters
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_value<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Everything the caller needs to send the user to sign in
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub authorization_url: String,
    pub pkce_verifier: String,
    pub state: String,
}

impl fmt::Debug for AuthChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthChallenge")
            .field("authorization_url", &self.authorization_url)
            .field("pkce_verifier", &mask(&self.pkce_verifier))
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// Tokens and accounts
// ============================================================================

/// Bearer tokens bound to the device serial that earned them
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub device_serial: DeviceSerial,
}

impl TokenSet {
    /// Build from a relative lifetime received just now
    pub fn from_expires_in(
        access_token: String,
        refresh_token: String,
        token_type: String,
        expires_in_secs: i64,
        device_serial: DeviceSerial,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type,
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs.max(0)),
            device_serial,
        }
    }

    /// Seconds until expiry, never negative
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// True within five minutes of expiry
    pub fn needs_refresh(&self) -> bool {
        Utc::now() + ChronoDuration::seconds(REFRESH_MARGIN_SECS) >= self.expires_at
    }

    /// Expired tokens must not reach protected endpoints
    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_expired() {
            return Err(LibriSyncError::auth("access token expired, refresh required"));
        }
        Ok(())
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &mask(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("device_serial", &self.device_serial)
            .finish()
    }
}

/// Token payload as reported to hosts after exchange or refresh
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&TokenSet> for TokenGrant {
    fn from(tokens: &TokenSet) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            expires_in: tokens.expires_in(),
            token_type: tokens.token_type.clone(),
            expires_at: tokens.expires_at,
        }
    }
}

/// Authenticated account context: locale plus device-bound tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub account_id: Option<String>,
    pub locale: String,
    pub tokens: TokenSet,
}

impl Account {
    pub fn new<S: Into<String>>(locale: S, tokens: TokenSet) -> Self {
        Self {
            account_id: None,
            locale: locale.into(),
            tokens,
        }
    }

    pub fn identity(&self) -> Result<DeviceIdentity> {
        let locale = LocaleRegistry::resolve(&self.locale)?;
        Ok(DeviceIdentity::from_parts(locale, self.tokens.device_serial.clone()))
    }
}

// ============================================================================
// URL building and callback parsing
// ============================================================================

/// Build the Amazon sign-in URL for an authorization attempt
pub fn build_authorization_url(
    identity: &DeviceIdentity,
    pkce: &PkceChallenge,
    state: &OAuthState,
    endpoints: &Endpoints,
) -> Result<String> {
    let locale = identity.locale();

    let mut url = Url::parse(&format!("{}/ap/signin", endpoints.amazon_www))
        .map_err(|e| LibriSyncError::invalid_input(format!("invalid sign-in URL: {}", e)))?;

    {
        let mut query = url.query_pairs_mut();

        // OAuth parameters first, matching the order the Audible app sends
        query.append_pair("openid.oa2.response_type", "code");
        query.append_pair("openid.oa2.code_challenge_method", PkceChallenge::METHOD);
        query.append_pair("openid.oa2.code_challenge", &pkce.challenge);

        query.append_pair("openid.return_to", &format!("{}/ap/maplanding", endpoints.amazon_www));
        query.append_pair("openid.assoc_handle", &format!("amzn_audible_ios_{}", locale.country_code));
        query.append_pair("openid.identity", "http://specs.openid.net/auth/2.0/identifier_select");
        query.append_pair("pageId", "amzn_audible_ios");
        query.append_pair("accountStatusPolicy", "P1");
        query.append_pair("openid.claimed_id", "http://specs.openid.net/auth/2.0/identifier_select");
        query.append_pair("openid.mode", "checkid_setup");
        query.append_pair("openid.ns.oa2", "http://www.amazon.com/ap/ext/oauth/2");
        query.append_pair("openid.oa2.client_id", &identity.client_id());
        query.append_pair("openid.ns.pape", "http://specs.openid.net/extensions/pape/1.0");
        query.append_pair("marketPlaceId", locale.marketplace_id);
        query.append_pair("openid.oa2.scope", "device_auth_access");
        query.append_pair("forceMobileLayout", "true");
        query.append_pair("openid.ns", "http://specs.openid.net/auth/2.0");
        query.append_pair("openid.pape.max_auth_age", "0");
        query.append_pair("state", state.as_str());
    }

    Ok(url.to_string())
}

/// Extract the authorization code from the redirect URL.
///
/// When `expected_state` is given and the redirect carries a `state`
/// parameter, the two must match.
pub fn parse_authorization_callback(
    callback_url: &str,
    expected_state: Option<&str>,
) -> Result<String> {
    let url = Url::parse(callback_url.trim())
        .map_err(|e| LibriSyncError::InvalidCallback(format!("not a URL: {}", e)))?;

    let params: HashMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Some(error) = params.get("error") {
        return Err(LibriSyncError::auth(format!("sign-in was rejected: {}", error)));
    }

    if let (Some(expected), Some(returned)) = (expected_state, params.get("state")) {
        if expected != returned {
            return Err(LibriSyncError::auth("state parameter does not match this authorization"));
        }
    }

    params
        .get("openid.oa2.authorization_code")
        .or_else(|| params.get("code"))
        .filter(|code| !code.trim().is_empty())
        .cloned()
        .ok_or_else(|| LibriSyncError::InvalidCallback("authorization code missing".to_string()))
}

// ============================================================================
// Token endpoint DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
struct RegisterEnvelope {
    response: RegisterBody,
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(default)]
    success: Option<RegisterSuccess>,
    #[serde(default)]
    error: Option<EndpointError>,
}

#[derive(Debug, Deserialize)]
struct RegisterSuccess {
    tokens: RegisterTokens,
}

#[derive(Debug, Deserialize)]
struct RegisterTokens {
    bearer: BearerTokenInfo,
}

#[derive(Deserialize)]
struct BearerTokenInfo {
    access_token: String,
    refresh_token: String,
    /// Sent as a string ("3600") by /auth/register
    expires_in: serde_json::Value,
}

impl fmt::Debug for BearerTokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenInfo")
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &mask(&self.refresh_token))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct EndpointError {
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: serde_json::Value,
    #[serde(default = "default_token_type")]
    token_type: String,
}

#[derive(Debug, Deserialize)]
struct RefreshError {
    #[serde(default)]
    error: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

fn seconds(value: &serde_json::Value) -> Result<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| LibriSyncError::format("expires_in is not a number of seconds"))
}

// ============================================================================
// Token endpoint requests
// ============================================================================

/// POST /auth/register with the authorization code and PKCE verifier
async fn request_registration(
    http: &reqwest::Client,
    endpoints: &Endpoints,
    identity: &DeviceIdentity,
    authorization_code: &str,
    verifier: &str,
) -> Result<TokenSet> {
    let serial = identity.serial().as_str();
    let body = serde_json::json!({
        "requested_token_type": [
            "bearer",
            "mac_dms",
            "website_cookies",
            "store_authentication_cookie"
        ],
        "cookies": {
            "website_cookies": [],
            "domain": format!(".{}", identity.locale().amazon_domain)
        },
        "registration_data": {
            "domain": "DeviceLegacy",
            "device_type": DEVICE_TYPE,
            "device_serial": serial,
            "app_name": "com.audible.application",
            "app_version": "177102",
            "device_name": "%FIRST_NAME%%FIRST_NAME_POSSESSIVE_STRING%%DUPE_STRATEGY_1ST%Android",
            "os_version": "Android/sdk_phone64_x86_64/emu64x:14/UE1A.230829.036.A1/11228894:userdebug/test-keys",
            "software_version": "130050002",
            "device_model": "Android SDK built for x86_64"
        },
        "device_metadata": {
            "device_os_family": "android",
            "device_type": DEVICE_TYPE,
            "device_serial": serial,
            "manufacturer": "unknown",
            "model": "Android SDK built for x86_64",
            "os_version": "34",
            "product": "34"
        },
        "auth_data": {
            "use_global_authentication": "true",
            "authorization_code": authorization_code,
            "code_verifier": verifier,
            "code_algorithm": "SHA-256",
            "client_domain": "DeviceLegacy",
            "client_id": identity.client_id_hex()
        },
        "requested_extensions": ["device_info", "customer_info"]
    });

    let url = format!("{}/auth/register", endpoints.amazon_api);
    debug!(locale = identity.locale().country_code, verifier = %mask(verifier), "Registering device");

    let response = http.post(&url).json(&body).send().await?;
    let status = response.status();
    let text = response.text().await?;

    if status.is_server_error() || status.as_u16() == 429 {
        return Err(LibriSyncError::from_status(status.as_u16(), "/auth/register"));
    }

    let parsed: Option<RegisterEnvelope> = serde_json::from_str(&text).ok();

    if !status.is_success() {
        let code = parsed
            .and_then(|p| p.response.error)
            .and_then(|e| e.code)
            .unwrap_or_else(|| "unknown".to_string());
        return Err(LibriSyncError::AuthError {
            message: format!("authorization code exchange rejected ({})", code),
            status_code: Some(status.as_u16()),
        });
    }

    let body = parsed
        .ok_or_else(|| LibriSyncError::format("registration response is not valid JSON"))?
        .response;

    let success = match (body.success, body.error) {
        (Some(success), _) => success,
        (None, error) => {
            let code = error.and_then(|e| e.code).unwrap_or_else(|| "unknown".to_string());
            return Err(LibriSyncError::auth(format!(
                "authorization code exchange rejected ({})",
                code
            )));
        }
    };

    let bearer = success.tokens.bearer;
    let expires_in = seconds(&bearer.expires_in)?;

    Ok(TokenSet::from_expires_in(
        bearer.access_token,
        bearer.refresh_token,
        "Bearer".to_string(),
        expires_in,
        identity.serial().clone(),
    ))
}

/// POST /auth/token, retrying transient failures
async fn request_refresh(
    http: &reqwest::Client,
    endpoints: &Endpoints,
    retry: &RetryPolicy,
    identity: &DeviceIdentity,
    refresh_token: &str,
) -> Result<TokenSet> {
    if refresh_token.trim().is_empty() {
        return Err(LibriSyncError::invalid_input("refresh token is empty"));
    }

    let url = format!("{}/auth/token", endpoints.amazon_api);
    let form = [
        ("app_name", APP_NAME),
        ("app_version", APP_VERSION),
        ("source_token", refresh_token),
        ("source_token_type", "refresh_token"),
        ("requested_token_type", "access_token"),
    ];

    debug!(refresh_token = %mask(refresh_token), "Refreshing access token");
    let response = send_with_retry(retry, "/auth/token", || http.post(&url).form(&form)).await?;
    let status = response.status();

    if !status.is_success() {
        if status.is_client_error() && status.as_u16() != 429 {
            let reason = response
                .json::<RefreshError>()
                .await
                .ok()
                .and_then(|e| e.error)
                .unwrap_or_else(|| format!("status {}", status.as_u16()));
            return Err(LibriSyncError::AuthError {
                message: format!("refresh token rejected ({})", reason),
                status_code: Some(status.as_u16()),
            });
        }
        return Err(LibriSyncError::from_status(status.as_u16(), "/auth/token"));
    }

    let text = response.text().await?;
    let refreshed: RefreshResponse = serde_json::from_str(&text)
        .map_err(|e| LibriSyncError::format(format!("unexpected refresh response: {}", e)))?;
    let expires_in = seconds(&refreshed.expires_in)?;

    Ok(TokenSet::from_expires_in(
        refreshed.access_token,
        refreshed
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string()),
        refreshed.token_type,
        expires_in,
        identity.serial().clone(),
    ))
}

/// POST /auth/deregister for the device owning `access_token`
async fn request_deregister(
    http: &reqwest::Client,
    endpoints: &Endpoints,
    access_token: &str,
) -> Result<()> {
    let url = format!("{}/auth/deregister", endpoints.amazon_api);
    let response = http
        .post(&url)
        .header(AUTHORIZATION, format!("Bearer {}", access_token))
        .json(&serde_json::json!({ "deregister_all_existing_accounts": false }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(LibriSyncError::from_status(status.as_u16(), "/auth/deregister"));
    }
    Ok(())
}

// ============================================================================
// Session state machine
// ============================================================================

/// Lifecycle of one authentication context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    AuthorizationRequested,
    CodeReceived,
    Authenticated,
    Refreshing,
    Failed,
    Revoked,
}

#[derive(Debug, Clone)]
struct PendingAuthorization {
    pkce: PkceChallenge,
    state: Option<OAuthState>,
}

/// OAuth2 + PKCE session bound to one device identity.
///
/// The session owns the pending challenge until a code exchange consumes
/// it, and the [`TokenSet`] once authenticated. Nothing is cached outside
/// the session object.
#[derive(Debug)]
pub struct AuthSession {
    identity: DeviceIdentity,
    endpoints: Endpoints,
    http: reqwest::Client,
    retry: RetryPolicy,
    state: AuthState,
    pending: Option<PendingAuthorization>,
    code: Option<String>,
    tokens: Option<TokenSet>,
}

impl AuthSession {
    /// Unauthenticated session. Validates the serial, then the locale.
    pub fn new(locale_code: &str, device_serial: &str, config: &CoreConfig) -> Result<Self> {
        let identity = DeviceIdentity::new(locale_code, device_serial)?;
        Self::with_identity(identity, config)
    }

    fn with_identity(identity: DeviceIdentity, config: &CoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            endpoints: Endpoints::resolve(identity.locale(), &config.endpoints),
            identity,
            http: config.http_client()?,
            retry: config.retry,
            state: AuthState::Unauthenticated,
            pending: None,
            code: None,
            tokens: None,
        })
    }

    /// Continue a flow whose challenge was issued earlier, possibly by
    /// another process that kept the verifier.
    pub fn resume(
        locale_code: &str,
        device_serial: &str,
        pkce_verifier: &str,
        state: Option<&str>,
        config: &CoreConfig,
    ) -> Result<Self> {
        let mut session = Self::new(locale_code, device_serial, config)?;
        PkceChallenge::validate_verifier(pkce_verifier)?;

        session.pending = Some(PendingAuthorization {
            pkce: PkceChallenge::from_verifier(pkce_verifier),
            state: state.map(OAuthState::from_value),
        });
        session.state = AuthState::AuthorizationRequested;
        Ok(session)
    }

    /// Authenticated session from a stored account
    pub fn restore(account: &Account, config: &CoreConfig) -> Result<Self> {
        let mut session = Self::with_identity(account.identity()?, config)?;
        session.tokens = Some(account.tokens.clone());
        session.state = AuthState::Authenticated;
        Ok(session)
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn tokens(&self) -> Option<&TokenSet> {
        self.tokens.as_ref()
    }

    /// Account context for store and download calls
    pub fn account(&self) -> Option<Account> {
        self.tokens
            .as_ref()
            .map(|t| Account::new(self.identity.locale().country_code, t.clone()))
    }

    /// Start a new authorization attempt, replacing any pending one
    pub fn begin_authorization(&mut self) -> Result<AuthChallenge> {
        let pkce = PkceChallenge::generate();
        let state = OAuthState::generate();
        let authorization_url =
            build_authorization_url(&self.identity, &pkce, &state, &self.endpoints)?;

        let challenge = AuthChallenge {
            authorization_url,
            pkce_verifier: pkce.verifier.clone(),
            state: state.as_str().to_string(),
        };

        self.pending = Some(PendingAuthorization {
            pkce,
            state: Some(state),
        });
        self.code = None;
        self.state = AuthState::AuthorizationRequested;

        info!(
            locale = self.identity.locale().country_code,
            "Authorization requested"
        );
        Ok(challenge)
    }

    /// Extract the code from the redirect and check it belongs to this attempt
    pub fn parse_callback(&mut self, callback_url: &str) -> Result<String> {
        let pending = match (&self.state, &self.pending) {
            (AuthState::AuthorizationRequested, Some(pending)) => pending,
            _ => {
                return Err(LibriSyncError::InvalidState(
                    "no authorization in progress".to_string(),
                ))
            }
        };

        let expected = pending.state.as_ref().map(|s| s.as_str().to_string());
        match parse_authorization_callback(callback_url, expected.as_deref()) {
            Ok(code) => {
                self.code = Some(code.clone());
                self.state = AuthState::CodeReceived;
                Ok(code)
            }
            Err(e) if e.is_auth_error() => {
                warn!(error = %e, "Authorization callback rejected");
                self.pending = None;
                self.state = AuthState::Failed;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Exchange the code for tokens, consuming the pending challenge.
    ///
    /// A transport failure keeps the challenge so the exchange can be
    /// retried; a rejection discards it.
    pub async fn exchange_code(&mut self, authorization_code: &str) -> Result<TokenSet> {
        if !matches!(
            self.state,
            AuthState::AuthorizationRequested | AuthState::CodeReceived
        ) {
            return Err(LibriSyncError::InvalidState(
                "no authorization in progress".to_string(),
            ));
        }
        if authorization_code.trim().is_empty() {
            return Err(LibriSyncError::invalid_input("authorization code is empty"));
        }

        let pending = self
            .pending
            .take()
            .ok_or_else(|| LibriSyncError::InvalidState("authorization already used".to_string()))?;

        let result = request_registration(
            &self.http,
            &self.endpoints,
            &self.identity,
            authorization_code,
            &pending.pkce.verifier,
        )
        .await;

        match result {
            Ok(tokens) => {
                info!(
                    locale = self.identity.locale().country_code,
                    expires_in = tokens.expires_in(),
                    "Device registered"
                );
                self.code = None;
                self.tokens = Some(tokens.clone());
                self.state = AuthState::Authenticated;
                Ok(tokens)
            }
            Err(e) if e.is_retryable() => {
                self.pending = Some(pending);
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Code exchange failed");
                self.code = None;
                self.state = AuthState::Failed;
                Err(e)
            }
        }
    }

    /// Trade the current refresh token for a new access token
    pub async fn refresh(&mut self) -> Result<TokenSet> {
        let refresh_token = match (&self.state, &self.tokens) {
            (AuthState::Authenticated, Some(tokens)) => tokens.refresh_token.clone(),
            _ => return Err(LibriSyncError::InvalidState("session is not authenticated".to_string())),
        };

        self.state = AuthState::Refreshing;
        let result = request_refresh(
            &self.http,
            &self.endpoints,
            &self.retry,
            &self.identity,
            &refresh_token,
        )
        .await;

        match result {
            Ok(tokens) => {
                debug!(expires_in = tokens.expires_in(), "Access token refreshed");
                self.tokens = Some(tokens.clone());
                self.state = AuthState::Authenticated;
                Ok(tokens)
            }
            Err(e) if e.is_auth_error() => {
                warn!(error = %e, "Refresh token no longer accepted");
                self.tokens = None;
                self.state = AuthState::Failed;
                Err(e)
            }
            Err(e) => {
                self.state = AuthState::Authenticated;
                Err(e)
            }
        }
    }

    /// Deregister this device. The session ends in `Revoked`.
    pub async fn deregister(&mut self) -> Result<()> {
        let access_token = match (&self.state, &self.tokens) {
            (AuthState::Authenticated, Some(tokens)) => {
                tokens.ensure_valid()?;
                tokens.access_token.clone()
            }
            _ => return Err(LibriSyncError::InvalidState("session is not authenticated".to_string())),
        };

        request_deregister(&self.http, &self.endpoints, &access_token).await?;
        info!(serial = %self.identity.serial(), "Device deregistered");
        self.tokens = None;
        self.state = AuthState::Revoked;
        Ok(())
    }
}

/// Refresh without a session object, for hosts that only keep the token
pub async fn refresh_access_token(
    locale_code: &str,
    refresh_token: &str,
    device_serial: &str,
    config: &CoreConfig,
) -> Result<TokenSet> {
    let identity = DeviceIdentity::new(locale_code, device_serial)?;
    let endpoints = Endpoints::resolve(identity.locale(), &config.endpoints);
    request_refresh(&config.http_client()?, &endpoints, &config.retry, &identity, refresh_token).await
}

/// Deregister the device owning `access_token`
pub async fn deregister_device(
    locale_code: &str,
    access_token: &str,
    config: &CoreConfig,
) -> Result<()> {
    let locale = LocaleRegistry::resolve(locale_code)?;
    if access_token.trim().is_empty() {
        return Err(LibriSyncError::invalid_input("access token is empty"));
    }
    let endpoints = Endpoints::resolve(locale, &config.endpoints);
    request_deregister(&config.http_client()?, &endpoints, access_token).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: &str = "A1B2C3D4E5F6A1B2C3D4E5F6A1B2C3D4";

    fn query_param(url: &str, key: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_pkce_generate() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.verifier.len(), 43);
        assert_eq!(pkce.challenge.len(), 43);
        assert_eq!(pkce.challenge, PkceChallenge::challenge_for(&pkce.verifier));
        assert!(PkceChallenge::validate_verifier(&pkce.verifier).is_ok());
    }

    #[test]
    fn test_pkce_rfc7636_vector() {
        // RFC 7636 appendix B
        let challenge = PkceChallenge::challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_pkce_unique() {
        let a = PkceChallenge::generate();
        let b = PkceChallenge::generate();
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn test_verifier_validation() {
        assert!(PkceChallenge::validate_verifier("short").is_err());
        assert!(PkceChallenge::validate_verifier(&"a".repeat(129)).is_err());
        assert!(PkceChallenge::validate_verifier(&format!("{}!", "a".repeat(43))).is_err());
        assert!(PkceChallenge::validate_verifier(&"a-._~".repeat(10)).is_ok());
    }

    #[test]
    fn test_pkce_debug_masks_verifier() {
        let pkce = PkceChallenge::generate();
        let debug = format!("{:?}", pkce);
        assert!(!debug.contains(&pkce.verifier));
    }

    #[test]
    fn test_session_rejects_invalid_config() {
        let mut config = CoreConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            AuthSession::new("us", SERIAL, &config),
            Err(LibriSyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_begin_authorization_url() {
        let mut session = AuthSession::new("us", SERIAL, &CoreConfig::default()).unwrap();
        let challenge = session.begin_authorization().unwrap();

        assert_eq!(session.state(), AuthState::AuthorizationRequested);
        assert!(challenge.authorization_url.starts_with("https://www.amazon.com/ap/signin?"));
        assert_eq!(challenge.state.len(), 36);

        let url = &challenge.authorization_url;
        assert_eq!(
            query_param(url, "openid.oa2.code_challenge").unwrap(),
            PkceChallenge::challenge_for(&challenge.pkce_verifier)
        );
        assert_eq!(query_param(url, "openid.oa2.code_challenge_method").unwrap(), "S256");
        assert_eq!(query_param(url, "state").unwrap(), challenge.state);
        assert_eq!(query_param(url, "marketPlaceId").unwrap(), "AF2M0KC94RCEA");
        assert_eq!(query_param(url, "openid.assoc_handle").unwrap(), "amzn_audible_ios_us");

        let client_id = query_param(url, "openid.oa2.client_id").unwrap();
        assert_eq!(client_id, format!("device:{}", hex::encode(format!("{}#A10KISP2GWF0E4", SERIAL))));
    }

    #[test]
    fn test_begin_authorization_locale_domain() {
        let mut session = AuthSession::new("uk", SERIAL, &CoreConfig::default()).unwrap();
        let challenge = session.begin_authorization().unwrap();
        assert!(challenge.authorization_url.starts_with("https://www.amazon.co.uk/ap/signin?"));
        assert_eq!(
            query_param(&challenge.authorization_url, "openid.return_to").unwrap(),
            "https://www.amazon.co.uk/ap/maplanding"
        );
    }

    #[test]
    fn test_new_session_validation() {
        let err = AuthSession::new("us", "123", &CoreConfig::default()).unwrap_err();
        assert!(matches!(err, LibriSyncError::InvalidInput(_)));
        let err = AuthSession::new("zz", SERIAL, &CoreConfig::default()).unwrap_err();
        assert!(matches!(err, LibriSyncError::UnsupportedLocale(_)));
    }

    #[test]
    fn test_parse_callback_code() {
        let url = "https://www.amazon.com/ap/maplanding?openid.oa2.authorization_code=ANcode123&openid.mode=id_res";
        assert_eq!(parse_authorization_callback(url, None).unwrap(), "ANcode123");

        let url = "https://localhost/callback?code=XYZ";
        assert_eq!(parse_authorization_callback(url, None).unwrap(), "XYZ");
    }

    #[test]
    fn test_parse_callback_missing_code() {
        let err = parse_authorization_callback("https://www.amazon.com/ap/maplanding?x=1", None).unwrap_err();
        assert!(matches!(err, LibriSyncError::InvalidCallback(_)));

        let err = parse_authorization_callback("not a url", None).unwrap_err();
        assert!(matches!(err, LibriSyncError::InvalidCallback(_)));

        let err = parse_authorization_callback("https://x/cb?code=", None).unwrap_err();
        assert!(matches!(err, LibriSyncError::InvalidCallback(_)));
    }

    #[test]
    fn test_parse_callback_oauth_error() {
        let err = parse_authorization_callback("https://x/cb?error=access_denied", None).unwrap_err();
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_parse_callback_state() {
        let url = "https://x/cb?code=abc&state=s1";
        assert_eq!(parse_authorization_callback(url, Some("s1")).unwrap(), "abc");
        assert!(parse_authorization_callback(url, Some("s2")).unwrap_err().is_auth_error());
        // Redirects without state are accepted
        assert_eq!(parse_authorization_callback("https://x/cb?code=abc", Some("s1")).unwrap(), "abc");
    }

    #[test]
    fn test_session_callback_transitions() {
        let mut session = AuthSession::new("us", SERIAL, &CoreConfig::default()).unwrap();
        assert!(matches!(
            session.parse_callback("https://x/cb?code=abc"),
            Err(LibriSyncError::InvalidState(_))
        ));

        let challenge = session.begin_authorization().unwrap();
        let code = session
            .parse_callback(&format!("https://x/cb?code=abc&state={}", challenge.state))
            .unwrap();
        assert_eq!(code, "abc");
        assert_eq!(session.state(), AuthState::CodeReceived);
    }

    #[test]
    fn test_session_state_mismatch_fails() {
        let mut session = AuthSession::new("us", SERIAL, &CoreConfig::default()).unwrap();
        session.begin_authorization().unwrap();
        let err = session.parse_callback("https://x/cb?code=abc&state=forged").unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(session.state(), AuthState::Failed);
    }

    #[test]
    fn test_resume_validates_verifier() {
        let config = CoreConfig::default();
        assert!(AuthSession::resume("us", SERIAL, "short", None, &config).is_err());

        let pkce = PkceChallenge::generate();
        let session = AuthSession::resume("us", SERIAL, &pkce.verifier, None, &config).unwrap();
        assert_eq!(session.state(), AuthState::AuthorizationRequested);
    }

    #[test]
    fn test_token_set_expiry() {
        let serial = DeviceSerial::parse(SERIAL).unwrap();
        let fresh = TokenSet::from_expires_in("a".into(), "r".into(), "Bearer".into(), 3600, serial.clone());
        assert!(!fresh.is_expired());
        assert!(!fresh.needs_refresh());
        assert!(fresh.expires_in() > 3590);
        assert!(fresh.ensure_valid().is_ok());

        let soon = TokenSet::from_expires_in("a".into(), "r".into(), "Bearer".into(), 60, serial.clone());
        assert!(soon.needs_refresh());
        assert!(!soon.is_expired());

        let expired = TokenSet::from_expires_in("a".into(), "r".into(), "Bearer".into(), 0, serial);
        assert!(expired.is_expired());
        assert_eq!(expired.expires_in(), 0);
        assert!(expired.ensure_valid().unwrap_err().is_auth_error());
    }

    #[test]
    fn test_token_set_debug_masks() {
        let serial = DeviceSerial::parse(SERIAL).unwrap();
        let tokens = TokenSet::from_expires_in(
            "Atna|access-secret".into(),
            "Atnr|refresh-secret".into(),
            "Bearer".into(),
            3600,
            serial,
        );
        let debug = format!("{:?}", tokens);
        assert!(!debug.contains("access-secret"));
        assert!(!debug.contains("refresh-secret"));
    }

    #[test]
    fn test_account_round_trip_keeps_serial() {
        let serial = DeviceSerial::parse(SERIAL).unwrap();
        let tokens = TokenSet::from_expires_in("a".into(), "r".into(), "Bearer".into(), 3600, serial);
        let account = Account::new("de", tokens);

        let json = serde_json::to_string(&account).unwrap();
        let back: Account = serde_json::from_str(&json).unwrap();
        let identity = back.identity().unwrap();
        assert_eq!(identity.serial().as_str(), SERIAL);
        assert_eq!(identity.locale().country_code, "de");
    }

    #[test]
    fn test_seconds_parsing() {
        assert_eq!(seconds(&serde_json::json!("3600")).unwrap(), 3600);
        assert_eq!(seconds(&serde_json::json!(1800)).unwrap(), 1800);
        assert!(seconds(&serde_json::json!(null)).is_err());
    }
}
