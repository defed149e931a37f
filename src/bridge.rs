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


//! Host-facing operations
//!
//! Every operation runs to completion on the bridge's own Tokio runtime and
//! returns an [`Envelope`]:
//!
//! ```json
//! { "success": true,  "data": { ... } }
//! { "success": false, "error": "Error message" }
//! ```
//!
//! Nothing is cached between calls. Each call gets the account, token or
//! store path it needs, so one `Bridge` can serve many accounts and stores
//! from several threads at once.
//!
//! Error messages come from [`LibriSyncError`]'s `Display`, which never
//! includes tokens, verifiers or activation bytes. Panics are caught and
//! reported as a generic failure without the panic payload.

use crate::api::auth::{self, Account, AuthChallenge, AuthSession, TokenGrant};
use crate::api::locale::{Locale, LocaleRegistry};
use crate::config::CoreConfig;
use crate::crypto::aax::{AaxDecrypter, DecryptOutcome};
use crate::crypto::activation::{validate_activation_bytes, ActivationBytes, ActivationService};
use crate::download::{DownloadDescriptor, DownloadManager, DownloadOptions};
use crate::error::{LibriSyncError, Result};
use crate::storage::{Book, BookPage, LibraryStore, LibrarySyncResult, SyncPageResult};
use serde::Serialize;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

// ============================================================================
// RESPONSE ENVELOPE
// ============================================================================

/// Uniform result of one boundary call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> std::result::Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// JSON form for hosts that exchange strings
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({
                "success": false,
                "error": format!("could not encode response: {}", e),
            })
            .to_string()
        })
    }
}

// ============================================================================
// RESPONSE DATA
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackData {
    pub authorization_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationData {
    pub activation_bytes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitData {
    pub initialized: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchData {
    pub books: Vec<Book>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookData {
    pub book: Option<Book>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidData {
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalesData {
    pub locales: Vec<Locale>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeregisterData {
    pub deregistered: bool,
}

// ============================================================================
// BRIDGE
// ============================================================================

/// Context object for host calls: a runtime plus configuration
pub struct Bridge {
    runtime: Runtime,
    config: CoreConfig,
}

impl Bridge {
    pub fn new() -> Result<Self> {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("librisync-bridge")
            .build()?;

        Ok(Self { runtime, config })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Run `op`, converting errors and panics into a failed envelope
    fn guard<T, F>(&self, op: &'static str, f: F) -> Envelope<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(data)) => Envelope::ok(data),
            Ok(Err(e)) => {
                debug!(op, error = %e, "Operation failed");
                Envelope::err(e.to_string())
            }
            Err(_) => {
                error!(op, "Operation panicked");
                Envelope::err(format!("internal error in {}", op))
            }
        }
    }

    fn block_on<T, F>(&self, op: &'static str, fut: F) -> Envelope<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard(op, || self.runtime.block_on(fut))
    }

    async fn open_store(&self, path: &str) -> Result<LibraryStore> {
        LibraryStore::open(require_path(path)?, &self.config).await
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    pub fn begin_authorization(&self, locale: &str, device_serial: &str) -> Envelope<AuthChallenge> {
        self.guard("begin_authorization", || {
            AuthSession::new(locale, device_serial, &self.config)?.begin_authorization()
        })
    }

    /// `expected_state` is the `state` from `begin_authorization`; when the
    /// redirect carries a state it must match.
    pub fn parse_callback(
        &self,
        callback_url: &str,
        expected_state: Option<&str>,
    ) -> Envelope<CallbackData> {
        self.guard("parse_callback", || {
            let authorization_code = auth::parse_authorization_callback(callback_url, expected_state)?;
            Ok(CallbackData { authorization_code })
        })
    }

    pub fn exchange_code(
        &self,
        locale: &str,
        code: &str,
        device_serial: &str,
        pkce_verifier: &str,
    ) -> Envelope<TokenGrant> {
        self.block_on("exchange_code", async {
            let mut session =
                AuthSession::resume(locale, device_serial, pkce_verifier, None, &self.config)?;
            let tokens = session.exchange_code(code).await?;
            Ok(TokenGrant::from(&tokens))
        })
    }

    /// Non-rotating: the same refresh token keeps working after use
    pub fn refresh(&self, locale: &str, refresh_token: &str, device_serial: &str) -> Envelope<TokenGrant> {
        self.block_on("refresh", async {
            let tokens =
                auth::refresh_access_token(locale, refresh_token, device_serial, &self.config).await?;
            Ok(TokenGrant::from(&tokens))
        })
    }

    pub fn deregister(&self, locale: &str, access_token: &str) -> Envelope<DeregisterData> {
        self.block_on("deregister", async {
            auth::deregister_device(locale, access_token, &self.config).await?;
            Ok(DeregisterData { deregistered: true })
        })
    }

    pub fn get_activation_bytes(&self, locale: &str, access_token: &str) -> Envelope<ActivationData> {
        self.block_on("get_activation_bytes", async {
            let bytes = ActivationService::new(&self.config)?
                .get_activation_bytes(locale, access_token)
                .await?;
            Ok(ActivationData {
                activation_bytes: bytes.to_hex(),
            })
        })
    }

    // ------------------------------------------------------------------
    // Library store
    // ------------------------------------------------------------------

    pub fn init_store(&self, path: &str) -> Envelope<InitData> {
        self.block_on("init_store", async {
            self.open_store(path).await?.close().await;
            Ok(InitData { initialized: true })
        })
    }

    pub fn sync(&self, path: &str, account: &Account) -> Envelope<LibrarySyncResult> {
        self.block_on("sync", async {
            let store = self.open_store(path).await?;
            let result = store.sync(account).await;
            store.close().await;
            result
        })
    }

    pub fn sync_page(&self, path: &str, account: &Account, page: u32) -> Envelope<SyncPageResult> {
        self.block_on("sync_page", async {
            let store = self.open_store(path).await?;
            let result = store.sync_page(account, page).await;
            store.close().await;
            result
        })
    }

    pub fn get_books(&self, path: &str, offset: i64, limit: i64) -> Envelope<BookPage> {
        self.block_on("get_books", async {
            self.open_store(path).await?.get_books(offset, limit).await
        })
    }

    pub fn get_book(&self, path: &str, asin: &str) -> Envelope<BookData> {
        self.block_on("get_book", async {
            let book = self.open_store(path).await?.get_book(asin).await?;
            Ok(BookData { book })
        })
    }

    pub fn search(&self, path: &str, query: &str) -> Envelope<SearchData> {
        self.block_on("search", async {
            let books = self.open_store(path).await?.search(query).await?;
            Ok(SearchData { books })
        })
    }

    // ------------------------------------------------------------------
    // Download and decryption
    // ------------------------------------------------------------------

    pub fn download(
        &self,
        asin: &str,
        access_token: &str,
        locale: &str,
        output_path: &str,
        options: &DownloadOptions,
    ) -> Envelope<DownloadDescriptor> {
        self.block_on("download", async {
            let manager = DownloadManager::with_token(access_token, locale, &self.config)?;
            manager
                .download(asin, require_path(output_path)?, options)
                .await
        })
    }

    pub fn decrypt(
        &self,
        input_path: &str,
        output_path: &str,
        activation_bytes: &str,
        cancel: Option<&CancellationToken>,
    ) -> Envelope<DecryptOutcome> {
        self.block_on("decrypt", async {
            let decrypter = AaxDecrypter::new(checked_activation(activation_bytes)?)
                .with_verify_checksum(self.config.verify_checksum);
            let cancel = cancel.cloned().unwrap_or_default();
            decrypter
                .decrypt_file_with_cancel(require_path(input_path)?, require_path(output_path)?, &cancel)
                .await
        })
    }

    /// Check activation bytes against a container without decrypting it
    pub fn verify_activation_bytes(&self, input_path: &str, activation_bytes: &str) -> Envelope<ValidData> {
        self.block_on("verify_activation_bytes", async {
            let decrypter = AaxDecrypter::new(checked_activation(activation_bytes)?);
            let valid = decrypter.verify(require_path(input_path)?).await?;
            Ok(ValidData { valid })
        })
    }

    // ------------------------------------------------------------------
    // Utility
    // ------------------------------------------------------------------

    pub fn validate_activation_bytes(&self, activation_bytes: &str) -> Envelope<ValidData> {
        self.guard("validate_activation_bytes", || {
            Ok(ValidData {
                valid: validate_activation_bytes(activation_bytes),
            })
        })
    }

    pub fn get_supported_locales(&self) -> Envelope<LocalesData> {
        self.guard("get_supported_locales", || {
            Ok(LocalesData {
                locales: LocaleRegistry::all().to_vec(),
            })
        })
    }
}

fn require_path(path: &str) -> Result<&Path> {
    if path.trim().is_empty() {
        return Err(LibriSyncError::invalid_input("path is empty"));
    }
    Ok(Path::new(path))
}

fn checked_activation(activation_bytes: &str) -> Result<ActivationBytes> {
    if !validate_activation_bytes(activation_bytes) {
        return Err(LibriSyncError::invalid_input(
            "activation bytes must be 8 hexadecimal characters",
        ));
    }
    ActivationBytes::from_hex(activation_bytes)
}
