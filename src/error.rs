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


//! Error types for LibriSync
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The variants
//! follow the categories a caller needs to act on:
//!
//! - **Input**: `InvalidInput`, `UnsupportedLocale`, `InvalidCallback`
//! - **Network**: `NetworkError` (retryable when transient), `ApiError`
//! - **Auth**: `AuthError` (never retried, requires a new authorization flow)
//! - **Local**: `StorageError`, `FormatError`, `IoError`
//! - **Control**: `InvalidState`, `Cancelled`, `Timeout`
//!
//! Error messages are shown to hosts verbatim, so they never contain
//! access tokens, refresh tokens, PKCE verifiers, activation bytes or
//! response bodies from the auth endpoints.

use thiserror::Error;

/// Result type alias using our LibriSyncError type
pub type Result<T> = std::result::Result<T, LibriSyncError>;

/// Main error type for LibriSync
#[derive(Error, Debug)]
pub enum LibriSyncError {
    // ===== Input Errors =====

    /// Malformed serial, activation bytes, offsets, ASINs or paths
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Locale code not present in the locale registry
    #[error("Unsupported locale: {0}")]
    UnsupportedLocale(String),

    /// OAuth redirect URL without a usable authorization code
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    // ===== Network/API Errors =====

    /// Transport failure or retryable server condition
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might succeed on retry
        is_transient: bool,
    },

    /// Invalid, expired or revoked credentials, PKCE or state mismatch
    #[error("Authentication failed: {message}")]
    AuthError {
        message: String,
        /// HTTP status code if the server rejected the request
        status_code: Option<u16>,
    },

    /// Server rejected the request for a reason other than auth
    #[error("API request failed: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
        endpoint: Option<String>,
    },

    // ===== Local Errors =====

    /// Store open, migration, read or write failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Malformed container or invalid decoded value
    #[error("Format error: {0}")]
    FormatError(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ===== Control Errors =====

    /// Operation not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),
}

impl From<reqwest::Error> for LibriSyncError {
    fn from(err: reqwest::Error) -> Self {
        // Asset URLs carry signed query strings
        let is_transient = err.is_timeout() || err.is_connect() || err.is_request();
        LibriSyncError::NetworkError {
            message: err.without_url().to_string(),
            is_transient,
        }
    }
}

impl From<sqlx::Error> for LibriSyncError {
    fn from(err: sqlx::Error) -> Self {
        LibriSyncError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for LibriSyncError {
    fn from(err: serde_json::Error) -> Self {
        LibriSyncError::FormatError(format!("JSON: {}", err))
    }
}

// Helper methods for creating common errors
impl LibriSyncError {
    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        LibriSyncError::InvalidInput(message.into())
    }

    /// Create an AuthError without a status code
    pub fn auth<S: Into<String>>(message: S) -> Self {
        LibriSyncError::AuthError {
            message: message.into(),
            status_code: None,
        }
    }

    /// Create a NetworkError
    pub fn network<S: Into<String>>(message: S, is_transient: bool) -> Self {
        LibriSyncError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create a FormatError with a message
    pub fn format<S: Into<String>>(message: S) -> Self {
        LibriSyncError::FormatError(message.into())
    }

    /// Create a StorageError with a message
    pub fn storage<S: Into<String>>(message: S) -> Self {
        LibriSyncError::StorageError(message.into())
    }

    /// Map an unsuccessful HTTP status into the taxonomy.
    ///
    /// 401/403 become `AuthError`, 429 and 5xx become transient
    /// `NetworkError`, everything else is an `ApiError`.
    pub fn from_status(status: u16, endpoint: &str) -> Self {
        match status {
            401 | 403 => LibriSyncError::AuthError {
                message: format!("{} rejected credentials (status {})", endpoint, status),
                status_code: Some(status),
            },
            429 | 500..=599 => LibriSyncError::NetworkError {
                message: format!("{} unavailable (status {})", endpoint, status),
                is_transient: true,
            },
            _ => LibriSyncError::ApiError {
                message: format!("{} returned status {}", endpoint, status),
                status_code: Some(status),
                endpoint: Some(endpoint.to_string()),
            },
        }
    }

    /// Check if error is retryable (transient network errors, timeouts)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LibriSyncError::NetworkError { is_transient: true, .. } | LibriSyncError::Timeout(_)
        )
    }

    /// Check if error means the caller has to authorize again
    pub fn is_auth_error(&self) -> bool {
        matches!(self, LibriSyncError::AuthError { .. })
    }
}
