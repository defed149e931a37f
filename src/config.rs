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


//! Core configuration
//!
//! [`CoreConfig`] is passed explicitly into every session, store and
//! manager. There is no global configuration.
//!
//! # Defaults
//! - HTTP timeout: 30 seconds
//! - Retry: 3 attempts, exponential backoff 1s, 2s, 4s
//! - Library page size: 50 (API maximum is 1000)
//! - Books missing from the remote catalog are removed on sync
//! - AAX checksum and key verification enabled

use crate::error::{LibriSyncError, Result};
use std::time::Duration;

/// Maximum retry attempts (1 initial + 2 retries = 3 total)
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Initial retry delay in seconds (exponential backoff: 1s, 2s, 4s)
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of library items requested per page
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page the library endpoint accepts
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            initial_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (attempt numbers start at 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay * 2_u32.pow(attempt.saturating_sub(1).min(16))
    }
}

/// Base URL overrides, mostly for staging servers and tests.
///
/// Any field left `None` resolves to the locale's production host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointOverrides {
    /// Replaces `https://api.amazon.{tld}` (register, token, deregister)
    pub amazon_api: Option<String>,
    /// Replaces `https://www.amazon.{tld}` (sign-in page)
    pub amazon_www: Option<String>,
    /// Replaces `https://api.audible.{tld}` (library, content)
    pub audible_api: Option<String>,
    /// Replaces `https://www.audible.{tld}` (activation)
    pub audible_www: Option<String>,
}

impl EndpointOverrides {
    /// Point every host at the same base URL
    pub fn all<S: Into<String>>(base: S) -> Self {
        let base = base.into();
        Self {
            amazon_api: Some(base.clone()),
            amazon_www: Some(base.clone()),
            audible_api: Some(base.clone()),
            audible_www: Some(base),
        }
    }
}

/// Configuration shared by auth, sync, download and decryption
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
    pub page_size: u32,
    pub remove_absent: bool,
    pub verify_checksum: bool,
    pub endpoints: EndpointOverrides,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: "Audible/671 CFNetwork/1240.0.4 Darwin/20.6.0".to_string(),
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            remove_absent: true,
            verify_checksum: true,
            endpoints: EndpointOverrides::default(),
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(LibriSyncError::invalid_input(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(LibriSyncError::invalid_input(format!(
                "page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }
        Ok(())
    }

    /// Build the reqwest client every HTTP call in the crate goes through
    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            // Amazon endpoints set session cookies the next request expects
            .cookie_store(true)
            .build()?)
    }
}

/// Builder for CoreConfig
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn retry(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.config.retry = RetryPolicy {
            max_attempts,
            initial_delay,
        };
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn remove_absent(mut self, remove: bool) -> Self {
        self.config.remove_absent = remove;
        self
    }

    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.config.verify_checksum = verify;
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointOverrides) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    /// Finish the builder, validating the result
    pub fn build(self) -> Result<CoreConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.remove_absent);
        assert!(config.verify_checksum);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_builder_rejects_bad_page_size() {
        assert!(CoreConfig::builder().page_size(0).build().is_err());
        assert!(CoreConfig::builder().page_size(1001).build().is_err());
        assert!(CoreConfig::builder().page_size(1000).build().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let result = CoreConfig::builder().retry(0, Duration::from_millis(1)).build();
        assert!(matches!(result, Err(LibriSyncError::InvalidInput(_))));
    }

    #[test]
    fn test_overrides_all() {
        let overrides = EndpointOverrides::all("http://127.0.0.1:9000");
        assert_eq!(overrides.amazon_api.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(overrides.audible_www.as_deref(), Some("http://127.0.0.1:9000"));
    }
}
