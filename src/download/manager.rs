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


//! Download manager for purchased titles
//!
//! # Download Flow
//! 1. Validate the ASIN
//! 2. Request a content license and take its time-limited offline URL
//! 3. Stream the asset to `<output>.part`, then rename
//!
//! One manager is bound to one access token and marketplace. Independent
//! managers can run concurrently; nothing is shared between them.

use crate::api::auth::Account;
use crate::api::client::AudibleClient;
use crate::api::content::{validate_asin, DownloadQuality};
use crate::api::locale::LocaleRegistry;
use crate::config::CoreConfig;
use crate::download::stream::{stream_to_file, Deadline};
use crate::error::{LibriSyncError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One completed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub asin: String,
    pub output_path: String,
    pub bytes_downloaded: u64,
}

/// Per-call controls
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Abort the transfer when cancelled
    pub cancel: Option<CancellationToken>,

    /// Budget for license resolution plus transfer
    pub timeout: Option<Duration>,

    /// Bitrate tier requested in the license
    pub quality: DownloadQuality,
}

pub struct DownloadManager {
    client: AudibleClient,
}

impl DownloadManager {
    pub fn new(client: AudibleClient) -> Self {
        Self { client }
    }

    /// Manager for an account's current token; expired tokens are rejected
    pub fn for_account(account: &Account, config: &CoreConfig) -> Result<Self> {
        Ok(Self::new(AudibleClient::for_account(account, config)?))
    }

    /// Manager for a bare access token in the given marketplace
    pub fn with_token(access_token: &str, locale: &str, config: &CoreConfig) -> Result<Self> {
        let locale = LocaleRegistry::resolve(locale)?;
        Ok(Self::new(AudibleClient::new(access_token, locale, config)?))
    }

    /// Download `asin` to `output`
    ///
    /// # Errors
    /// - `AuthError` when the token cannot authorize the asset
    /// - `NetworkError` on transport failure or a short body
    /// - `IoError` when the output cannot be written
    /// - `Cancelled` / `Timeout` per `options`
    ///
    /// No file is left at `output` unless the transfer completed.
    pub async fn download(
        &self,
        asin: &str,
        output: &Path,
        options: &DownloadOptions,
    ) -> Result<DownloadDescriptor> {
        validate_asin(asin)?;
        if output.as_os_str().is_empty() {
            return Err(LibriSyncError::invalid_input("output path is empty"));
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        let deadline = options.timeout.map(Deadline::after);

        let resolve = self.client.resolve_download_url(asin, options.quality);
        let url = tokio::select! {
            _ = cancel.cancelled() => return Err(LibriSyncError::Cancelled),
            url = async {
                match &deadline {
                    Some(deadline) => deadline.run(resolve).await,
                    None => resolve.await,
                }
            } => url?,
        };

        let bytes_downloaded =
            stream_to_file(self.client.http(), &url, output, &cancel, deadline).await?;

        info!(asin, bytes = bytes_downloaded, output = %output.display(), "Download complete");
        Ok(DownloadDescriptor {
            asin: asin.to_string(),
            output_path: output.to_string_lossy().into_owned(),
            bytes_downloaded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_bad_asin_before_network() {
        let config = CoreConfig::default();
        let manager = DownloadManager::with_token("token", "us", &config).unwrap();

        let err = manager
            .download("nope", Path::new("/tmp/x.aax"), &DownloadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LibriSyncError::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_locale() {
        let config = CoreConfig::default();
        assert!(matches!(
            DownloadManager::with_token("token", "xx", &config),
            Err(LibriSyncError::UnsupportedLocale(_))
        ));
    }
}
