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


//! Content license requests
//!
//! # Endpoint
//! **POST** `/1.0/content/{asin}/licenserequest`
//!
//! ```json
//! {"drm_type": "Adrm", "consumption_type": "Download", "quality": "High"}
//! ```
//!
//! A granted license carries a time-limited CDN URL at
//! `content_license.content_metadata.content_url.offline_url`. The URL is
//! signed and must never be logged or put into an error message.

use crate::api::client::AudibleClient;
use crate::error::{LibriSyncError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// DRM scheme requested for the download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrmType {
    /// Audible DRM, decryptable with activation bytes
    Adrm,
    #[serde(other)]
    Other,
}

/// Audio bitrate tier of the licensed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadQuality {
    Normal,
    #[default]
    High,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumptionType {
    Download,
}

#[derive(Debug, Clone, Serialize)]
pub struct LicenseRequest {
    pub drm_type: DrmType,
    pub consumption_type: ConsumptionType,
    pub quality: DownloadQuality,
}

impl LicenseRequest {
    /// Offline download with Audible DRM at the given quality
    pub fn download(quality: DownloadQuality) -> Self {
        Self {
            drm_type: DrmType::Adrm,
            consumption_type: ConsumptionType::Download,
            quality,
        }
    }
}

impl Default for LicenseRequest {
    fn default() -> Self {
        Self::download(DownloadQuality::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LicenseEnvelope {
    content_license: ContentLicense,
}

/// License as returned by the content endpoint
#[derive(Clone, Deserialize)]
pub struct ContentLicense {
    #[serde(default)]
    pub asin: Option<String>,

    /// "Granted" when the account may download the title
    #[serde(default)]
    pub status_code: Option<String>,

    #[serde(default)]
    pub drm_type: Option<DrmType>,

    #[serde(default)]
    pub content_metadata: Option<ContentMetadata>,

    #[serde(default)]
    pub message: Option<String>,
}

impl std::fmt::Debug for ContentLicense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLicense")
            .field("asin", &self.asin)
            .field("status_code", &self.status_code)
            .field("drm_type", &self.drm_type)
            .field("has_offline_url", &self.offline_url().is_some())
            .finish()
    }
}

impl ContentLicense {
    pub fn is_granted(&self) -> bool {
        self.status_code
            .as_deref()
            .map_or(false, |s| s.eq_ignore_ascii_case("granted"))
    }

    pub fn offline_url(&self) -> Option<&str> {
        self.content_metadata
            .as_ref()
            .and_then(|m| m.content_url.as_ref())
            .and_then(|u| u.offline_url.as_deref())
            .filter(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentMetadata {
    #[serde(default)]
    pub content_url: Option<ContentUrl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentUrl {
    #[serde(default)]
    pub offline_url: Option<String>,
}

/// ASINs are ten ASCII letters or digits
pub fn validate_asin(asin: &str) -> Result<()> {
    if asin.len() != 10 || !asin.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(LibriSyncError::invalid_input(
            "ASIN must be 10 letters or digits",
        ));
    }
    Ok(())
}

impl AudibleClient {
    /// Request a download license for `asin`
    pub async fn request_content_license(
        &self,
        asin: &str,
        request: &LicenseRequest,
    ) -> Result<ContentLicense> {
        validate_asin(asin)?;
        let endpoint = format!("/1.0/content/{}/licenserequest", asin);
        let envelope: LicenseEnvelope = self.post(&endpoint, request).await?;
        debug!(asin, status = ?envelope.content_license.status_code, "License response");
        Ok(envelope.content_license)
    }

    /// Resolve the time-limited download URL for a purchased title
    pub async fn resolve_download_url(&self, asin: &str, quality: DownloadQuality) -> Result<String> {
        let license = self
            .request_content_license(asin, &LicenseRequest::download(quality))
            .await?;

        if !license.is_granted() {
            warn!(asin, status = ?license.status_code, "License not granted");
            return Err(LibriSyncError::AuthError {
                message: format!(
                    "license for {} not granted ({})",
                    asin,
                    license.status_code.as_deref().unwrap_or("no status")
                ),
                status_code: None,
            });
        }

        license
            .offline_url()
            .map(str::to_string)
            .ok_or_else(|| LibriSyncError::format(format!("license for {} has no download URL", asin)))
    }
}
