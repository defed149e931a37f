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


//! Activation bytes retrieval and validation
//!
//! # What are Activation Bytes?
//! - 4-byte key bound to one account and device registration
//! - Used to derive the AAX file key (see [`crate::crypto::aax`])
//! - Format: 8 hex characters (e.g., "1CEB00DA")
//! - Never log or expose in plaintext
//!
//! # Retrieval
//! `GET https://www.audible.{domain}/license/token?action=register&player_manuf=Audible,iPhone&player_model=iPhone`
//! with the bearer token returns a binary license blob. The activation
//! value is the little-endian `u32` located `0x238` bytes before the end
//! of the blob, printed as 8 lowercase hex digits.

use crate::api::locale::{Endpoints, LocaleRegistry};
use crate::config::CoreConfig;
use crate::error::{LibriSyncError, Result};
use crate::logging::mask;
use reqwest::header::AUTHORIZATION;
use std::fmt;
use tracing::{debug, info};

/// Offset of the activation value counted back from the end of the blob
const ACTIVATION_OFFSET_FROM_END: usize = 0x238;

/// Marker the license endpoint returns for a rejected token
const BAD_LOGIN_MARKER: &[u8] = b"BAD_LOGIN";

/// Four bytes of activation key material
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ActivationBytes([u8; 4]);

impl ActivationBytes {
    pub fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Parse an 8-character hex string (case-insensitive, no whitespace)
    pub fn from_hex(hex: &str) -> Result<Self> {
        parse_activation_bytes(hex).map(Self)
    }

    /// Lowercase hex, 8 characters
    pub fn to_hex(&self) -> String {
        format_activation_bytes(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Debug for ActivationBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActivationBytes(********)")
    }
}

/// True iff `value` is exactly 8 characters, each a hex digit
pub fn validate_activation_bytes(value: &str) -> bool {
    value.len() == 8 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse hex string to a 4-byte array
///
/// # Format Rules
/// - Must be exactly 8 characters (4 bytes)
/// - Only valid hex digits (0-9, A-F, a-f)
/// - Surrounding whitespace is rejected, not trimmed
pub fn parse_activation_bytes(hex: &str) -> Result<[u8; 4]> {
    if !validate_activation_bytes(hex) {
        return Err(LibriSyncError::invalid_input(format!(
            "activation bytes must be 8 hex characters (got {} characters)",
            hex.chars().count()
        )));
    }

    let mut bytes = [0u8; 4];
    hex::decode_to_slice(hex, &mut bytes)
        .map_err(|_| LibriSyncError::invalid_input("activation bytes are not valid hex"))?;
    Ok(bytes)
}

pub fn format_activation_bytes(bytes: &[u8; 4]) -> String {
    hex::encode(bytes)
}

/// Pull the activation value out of a license blob
pub fn extract_activation_bytes(blob: &[u8]) -> Result<ActivationBytes> {
    if blob
        .windows(BAD_LOGIN_MARKER.len())
        .any(|w| w == BAD_LOGIN_MARKER)
    {
        return Err(LibriSyncError::auth("activation request rejected the access token"));
    }

    if blob.len() < ACTIVATION_OFFSET_FROM_END {
        return Err(LibriSyncError::format(format!(
            "activation response too short ({} bytes)",
            blob.len()
        )));
    }

    let start = blob.len() - ACTIVATION_OFFSET_FROM_END;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&blob[start..start + 4]);
    let value = format!("{:08x}", u32::from_le_bytes(raw));

    // The printed value goes through the same strict check as caller input
    if !validate_activation_bytes(&value) {
        return Err(LibriSyncError::format("activation value failed validation"));
    }
    ActivationBytes::from_hex(&value)
        .map_err(|_| LibriSyncError::format("activation value failed validation"))
}

/// Fetches activation bytes for an account using a live access token
#[derive(Debug, Clone)]
pub struct ActivationService {
    http: reqwest::Client,
    config: CoreConfig,
}

impl ActivationService {
    pub fn new(config: &CoreConfig) -> Result<Self> {
        Ok(Self {
            http: config.http_client()?,
            config: config.clone(),
        })
    }

    /// Request the license blob and extract the activation bytes.
    ///
    /// Not retried: a rejected token needs a refresh, not another attempt.
    pub async fn get_activation_bytes(
        &self,
        locale_code: &str,
        access_token: &str,
    ) -> Result<ActivationBytes> {
        let locale = LocaleRegistry::resolve(locale_code)?;
        if access_token.trim().is_empty() {
            return Err(LibriSyncError::invalid_input("access token is empty"));
        }

        let endpoints = Endpoints::resolve(locale, &self.config.endpoints);
        let url = format!("{}/license/token", endpoints.audible_www);

        debug!(
            locale = locale.country_code,
            token = %mask(access_token),
            "Requesting activation blob"
        );

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .query(&[
                ("action", "register"),
                ("player_manuf", "Audible,iPhone"),
                ("player_model", "iPhone"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LibriSyncError::from_status(status.as_u16(), "/license/token"));
        }

        let blob = response.bytes().await?;
        let activation = extract_activation_bytes(&blob)?;
        info!(locale = locale.country_code, "Activation bytes retrieved");
        Ok(activation)
    }
}
