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


//! Device identity
//!
//! Every authorization, token exchange and refresh is bound to a device
//! serial: 32 hexadecimal characters, accepted in either case and stored
//! uppercase. The OAuth client id is derived from the serial and the
//! Audible device type.

use crate::api::locale::{Locale, LocaleRegistry};
use crate::error::{LibriSyncError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Audible device type registered by the mobile apps
pub const DEVICE_TYPE: &str = "A10KISP2GWF0E4";

lazy_static! {
    static ref SERIAL_PATTERN: Regex =
        Regex::new(r"^[0-9A-Fa-f]{32}$").expect("serial pattern is valid");
}

/// Validated 32-character hex device serial
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceSerial(String);

impl DeviceSerial {
    /// Validate and normalize a serial supplied by the caller
    pub fn parse(serial: &str) -> Result<Self> {
        if !SERIAL_PATTERN.is_match(serial) {
            return Err(LibriSyncError::invalid_input(format!(
                "device serial must be 32 hexadecimal characters (got {} characters)",
                serial.chars().count()
            )));
        }
        Ok(Self(serial.to_ascii_uppercase()))
    }

    /// Fresh random serial for a new device registration
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceSerial {
    type Error = LibriSyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeviceSerial> for String {
    fn from(serial: DeviceSerial) -> Self {
        serial.0
    }
}

impl fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceSerial({})", self.0)
    }
}

/// Device serial together with the market it authenticates against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    serial: DeviceSerial,
    locale: &'static Locale,
}

impl DeviceIdentity {
    /// Validate the serial first, then the locale
    pub fn new(locale_code: &str, serial: &str) -> Result<Self> {
        let serial = DeviceSerial::parse(serial)?;
        let locale = LocaleRegistry::resolve(locale_code)?;
        Ok(Self { serial, locale })
    }

    pub fn from_parts(locale: &'static Locale, serial: DeviceSerial) -> Self {
        Self { serial, locale }
    }

    pub fn serial(&self) -> &DeviceSerial {
        &self.serial
    }

    pub fn locale(&self) -> &'static Locale {
        self.locale
    }

    /// Hex of `SERIAL#DEVICE_TYPE`, lowercase, as sent in `auth_data.client_id`
    pub fn client_id_hex(&self) -> String {
        hex::encode(format!("{}#{}", self.serial, DEVICE_TYPE))
    }

    /// `device:` prefixed client id used on the sign-in page
    pub fn client_id(&self) -> String {
        format!("device:{}", self.client_id_hex())
    }
}
