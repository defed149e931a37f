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


//! Audible marketplaces
//!
//! Static table of the supported markets. Each entry carries the Audible
//! domain (library, content, activation), the Amazon domain (sign-in and
//! token endpoints) and the marketplace id sent during authorization.
//!
//! | Code | Audible | Amazon | Marketplace |
//! |------|---------|--------|-------------|
//! | us | audible.com | amazon.com | AF2M0KC94RCEA |
//! | uk | audible.co.uk | amazon.co.uk | A2I9A3Q2GNFNGQ |
//! | de | audible.de | amazon.de | AN7V1F1VY261K |
//! | fr | audible.fr | amazon.fr | A2728XDNODOQ8T |
//! | ca | audible.ca | amazon.ca | A2CQZ5RBY40XE |
//! | au | audible.com.au | amazon.com.au | AN7EY7DTAW63G |
//! | it | audible.it | amazon.it | A2N7FU2W2BU2ZC |
//! | es | audible.es | amazon.es | ALMIKO4SZCSAR |
//! | in | audible.in | amazon.in | AJO3FBRUE6J4S |
//! | jp | audible.co.jp | amazon.co.jp | A1QAP3MOU4173J |

use crate::config::EndpointOverrides;
use crate::error::{LibriSyncError, Result};
use serde::Serialize;

/// One Audible marketplace
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Locale {
    /// ISO country code (lowercase)
    pub country_code: &'static str,

    /// Human-readable name
    pub name: &'static str,

    /// Audible domain for this market
    pub domain: &'static str,

    #[serde(skip)]
    pub amazon_domain: &'static str,

    #[serde(skip)]
    pub marketplace_id: &'static str,

    /// Whether this locale signs in with email (true) or phone (false)
    #[serde(skip)]
    pub with_username: bool,
}

const LOCALES: [Locale; 10] = [
    Locale {
        country_code: "us",
        name: "United States",
        domain: "audible.com",
        amazon_domain: "amazon.com",
        marketplace_id: "AF2M0KC94RCEA",
        with_username: true,
    },
    Locale {
        country_code: "uk",
        name: "United Kingdom",
        domain: "audible.co.uk",
        amazon_domain: "amazon.co.uk",
        marketplace_id: "A2I9A3Q2GNFNGQ",
        with_username: true,
    },
    Locale {
        country_code: "de",
        name: "Germany",
        domain: "audible.de",
        amazon_domain: "amazon.de",
        marketplace_id: "AN7V1F1VY261K",
        with_username: true,
    },
    Locale {
        country_code: "fr",
        name: "France",
        domain: "audible.fr",
        amazon_domain: "amazon.fr",
        marketplace_id: "A2728XDNODOQ8T",
        with_username: true,
    },
    Locale {
        country_code: "ca",
        name: "Canada",
        domain: "audible.ca",
        amazon_domain: "amazon.ca",
        marketplace_id: "A2CQZ5RBY40XE",
        with_username: true,
    },
    Locale {
        country_code: "au",
        name: "Australia",
        domain: "audible.com.au",
        amazon_domain: "amazon.com.au",
        marketplace_id: "AN7EY7DTAW63G",
        with_username: true,
    },
    Locale {
        country_code: "it",
        name: "Italy",
        domain: "audible.it",
        amazon_domain: "amazon.it",
        marketplace_id: "A2N7FU2W2BU2ZC",
        with_username: true,
    },
    Locale {
        country_code: "es",
        name: "Spain",
        domain: "audible.es",
        amazon_domain: "amazon.es",
        marketplace_id: "ALMIKO4SZCSAR",
        with_username: true,
    },
    Locale {
        country_code: "in",
        name: "India",
        domain: "audible.in",
        amazon_domain: "amazon.in",
        marketplace_id: "AJO3FBRUE6J4S",
        with_username: true,
    },
    // Japan uses phone authentication instead of email
    Locale {
        country_code: "jp",
        name: "Japan",
        domain: "audible.co.jp",
        amazon_domain: "amazon.co.jp",
        marketplace_id: "A1QAP3MOU4173J",
        with_username: false,
    },
];

/// Lookup over the static marketplace table
pub struct LocaleRegistry;

impl LocaleRegistry {
    /// All supported locales, in display order
    pub fn all() -> &'static [Locale] {
        &LOCALES
    }

    /// Find a locale by country code (case-insensitive, surrounding whitespace ignored)
    pub fn resolve(code: &str) -> Result<&'static Locale> {
        let code = code.trim();
        LOCALES
            .iter()
            .find(|l| l.country_code.eq_ignore_ascii_case(code))
            .ok_or_else(|| LibriSyncError::UnsupportedLocale(code.to_string()))
    }
}

/// Base URLs for one locale after applying overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub amazon_api: String,
    pub amazon_www: String,
    pub audible_api: String,
    pub audible_www: String,
}

impl Endpoints {
    pub fn resolve(locale: &Locale, overrides: &EndpointOverrides) -> Self {
        let pick = |o: &Option<String>, default: String| {
            o.as_deref()
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(default)
        };

        Self {
            amazon_api: pick(&overrides.amazon_api, format!("https://api.{}", locale.amazon_domain)),
            amazon_www: pick(&overrides.amazon_www, format!("https://www.{}", locale.amazon_domain)),
            audible_api: pick(&overrides.audible_api, format!("https://api.{}", locale.domain)),
            audible_www: pick(&overrides.audible_www, format!("https://www.{}", locale.domain)),
        }
    }
}
