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


//! Catalog models
//!
//! `Book` rows are written only by sync. Readers get owned copies.

use crate::api::library::LibraryItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;

// ============================================================================
// MAIN ENTITIES
// ============================================================================

/// One purchased title in one marketplace
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Book {
    pub asin: String,
    pub locale: String,
    pub title: String,
    pub subtitle: Option<String>,

    /// Comma-separated display names
    pub authors: String,
    pub narrators: String,

    pub runtime_minutes: Option<i64>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub cover_url: Option<String>,

    /// Content hash of the fields above; changes when the remote record does
    pub version: String,
    pub synced_at: DateTime<Utc>,
}

/// Book as built from a remote item, before it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct NewBook {
    pub asin: String,
    pub locale: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub authors: String,
    pub narrators: String,
    pub runtime_minutes: Option<i64>,
    pub purchase_date: Option<DateTime<Utc>>,
    pub cover_url: Option<String>,
    pub version: String,
}

impl NewBook {
    pub fn from_item(item: &LibraryItem, locale: &str) -> Self {
        let mut book = Self {
            asin: item.asin.trim().to_string(),
            locale: locale.to_string(),
            title: item.title.trim().to_string(),
            subtitle: item
                .subtitle
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            authors: item.author_names(),
            narrators: item.narrator_names(),
            runtime_minutes: item.length_in_minutes,
            purchase_date: item.purchase_date,
            cover_url: item.cover_url(),
            version: String::new(),
        };
        book.version = book.compute_version();
        book
    }

    /// SHA-256 over every persisted field, hex encoded
    pub fn compute_version(&self) -> String {
        fn field(hasher: &mut Sha256, value: Option<&str>) {
            match value {
                Some(v) => {
                    hasher.update([1u8]);
                    hasher.update((v.len() as u64).to_be_bytes());
                    hasher.update(v.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }

        let runtime = self.runtime_minutes.map(|m| m.to_string());
        let purchased = self.purchase_date.map(|d| d.to_rfc3339());

        let mut hasher = Sha256::new();
        field(&mut hasher, Some(&self.asin));
        field(&mut hasher, Some(&self.title));
        field(&mut hasher, self.subtitle.as_deref());
        field(&mut hasher, Some(&self.authors));
        field(&mut hasher, Some(&self.narrators));
        field(&mut hasher, runtime.as_deref());
        field(&mut hasher, purchased.as_deref());
        field(&mut hasher, self.cover_url.as_deref());
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// One slice of the ordered catalog
#[derive(Debug, Clone, Serialize)]
pub struct BookPage {
    pub books: Vec<Book>,
    /// Size of the whole catalog, independent of the slice
    pub total_count: i64,
}

/// Counts from one sync run. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySyncResult {
    pub total_items: u32,
    pub added: u32,
    pub updated: u32,
    pub removed: u32,
}

/// Counts from importing a single remote page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPageResult {
    pub page: u32,
    pub total_items: u32,
    pub added: u32,
    pub updated: u32,
    pub has_more: bool,
}
