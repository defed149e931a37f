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


//! Remote library catalog
//!
//! # API Endpoint Reference
//! **Primary endpoint:** `GET https://api.audible.{domain}/1.0/library`
//!
//! **Query Parameters:**
//! - `num_results` - Page size (default 50, max 1000)
//! - `page` - Page number (starts at 1)
//! - `response_groups` - Comma-separated list of data groups to include
//! - `sort_by` - Sort order
//!
//! # Paging
//! Pages are fetched in order until one of:
//! 1. an empty page
//! 2. a page shorter than the requested size
//! 3. `total_results` items have been seen
//! 4. the page guard is hit
//!
//! Items are de-duplicated by ASIN; the first occurrence wins.

use crate::api::client::AudibleClient;
use crate::error::{LibriSyncError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

const LIBRARY_ENDPOINT: &str = "/1.0/library";

/// Upper bound on pages requested in one sync
pub const MAX_PAGES: u32 = 1000;

// ============================================================================
// API REQUEST/RESPONSE STRUCTURES
// ============================================================================

/// Library query options
#[derive(Debug, Clone, Serialize)]
pub struct LibraryOptions {
    /// Number of results per page (default 50, max 1000)
    #[serde(rename = "num_results")]
    pub number_of_results_per_page: u32,

    /// Page number (1-indexed)
    #[serde(rename = "page")]
    pub page_number: u32,

    /// Comma-separated data groups
    pub response_groups: String,

    pub sort_by: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_sizes: Option<String>,
}

impl LibraryOptions {
    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            number_of_results_per_page: page_size,
            ..Self::default()
        }
    }
}

impl Default for LibraryOptions {
    fn default() -> Self {
        Self {
            number_of_results_per_page: 50,
            page_number: 1,
            response_groups: ["media", "product_desc", "contributors", "product_attrs"].join(","),
            sort_by: "-PurchaseDate".to_string(),
            image_sizes: Some("500,1215".to_string()),
        }
    }
}

/// Response from GET /1.0/library
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryResponse {
    #[serde(default)]
    pub items: Vec<LibraryItem>,

    /// Total number of items in the library (not always included)
    #[serde(default)]
    pub total_results: Option<u32>,
}

/// One purchased title as the library endpoint reports it
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryItem {
    pub asin: String,

    pub title: String,

    #[serde(default)]
    pub subtitle: Option<String>,

    #[serde(default)]
    pub authors: Vec<Person>,

    #[serde(default)]
    pub narrators: Vec<Person>,

    #[serde(rename = "runtime_length_min", default)]
    pub length_in_minutes: Option<i64>,

    /// Date added to the library
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,

    /// Cover art by pixel size ("500", "1215", ...)
    #[serde(default)]
    pub product_images: HashMap<String, String>,
}

impl LibraryItem {
    /// Author names joined for display and search
    pub fn author_names(&self) -> String {
        join_names(&self.authors)
    }

    pub fn narrator_names(&self) -> String {
        join_names(&self.narrators)
    }

    /// Largest available cover image
    pub fn cover_url(&self) -> Option<String> {
        self.product_images
            .iter()
            .max_by_key(|(size, _)| size.parse::<u32>().unwrap_or(0))
            .map(|(_, url)| url.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub asin: Option<String>,
    pub name: String,
}

fn join_names(people: &[Person]) -> String {
    people
        .iter()
        .map(|p| p.name.trim())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One fetched page and whether another should be requested
#[derive(Debug, Clone)]
pub struct LibraryPage {
    pub items: Vec<LibraryItem>,
    pub total_results: Option<u32>,
    pub has_more: bool,
}

/// Remote catalog after paging
#[derive(Debug, Clone, Default)]
pub struct RemoteLibrary {
    pub items: Vec<LibraryItem>,
    pub pages_fetched: u32,
    /// False when paging stopped at `MAX_PAGES` with more pages remaining
    pub complete: bool,
}

// ============================================================================
// PAGING
// ============================================================================

impl AudibleClient {
    /// Fetch one page of the library
    pub async fn fetch_library_page(&self, options: &LibraryOptions) -> Result<LibraryPage> {
        if options.page_number == 0 {
            return Err(LibriSyncError::invalid_input("library pages start at 1"));
        }

        let response: LibraryResponse = self.get_with_query(LIBRARY_ENDPOINT, options).await?;
        let page_size = options.number_of_results_per_page as usize;
        let seen = (options.page_number as u64 - 1) * page_size as u64 + response.items.len() as u64;

        let has_more = !response.items.is_empty()
            && response.items.len() >= page_size
            && response.total_results.map_or(true, |total| seen < total as u64);

        debug!(
            page = options.page_number,
            items = response.items.len(),
            total = ?response.total_results,
            has_more,
            "Fetched library page"
        );

        Ok(LibraryPage {
            items: response.items,
            total_results: response.total_results,
            has_more,
        })
    }

    /// Page through the whole library, de-duplicating by ASIN
    pub async fn fetch_all_library_items(&self, page_size: u32) -> Result<RemoteLibrary> {
        let mut options = LibraryOptions::with_page_size(page_size);
        let mut seen = HashSet::new();
        let mut library = RemoteLibrary::default();

        loop {
            let page = self.fetch_library_page(&options).await?;
            library.pages_fetched += 1;

            for item in page.items {
                if seen.insert(item.asin.clone()) {
                    library.items.push(item);
                }
            }

            if !page.has_more {
                library.complete = true;
                break;
            }
            if options.page_number >= MAX_PAGES {
                warn!(
                    pages = options.page_number,
                    total = ?page.total_results,
                    "Library paging stopped at page limit"
                );
                break;
            }
            options.page_number += 1;
        }

        info!(
            items = library.items.len(),
            pages = library.pages_fetched,
            complete = library.complete,
            "Fetched remote library"
        );
        Ok(library)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(json: serde_json::Value) -> LibraryItem {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_library_options_default() {
        let options = LibraryOptions::default();
        assert_eq!(options.number_of_results_per_page, 50);
        assert_eq!(options.page_number, 1);
        assert!(options.response_groups.contains("contributors"));
    }

    #[test]
    fn test_library_options_query() {
        let options = LibraryOptions::with_page_size(20);
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["num_results"], 20);
        assert_eq!(value["page"], 1);
    }

    #[test]
    fn test_minimal_item() {
        let item = item(serde_json::json!({"asin": "B0001", "title": "Dune"}));
        assert_eq!(item.author_names(), "");
        assert!(item.cover_url().is_none());
        assert!(item.purchase_date.is_none());
    }

    #[test]
    fn test_item_fields() {
        let item = item(serde_json::json!({
            "asin": "B0002",
            "title": "Foundation",
            "authors": [{"asin": "A1", "name": "Isaac Asimov"}, {"name": " "}],
            "narrators": [{"name": "Scott Brick"}],
            "runtime_length_min": 522,
            "purchase_date": "2023-04-01T12:00:00Z",
            "product_images": {"500": "https://img/500.jpg", "1215": "https://img/1215.jpg"}
        }));

        assert_eq!(item.author_names(), "Isaac Asimov");
        assert_eq!(item.narrator_names(), "Scott Brick");
        assert_eq!(item.length_in_minutes, Some(522));
        assert_eq!(item.cover_url().unwrap(), "https://img/1215.jpg");
    }
}
