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


//! Library store and sync
//!
//! # Reconciliation
//! A sync fetches the complete remote catalog first, then applies it in one
//! transaction:
//! - remote ASIN not stored for the locale: insert (added)
//! - stored with a different version hash: overwrite (updated)
//! - stored but missing remotely: delete (removed), only when
//!   `CoreConfig::remove_absent` is set, only within the synced locale, and
//!   only when every remote page was fetched
//!
//! A failed fetch leaves the store untouched.
//!
//! # Locking
//! Every store path has one process-wide `RwLock`. Sync holds the write half
//! for the transaction; reads hold the read half. SQLite's own locking covers
//! other processes.

use crate::api::auth::Account;
use crate::api::client::AudibleClient;
use crate::api::library::{LibraryItem, LibraryOptions};
use crate::api::locale::LocaleRegistry;
use crate::config::CoreConfig;
use crate::error::{LibriSyncError, Result};
use crate::storage::database::Database;
use crate::storage::models::{Book, BookPage, LibrarySyncResult, NewBook, SyncPageResult};
use crate::storage::queries;
use chrono::Utc;
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

lazy_static! {
    static ref STORE_LOCKS: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>> = Mutex::new(HashMap::new());
}

/// Lock shared by every handle to the store at `path`
fn lock_for(path: &Path) -> Arc<RwLock<()>> {
    let key = store_key(path);
    let mut locks = STORE_LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(key).or_default().clone()
}

/// Canonical form of a store path. The file may not exist yet, so only the
/// parent directory is canonicalized.
fn store_key(path: &Path) -> PathBuf {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// Persisted catalog for one or more accounts
pub struct LibraryStore {
    db: Database,
    lock: Arc<RwLock<()>>,
    config: CoreConfig,
}

impl LibraryStore {
    /// Open or create the store at `path`
    ///
    /// Idempotent. Fails with `StorageError` when the path is not writable.
    pub async fn open<P: AsRef<Path>>(path: P, config: &CoreConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let lock = lock_for(path);

        // Creation and migrations run under the writer lock
        let db = {
            let _writer = lock.write().await;
            Database::open(path).await?
        };

        Ok(Self {
            lock,
            db,
            config: config.clone(),
        })
    }

    /// Store backed by an in-memory database, with its own lock
    pub async fn in_memory(config: &CoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            db: Database::new_in_memory().await?,
            lock: Arc::new(RwLock::new(())),
            config: config.clone(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn close(self) {
        self.db.close().await;
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Reconcile the store with the account's full remote library
    ///
    /// Running it twice against an unchanged remote reports no additions or
    /// updates the second time.
    pub async fn sync(&self, account: &Account) -> Result<LibrarySyncResult> {
        let client = AudibleClient::for_account(account, &self.config)?;
        let locale = LocaleRegistry::resolve(&account.locale)?.country_code;

        info!(locale, page_size = self.config.page_size, "Starting library sync");
        let remote = client.fetch_all_library_items(self.config.page_size).await?;

        let remove_absent = self.config.remove_absent && remote.complete;
        if self.config.remove_absent && !remote.complete {
            warn!(locale, "Remote library was truncated; keeping books not seen");
        }
        let result = self.import_items(locale, &remote.items, remove_absent).await?;

        info!(
            locale,
            pages = remote.pages_fetched,
            total = result.total_items,
            added = result.added,
            updated = result.updated,
            removed = result.removed,
            "Library sync complete"
        );
        Ok(result)
    }

    /// Import a single remote page. Never removes books.
    pub async fn sync_page(&self, account: &Account, page: u32) -> Result<SyncPageResult> {
        let client = AudibleClient::for_account(account, &self.config)?;
        let locale = LocaleRegistry::resolve(&account.locale)?.country_code;

        let mut options = LibraryOptions::with_page_size(self.config.page_size);
        options.page_number = page;
        let fetched = client.fetch_library_page(&options).await?;

        let counts = self.import_items(locale, &fetched.items, false).await?;
        Ok(SyncPageResult {
            page,
            total_items: counts.total_items,
            added: counts.added,
            updated: counts.updated,
            has_more: fetched.has_more,
        })
    }

    /// Apply a set of remote items to `locale` in one transaction
    ///
    /// Duplicate ASINs count once; the first occurrence wins. Items with a
    /// malformed ASIN are skipped.
    pub async fn import_items(
        &self,
        locale: &str,
        items: &[LibraryItem],
        remove_absent: bool,
    ) -> Result<LibrarySyncResult> {
        let mut seen = HashSet::new();
        let mut incoming = Vec::with_capacity(items.len());
        for item in items {
            let book = NewBook::from_item(item, locale);
            if crate::api::content::validate_asin(&book.asin).is_err() {
                warn!(asin = %book.asin, "Skipping library item with malformed ASIN");
                continue;
            }
            if seen.insert(book.asin.clone()) {
                incoming.push(book);
            }
        }

        let _writer = self.lock.write().await;
        let mut tx = self.db.pool().begin().await?;
        let stored = queries::list_versions(&mut tx, locale).await?;
        let now = Utc::now();

        let mut result = LibrarySyncResult {
            total_items: incoming.len() as u32,
            ..Default::default()
        };

        for book in &incoming {
            match stored.get(&book.asin) {
                None => {
                    queries::insert_book(&mut tx, book, now).await?;
                    result.added += 1;
                }
                Some(version) if *version != book.version => {
                    queries::update_book(&mut tx, book, now).await?;
                    result.updated += 1;
                }
                Some(_) => {}
            }
        }

        if remove_absent {
            for asin in stored.keys().filter(|asin| !seen.contains(*asin)) {
                if queries::delete_book(&mut tx, asin, locale).await? {
                    result.removed += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(locale, ?result, "Applied library changes");
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Ordered slice of the catalog plus its total size
    pub async fn get_books(&self, offset: i64, limit: i64) -> Result<BookPage> {
        if offset < 0 || limit < 0 {
            return Err(LibriSyncError::invalid_input(
                "offset and limit must not be negative",
            ));
        }

        let _reader = self.lock.read().await;
        let books = queries::list_books(self.db.pool(), limit, offset).await?;
        let total_count = queries::count_books(self.db.pool()).await?;

        Ok(BookPage { books, total_count })
    }

    /// Title or author substring search, in catalog order
    ///
    /// A blank query matches nothing.
    pub async fn search(&self, query: &str) -> Result<Vec<Book>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let _reader = self.lock.read().await;
        queries::search_books(self.db.pool(), query).await
    }

    pub async fn get_book(&self, asin: &str) -> Result<Option<Book>> {
        let _reader = self.lock.read().await;
        queries::find_book_by_asin(self.db.pool(), asin.trim()).await
    }
}
