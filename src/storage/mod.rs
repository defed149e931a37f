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


//! Local catalog storage
//!
//! SQLite through sqlx. One `books` table keyed by (ASIN, locale), written
//! only by [`LibraryStore`] sync and read through ordered queries.
//!
//! # Usage Example
//! ```no_run
//! use librisync_core::config::CoreConfig;
//! use librisync_core::storage::LibraryStore;
//!
//! # async fn example() -> librisync_core::Result<()> {
//! let store = LibraryStore::open("./library.db", &CoreConfig::default()).await?;
//! let page = store.get_books(0, 20).await?;
//! println!("{} of {} books", page.books.len(), page.total_count);
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod library;
pub mod migrations;
pub mod models;
pub mod queries;

pub use database::Database;
pub use library::LibraryStore;
pub use models::{Book, BookPage, LibrarySyncResult, NewBook, SyncPageResult};
