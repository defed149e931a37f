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


//! Database query functions
//!
//! Reads take the pool. Writes take a connection so sync can run them
//! inside one transaction.
//!
//! Every listing uses the same total order: newest purchase first, books
//! without a purchase date last, ties broken by ASIN.

use crate::error::Result;
use crate::storage::models::{Book, NewBook};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;

const CATALOG_ORDER: &str = "ORDER BY purchase_date DESC, asin ASC, locale ASC";

// ============================================================================
// WRITES
// ============================================================================

pub async fn insert_book(conn: &mut SqliteConnection, book: &NewBook, synced_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO books (
            asin, locale, title, subtitle, authors, narrators,
            runtime_minutes, purchase_date, cover_url, version, synced_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&book.asin)
    .bind(&book.locale)
    .bind(&book.title)
    .bind(&book.subtitle)
    .bind(&book.authors)
    .bind(&book.narrators)
    .bind(book.runtime_minutes)
    .bind(book.purchase_date)
    .bind(&book.cover_url)
    .bind(&book.version)
    .bind(synced_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Overwrite the stored fields of an existing (asin, locale) row
pub async fn update_book(conn: &mut SqliteConnection, book: &NewBook, synced_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE books SET
            title = ?, subtitle = ?, authors = ?, narrators = ?,
            runtime_minutes = ?, purchase_date = ?, cover_url = ?,
            version = ?, synced_at = ?
        WHERE asin = ? AND locale = ?
        "#,
    )
    .bind(&book.title)
    .bind(&book.subtitle)
    .bind(&book.authors)
    .bind(&book.narrators)
    .bind(book.runtime_minutes)
    .bind(book.purchase_date)
    .bind(&book.cover_url)
    .bind(&book.version)
    .bind(synced_at)
    .bind(&book.asin)
    .bind(&book.locale)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn delete_book(conn: &mut SqliteConnection, asin: &str, locale: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM books WHERE asin = ? AND locale = ?")
        .bind(asin)
        .bind(locale)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Stored version hash of every book in one marketplace, keyed by ASIN
pub async fn list_versions(conn: &mut SqliteConnection, locale: &str) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT asin, version FROM books WHERE locale = ?")
        .bind(locale)
        .fetch_all(conn)
        .await?;

    Ok(rows.into_iter().collect())
}

// ============================================================================
// READS
// ============================================================================

/// Find a book by ASIN in any marketplace
pub async fn find_book_by_asin(pool: &SqlitePool, asin: &str) -> Result<Option<Book>> {
    let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE asin = ? ORDER BY locale LIMIT 1")
        .bind(asin)
        .fetch_optional(pool)
        .await?;

    Ok(book)
}

pub async fn find_book(pool: &SqlitePool, asin: &str, locale: &str) -> Result<Option<Book>> {
    let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE asin = ? AND locale = ?")
        .bind(asin)
        .bind(locale)
        .fetch_optional(pool)
        .await?;

    Ok(book)
}

/// One slice of the catalog in display order
pub async fn list_books(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Book>> {
    let sql = format!("SELECT * FROM books {} LIMIT ? OFFSET ?", CATALOG_ORDER);
    let books = sqlx::query_as::<_, Book>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    Ok(books)
}

pub async fn count_books(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
        .fetch_one(pool)
        .await?;

    Ok(count)
}

/// Substring match on title or authors
///
/// Matching is case-insensitive for ASCII letters. `%`, `_` and `\` in the
/// query match themselves.
pub async fn search_books(pool: &SqlitePool, query: &str) -> Result<Vec<Book>> {
    let pattern = format!("%{}%", escape_like(query));
    let sql = format!(
        r#"SELECT * FROM books
        WHERE title LIKE ? ESCAPE '\' OR authors LIKE ? ESCAPE '\'
        {}"#,
        CATALOG_ORDER
    );

    let books = sqlx::query_as::<_, Book>(&sql)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(pool)
        .await?;

    Ok(books)
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::Database;
    use chrono::TimeZone;

    fn book(asin: &str, title: &str, purchased: Option<i64>) -> NewBook {
        let mut book = NewBook {
            asin: asin.to_string(),
            locale: "us".to_string(),
            title: title.to_string(),
            subtitle: None,
            authors: "Some Author".to_string(),
            narrators: String::new(),
            runtime_minutes: Some(60),
            purchase_date: purchased.map(|secs| Utc.timestamp_opt(secs, 0).unwrap()),
            cover_url: None,
            version: String::new(),
        };
        book.version = book.compute_version();
        book
    }

    async fn seeded() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let now = Utc::now();
        insert_book(&mut conn, &book("B000000003", "Third", Some(1_000)), now).await.unwrap();
        insert_book(&mut conn, &book("B000000001", "100% Done", Some(3_000)), now).await.unwrap();
        insert_book(&mut conn, &book("B000000002", "Second", Some(3_000)), now).await.unwrap();
        insert_book(&mut conn, &book("B000000004", "Undated", None), now).await.unwrap();
        drop(conn);
        db
    }

    #[tokio::test]
    async fn test_list_order() {
        let db = seeded().await;
        let books = list_books(db.pool(), 10, 0).await.unwrap();
        let asins: Vec<_> = books.iter().map(|b| b.asin.as_str()).collect();
        assert_eq!(asins, vec!["B000000001", "B000000002", "B000000003", "B000000004"]);

        let tail = list_books(db.pool(), 10, 3).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(count_books(db.pool()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_search_escapes_wildcards() {
        let db = seeded().await;

        let hits = search_books(db.pool(), "100%").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "100% Done");

        assert!(search_books(db.pool(), "_").await.unwrap().is_empty());
        assert_eq!(search_books(db.pool(), "some author").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let db = seeded().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let changed = book("B000000003", "Third, Revised", Some(1_000));
        update_book(&mut conn, &changed, Utc::now()).await.unwrap();
        let versions = list_versions(&mut conn, "us").await.unwrap();
        assert_eq!(versions["B000000003"], changed.version);

        assert!(delete_book(&mut conn, "B000000003", "us").await.unwrap());
        assert!(!delete_book(&mut conn, "B000000003", "us").await.unwrap());
        drop(conn);

        assert!(find_book_by_asin(db.pool(), "B000000003").await.unwrap().is_none());
    }
}
