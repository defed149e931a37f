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


//! Database migrations
//!
//! # Migration Strategy
//! sqlx's compile-time migrations need a database at build time, so
//! migrations are plain SQL applied at runtime and recorded in
//! `_migrations`.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};
use tracing::info;

/// Applied in order; ids never change once released
const MIGRATIONS: &[(i32, &str, &str)] = &[(1, "books", CREATE_BOOKS_TABLE)];

/// Apply every migration not yet recorded
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    for &(id, name, sql) in MIGRATIONS {
        run_migration(pool, id, name, sql).await?;
    }

    Ok(())
}

async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    Ok(())
}

/// Run a single migration if it hasn't been applied yet
///
/// Recording the id is the transaction's first statement, so it takes the
/// write lock before anything is read. A concurrent opener waits, then finds
/// the id present and applies nothing.
async fn run_migration(pool: &SqlitePool, id: i32, name: &str, sql: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query("INSERT OR IGNORE INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(&mut *tx)
        .await?;

    if claimed.rows_affected() == 0 {
        return Ok(());
    }

    (&mut *tx).execute(sql).await?;
    tx.commit().await?;

    info!(id, migration = name, "Applied migration");
    Ok(())
}

/// Catalog table. One row per title per marketplace.
const CREATE_BOOKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS books (
    asin TEXT NOT NULL,
    locale TEXT NOT NULL,
    title TEXT NOT NULL,
    subtitle TEXT,
    authors TEXT NOT NULL DEFAULT '',
    narrators TEXT NOT NULL DEFAULT '',
    runtime_minutes INTEGER,
    purchase_date TEXT,

    -- Largest cover image URL
    cover_url TEXT,

    -- SHA-256 over the synced fields; compared to detect remote changes
    version TEXT NOT NULL,
    synced_at TEXT NOT NULL,

    PRIMARY KEY (asin, locale)
);

CREATE INDEX IF NOT EXISTS idx_books_order ON books(purchase_date DESC, asin);
CREATE INDEX IF NOT EXISTS idx_books_locale ON books(locale);
"#;
