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


//! Streaming an asset to disk
//!
//! # Write Protocol
//! 1. Body chunks go through a `BufWriter` into `<output>.part`
//! 2. Flush every `DATA_FLUSH_SZ` bytes
//! 3. Compare the byte count with `Content-Length` when the server sent one
//! 4. Rename `.part` to the output path
//!
//! Cancellation, timeout and every error remove the `.part` file, so the
//! output path only ever holds a complete transfer.

use crate::error::{LibriSyncError, Result};
use crate::file::paths::{discard_partial, ensure_parent_dir, part_path};
use futures_util::StreamExt;
use reqwest::Client;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DOWNLOAD_BUFF_SZ: usize = 64 * 1024;
const DATA_FLUSH_SZ: u64 = 1024 * 1024;

/// Fixed point in time by which an operation must finish
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Run `fut`, failing with `Timeout` once the deadline passes
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => Err(LibriSyncError::Timeout(self.budget.as_secs().max(1))),
        }
    }
}

/// Stream `url` to `output`, returning the number of bytes written
pub async fn stream_to_file(
    client: &Client,
    url: &str,
    output: &Path,
    cancel: &CancellationToken,
    deadline: Option<Deadline>,
) -> Result<u64> {
    ensure_parent_dir(output)?;
    let part = part_path(output);

    let transfer = write_part(client, url, &part, cancel);
    let result = match deadline {
        Some(deadline) => deadline.run(transfer).await,
        None => transfer.await,
    };

    let result = match result {
        Ok(written) => tokio::fs::rename(&part, output)
            .await
            .map(|_| written)
            .map_err(LibriSyncError::from),
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        warn!(output = %output.display(), error = %e, "Download failed, discarding partial file");
        discard_partial(&part);
    }
    result
}

async fn write_part(
    client: &Client,
    url: &str,
    part: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(LibriSyncError::Cancelled),
        response = client.get(url).send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(LibriSyncError::from_status(status.as_u16(), "asset download"));
    }
    let expected = response.content_length();

    let file = File::create(part).await?;
    let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    let mut next_flush = DATA_FLUSH_SZ;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(LibriSyncError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;

        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if written >= next_flush {
            writer.flush().await?;
            next_flush = written + DATA_FLUSH_SZ;
            debug!(written, expected = ?expected, "Download progress");
        }
    }

    writer.flush().await?;
    writer.get_mut().sync_all().await?;

    if let Some(expected) = expected {
        if written != expected {
            return Err(LibriSyncError::network(
                format!("download incomplete: {}/{} bytes", written, expected),
                true,
            ));
        }
    }

    Ok(written)
}
