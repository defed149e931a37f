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


//! Output path handling
//!
//! Long-running writers (downloads, decryption) write to `<output>.part` and
//! rename on success, so a file at the final path is always complete.

use crate::error::{LibriSyncError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const PARTIAL_SUFFIX: &str = ".part";

/// `<output>.part`, keeping the full original file name
pub fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Create the parent directory of `path` if it is missing
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(LibriSyncError::invalid_input("output path is empty"));
    }

    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) if !parent.exists() => {
            std::fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Remove a partial file; a missing file is not an error
pub fn discard_partial(part: &Path) {
    if let Err(e) = std::fs::remove_file(part) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %part.display(), error = %e, "Could not remove partial output");
        }
    }
}
