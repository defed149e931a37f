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


//! AAX file decryption (legacy Audible format)
//!
//! # AAX Format Details
//! - Container: MP4 (M4B) with brand `aax `
//! - Audio codec: AAC, sample entry renamed to `aavd`
//! - Key material: `adrm` box inside the `aavd` sample entry
//! - Encryption: AES-128 CBC per sample, whole 16-byte blocks only
//!
//! # Key Derivation
//! Matches FFmpeg's `mov_read_adrm`:
//!
//! ```text
//! ik       = SHA1(FIXED_KEY || activation)
//! iv       = SHA1(FIXED_KEY || ik || activation)
//! checksum = SHA1(ik[..16] || iv[..16])            compared with adrm checksum
//! out      = AES-128-CBC-decrypt(ik[..16], iv[..16], adrm.blob[..48])
//! check      activation[i] == out[3 - i]
//! file_key = out[8..24]
//! file_iv  = SHA1(out[26..42] || file_key || FIXED_KEY)[..16]
//! ```
//!
//! adrm payload layout (after the 8-byte box header): 8 unknown bytes,
//! 56-byte blob, 4 unknown bytes, 20-byte checksum.
//!
//! # Decryption Process
//! 1. Parse the box tree and resolve every sample of the `aavd` tracks
//! 2. Derive the file key from the activation bytes
//! 3. Copy the input to `<output>.part`
//! 4. Decrypt each sample in place with a fresh CBC state (trailing
//!    partial block stays as is)
//! 5. Rename `aavd` to `mp4a`, `adrm` to `free` and brand `aax ` to `M4B `
//! 6. Rename `.part` to the output path
//!
//! Nothing is transcoded; all other bytes are copied verbatim.

use crate::crypto::activation::ActivationBytes;
use crate::crypto::mp4::{self, BoxHeader, SampleRange};
use crate::error::{LibriSyncError, Result};
use crate::file::paths::{discard_partial, ensure_parent_dir, part_path};
use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Audible's fixed key, shared by every AAX file
pub const AUDIBLE_FIXED_KEY: [u8; 16] = [
    0x77, 0x21, 0x4d, 0x4b, 0x19, 0x6a, 0x87, 0xcd, 0x52, 0x00, 0x45, 0xfd, 0x20, 0xa5, 0x1d, 0x67,
];

const DRM_BLOB_LEN: usize = 56;
const DRM_DECRYPTED_LEN: usize = 48;
const ADRM_PAYLOAD_LEN: usize = 8 + DRM_BLOB_LEN + 4 + 20;

/// moov boxes larger than this are rejected instead of loaded
const MAX_MOOV_LEN: u64 = 256 * 1024 * 1024;

// ============================================================================
// Key derivation
// ============================================================================

/// Encrypted key blob and checksum from the `adrm` box
#[derive(Clone)]
pub struct DrmBlob {
    pub blob: [u8; DRM_BLOB_LEN],
    pub checksum: [u8; 20],
}

impl DrmBlob {
    /// Parse the adrm payload (box body without header)
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < ADRM_PAYLOAD_LEN {
            return Err(LibriSyncError::format(format!(
                "adrm box too short ({} bytes)",
                payload.len()
            )));
        }

        let mut blob = [0u8; DRM_BLOB_LEN];
        blob.copy_from_slice(&payload[8..8 + DRM_BLOB_LEN]);
        let mut checksum = [0u8; 20];
        let at = 8 + DRM_BLOB_LEN + 4;
        checksum.copy_from_slice(&payload[at..at + 20]);

        Ok(Self { blob, checksum })
    }
}

impl fmt::Debug for DrmBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmBlob")
            .field("checksum", &hex::encode(self.checksum))
            .finish()
    }
}

/// Key and IV derived from the activation bytes alone
struct IntermediateKey {
    key: [u8; 20],
    iv: [u8; 20],
}

impl IntermediateKey {
    fn derive(activation: &ActivationBytes) -> Self {
        let key: [u8; 20] = Sha1::new()
            .chain_update(AUDIBLE_FIXED_KEY)
            .chain_update(activation.as_bytes())
            .finalize()
            .into();
        let iv: [u8; 20] = Sha1::new()
            .chain_update(AUDIBLE_FIXED_KEY)
            .chain_update(key)
            .chain_update(activation.as_bytes())
            .finalize()
            .into();
        Self { key, iv }
    }

    fn checksum(&self) -> [u8; 20] {
        Sha1::new()
            .chain_update(&self.key[..16])
            .chain_update(&self.iv[..16])
            .finalize()
            .into()
    }

    fn decrypt_blob(&self, drm: &DrmBlob) -> Result<[u8; DRM_DECRYPTED_LEN]> {
        let mut out = [0u8; DRM_DECRYPTED_LEN];
        out.copy_from_slice(&drm.blob[..DRM_DECRYPTED_LEN]);
        Aes128CbcDec::new_from_slices(&self.key[..16], &self.iv[..16])
            .map_err(|_| LibriSyncError::format("invalid intermediate key length"))?
            .decrypt_padded_mut::<NoPadding>(&mut out)
            .map_err(|_| LibriSyncError::format("drm blob is not block aligned"))?;
        Ok(out)
    }
}

fn activation_in_blob(activation: &ActivationBytes, decrypted: &[u8]) -> bool {
    let bytes = activation.as_bytes();
    (0..4).all(|i| bytes[i] == decrypted[3 - i])
}

/// Per-file AES key and IV
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey {
    key: [u8; 16],
    iv: [u8; 16],
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(********)")
    }
}

impl FileKey {
    fn from_decrypted_blob(decrypted: &[u8; DRM_DECRYPTED_LEN]) -> Self {
        let mut key = [0u8; 16];
        key.copy_from_slice(&decrypted[8..24]);

        let digest = Sha1::new()
            .chain_update(&decrypted[26..42])
            .chain_update(key)
            .chain_update(AUDIBLE_FIXED_KEY)
            .finalize();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);

        Self { key, iv }
    }

    /// Decrypt one sample in place. Trailing bytes past the last whole block stay plain.
    pub fn decrypt_sample(&self, sample: &mut [u8]) -> Result<()> {
        let whole = sample.len() & !0xF;
        if whole == 0 {
            return Ok(());
        }
        Aes128CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|_| LibriSyncError::format("invalid file key length"))?
            .decrypt_padded_mut::<NoPadding>(&mut sample[..whole])
            .map_err(|_| LibriSyncError::format("sample is not block aligned"))?;
        Ok(())
    }
}

/// Derive the file key.
///
/// With `verify` set, a checksum or key-check mismatch is a `FormatError`.
/// Without it, wrong activation bytes silently yield a wrong key.
pub fn derive_file_key(activation: &ActivationBytes, drm: &DrmBlob, verify: bool) -> Result<FileKey> {
    let intermediate = IntermediateKey::derive(activation);

    if verify && intermediate.checksum() != drm.checksum {
        return Err(LibriSyncError::format(
            "activation bytes do not match this file (checksum mismatch)",
        ));
    }

    let decrypted = intermediate.decrypt_blob(drm)?;
    if verify && !activation_in_blob(activation, &decrypted) {
        return Err(LibriSyncError::format(
            "activation bytes do not match this file (key check failed)",
        ));
    }

    Ok(FileKey::from_decrypted_blob(&decrypted))
}

/// Checksum and key check without producing a key
pub fn activation_matches(activation: &ActivationBytes, drm: &DrmBlob) -> Result<bool> {
    let intermediate = IntermediateKey::derive(activation);
    if intermediate.checksum() != drm.checksum {
        return Ok(false);
    }
    let decrypted = intermediate.decrypt_blob(drm)?;
    Ok(activation_in_blob(activation, &decrypted))
}

// ============================================================================
// Container layout
// ============================================================================

/// Tags and structure read from `moov`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AaxMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub chapter_count: u32,
    pub duration_secs: f64,
    pub has_cover: bool,
}

/// Result of a successful decryption
#[derive(Debug, Clone, Serialize)]
pub struct DecryptOutcome {
    pub output_path: String,
    pub file_size: u64,
    pub metadata: AaxMetadata,
}

#[derive(Debug, Clone, Copy)]
struct Patch {
    offset: u64,
    value: [u8; 4],
}

/// Everything needed to decrypt one file
#[derive(Debug)]
struct AaxLayout {
    drm: DrmBlob,
    samples: Vec<SampleRange>,
    patches: Vec<Patch>,
    metadata: AaxMetadata,
}

impl AaxLayout {
    fn read(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let top = mp4::read_top_level(&mut file, file_len)?;

        let ftyp = top
            .iter()
            .find(|b| b.is(b"ftyp"))
            .copied()
            .ok_or_else(|| LibriSyncError::format("not an MP4 container (no ftyp box)"))?;
        let moov = top
            .iter()
            .find(|b| b.is(b"moov"))
            .copied()
            .ok_or_else(|| LibriSyncError::format("no moov box"))?;
        if moov.size > MAX_MOOV_LEN {
            return Err(LibriSyncError::format("moov box too large"));
        }

        let mut patches = brand_patches(&mut file, &ftyp)?;

        let mut buf = vec![0u8; moov.size as usize];
        file.seek(SeekFrom::Start(moov.offset))?;
        file.read_exact(&mut buf)?;
        let root = mp4::parse_header(&buf, 0, buf.len())?;
        let tracks = mp4::tracks(&buf, &root)?;

        let mut drm = None;
        let mut samples = Vec::new();

        for track in tracks.iter().filter(|t| t.has_format(b"aavd")) {
            for entry in track.entries.iter().filter(|e| &e.format == b"aavd") {
                patches.push(Patch {
                    offset: moov.offset + entry.header.offset + 4,
                    value: *b"mp4a",
                });

                if let Some(adrm) = entry.child(b"adrm") {
                    if drm.is_none() {
                        let (start, end) = adrm.body_range();
                        drm = Some(DrmBlob::parse(&buf[start..end])?);
                    }
                    patches.push(Patch {
                        offset: moov.offset + adrm.offset + 4,
                        value: *b"free",
                    });
                }
            }

            for range in track.samples.sample_ranges()? {
                if range.offset + range.size as u64 > file_len {
                    return Err(LibriSyncError::format("sample data extends past end of file"));
                }
                samples.push(range);
            }
        }

        let drm = drm.ok_or_else(|| LibriSyncError::format("no adrm box in an aavd track"))?;
        let metadata = read_metadata(&buf, &root, &tracks)?;

        debug!(
            samples = samples.len(),
            patches = patches.len(),
            "Parsed AAX layout"
        );

        Ok(Self {
            drm,
            samples,
            patches,
            metadata,
        })
    }
}

/// Brand `aax ` becomes `M4B ` in major and compatible brands
fn brand_patches(file: &mut File, ftyp: &BoxHeader) -> Result<Vec<Patch>> {
    let len = (ftyp.size - ftyp.header_len) as usize;
    if len < 8 || len > 1024 {
        return Err(LibriSyncError::format("invalid ftyp box"));
    }
    let mut body = vec![0u8; len];
    file.seek(SeekFrom::Start(ftyp.body()))?;
    file.read_exact(&mut body)?;

    Ok(body
        .chunks_exact(4)
        .enumerate()
        // index 1 is the minor version
        .filter(|(i, brand)| *i != 1 && *brand == b"aax ")
        .map(|(i, _)| Patch {
            offset: ftyp.body() + (i * 4) as u64,
            value: *b"M4B ",
        })
        .collect())
}

fn read_metadata(buf: &[u8], moov: &BoxHeader, tracks: &[mp4::Track]) -> Result<AaxMetadata> {
    let mut metadata = AaxMetadata::default();

    if let Some(mvhd) = mp4::find_child(buf, moov, b"mvhd")? {
        metadata.duration_secs = mp4::movie_duration(buf, &mvhd)?;
    }

    metadata.chapter_count = tracks
        .iter()
        .find(|t| &t.handler == b"text")
        .map(|t| t.samples.sample_count() as u32)
        .unwrap_or(0);

    let meta = match mp4::find_path(buf, moov, &[b"udta", b"meta"])? {
        Some(meta) => meta,
        None => return Ok(metadata),
    };
    let ilst = match mp4::meta_children(buf, &meta)?.into_iter().find(|b| b.is(b"ilst")) {
        Some(ilst) => ilst,
        None => return Ok(metadata),
    };

    let (start, end) = ilst.body_range();
    for item in mp4::children(buf, start, end)? {
        match &item.kind {
            b"\xa9nam" => metadata.title = mp4::ilst_text(buf, &item)?,
            b"\xa9ART" => metadata.author = mp4::ilst_text(buf, &item)?,
            b"covr" => metadata.has_cover = true,
            _ => {}
        }
    }

    Ok(metadata)
}

// ============================================================================
// Decrypter
// ============================================================================

/// Native AAX decrypter
///
/// # Example
/// ```no_run
/// use librisync_core::crypto::aax::AaxDecrypter;
/// use librisync_core::crypto::activation::ActivationBytes;
/// use std::path::Path;
///
/// # async fn example() -> librisync_core::error::Result<()> {
/// let decrypter = AaxDecrypter::new(ActivationBytes::from_hex("1CEB00DA")?);
/// let outcome = decrypter
///     .decrypt_file(Path::new("input.aax"), Path::new("output.m4b"))
///     .await?;
/// println!("{} bytes", outcome.file_size);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AaxDecrypter {
    activation_bytes: ActivationBytes,
    verify_checksum: bool,
}

impl AaxDecrypter {
    pub fn new(activation_bytes: ActivationBytes) -> Self {
        Self {
            activation_bytes,
            verify_checksum: true,
        }
    }

    /// Skip the checksum and key check; wrong bytes then produce garbage audio
    pub fn with_verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub async fn decrypt_file(&self, input: &Path, output: &Path) -> Result<DecryptOutcome> {
        self.decrypt_file_with_cancel(input, output, &CancellationToken::new())
            .await
    }

    /// Decrypt on the blocking pool, checking `cancel` between samples.
    ///
    /// On any failure the `.part` file is removed and `output` is untouched.
    pub async fn decrypt_file_with_cancel(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<DecryptOutcome> {
        let this = self.clone();
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || this.decrypt_blocking(&input, &output, &cancel))
            .await
            .map_err(|e| LibriSyncError::InvalidState(format!("decryption task failed: {}", e)))?
    }

    /// Check the activation bytes against a file without writing anything
    pub async fn verify(&self, input: &Path) -> Result<bool> {
        let activation = self.activation_bytes;
        let input = input.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let layout = AaxLayout::read(&input)?;
            activation_matches(&activation, &layout.drm)
        })
        .await
        .map_err(|e| LibriSyncError::InvalidState(format!("verification task failed: {}", e)))?
    }

    fn decrypt_blocking(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<DecryptOutcome> {
        let part = part_path(output);

        let result = self
            .decrypt_into(input, &part, cancel)
            .and_then(|metadata| {
                fs::rename(&part, output)?;
                Ok(metadata)
            });

        match result {
            Ok(metadata) => {
                let file_size = fs::metadata(output)?.len();
                info!(
                    output = %output.display(),
                    file_size,
                    chapters = metadata.chapter_count,
                    "Decrypted AAX file"
                );
                Ok(DecryptOutcome {
                    output_path: output.to_string_lossy().into_owned(),
                    file_size,
                    metadata,
                })
            }
            Err(e) => {
                discard_partial(&part);
                Err(e)
            }
        }
    }

    fn decrypt_into(&self, input: &Path, part: &Path, cancel: &CancellationToken) -> Result<AaxMetadata> {
        let layout = AaxLayout::read(input)?;
        let key = derive_file_key(&self.activation_bytes, &layout.drm, self.verify_checksum)?;

        if cancel.is_cancelled() {
            return Err(LibriSyncError::Cancelled);
        }

        ensure_parent_dir(part)?;
        fs::copy(input, part)?;
        let mut file = OpenOptions::new().read(true).write(true).open(part)?;

        let mut sample = Vec::new();
        for range in &layout.samples {
            if cancel.is_cancelled() {
                return Err(LibriSyncError::Cancelled);
            }
            sample.resize(range.size as usize, 0);
            file.seek(SeekFrom::Start(range.offset))?;
            file.read_exact(&mut sample)?;
            key.decrypt_sample(&mut sample)?;
            file.seek(SeekFrom::Start(range.offset))?;
            file.write_all(&sample)?;
        }

        for patch in &layout.patches {
            file.seek(SeekFrom::Start(patch.offset))?;
            file.write_all(&patch.value)?;
        }
        file.sync_all()?;

        Ok(layout.metadata)
    }
}

/// Read container tags without decrypting
pub async fn read_aax_metadata(path: &Path) -> Result<AaxMetadata> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || AaxLayout::read(&path).map(|l| l.metadata))
        .await
        .map_err(|e| LibriSyncError::InvalidState(format!("metadata task failed: {}", e)))?
}

/// Check activation bytes against a file
pub async fn verify_activation_bytes(file: &Path, activation_bytes: &ActivationBytes) -> Result<bool> {
    AaxDecrypter::new(*activation_bytes).verify(file).await
}

/// True if the file starts with an `ftyp` box whose major brand is `aax `
pub async fn is_aax_file(path: &Path) -> Result<bool> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut head = [0u8; 12];
    match file.read_exact(&mut head).await {
        Ok(_) => Ok(&head[4..8] == b"ftyp" && &head[8..12] == b"aax "),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
