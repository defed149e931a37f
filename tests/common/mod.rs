//! Shared fixtures for the integration tests
//!
//! Builds mock-server configs, authenticated accounts, library JSON and a
//! small synthetic AAX file encrypted with known activation bytes.

#![allow(dead_code)]

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use librisync_core::api::auth::{Account, TokenSet};
use librisync_core::api::device::DeviceSerial;
use librisync_core::config::EndpointOverrides;
use librisync_core::crypto::aax::AUDIBLE_FIXED_KEY;
use librisync_core::CoreConfig;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::Duration;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

pub const SERIAL: &str = "A1B2C3D4E5F6A1B2C3D4E5F6A1B2C3D4";
pub const ACCESS_TOKEN: &str = "Atna|test-access-token";
pub const REFRESH_TOKEN: &str = "Atnr|test-refresh-token";

pub fn init_logging() {
    librisync_core::logging::init("librisync_core=debug");
}

/// Config with every host pointed at the mock server and fast retries
pub fn test_config(uri: &str) -> CoreConfig {
    CoreConfig::builder()
        .endpoints(EndpointOverrides::all(uri))
        .retry(3, Duration::from_millis(10))
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

pub fn account_expiring_in(secs: i64) -> Account {
    let tokens = TokenSet::from_expires_in(
        ACCESS_TOKEN.to_string(),
        REFRESH_TOKEN.to_string(),
        "Bearer".to_string(),
        secs,
        DeviceSerial::parse(SERIAL).unwrap(),
    );
    Account::new("us", tokens)
}

pub fn account() -> Account {
    account_expiring_in(3600)
}

// ============================================================================
// Library JSON
// ============================================================================

pub fn library_item(asin: &str, title: &str, author: &str, purchased: &str) -> Value {
    json!({
        "asin": asin,
        "title": title,
        "authors": [{"asin": null, "name": author}],
        "narrators": [{"name": "Adjoa Andoh"}],
        "runtime_length_min": 720,
        "purchase_date": purchased,
        "product_images": {"500": format!("https://m.media-amazon.com/images/I/{}.jpg", asin)}
    })
}

pub fn library_page(items: Vec<Value>, total: usize) -> Value {
    json!({ "items": items, "total_results": total })
}

// ============================================================================
// Synthetic AAX
// ============================================================================

fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn cbc_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) {
    let len = data.len();
    Aes128CbcEnc::new_from_slices(key, iv)
        .unwrap()
        .encrypt_padded_mut::<NoPadding>(data, len)
        .unwrap();
}

/// AAX file bytes plus what a correct decryption must produce
pub struct AaxFixture {
    pub bytes: Vec<u8>,
    /// (offset, plaintext) of every audio sample
    pub samples: Vec<(u64, Vec<u8>)>,
    pub title: String,
    pub author: String,
    pub chapters: u32,
    pub duration_secs: f64,
}

impl AaxFixture {
    /// File encrypted for `activation` with a fixed file key
    pub fn new(activation: [u8; 4]) -> Self {
        let file_key: [u8; 16] = core::array::from_fn(|i| i as u8);
        let iv_seed: [u8; 16] = core::array::from_fn(|i| 0x64 + i as u8);
        Self::build(activation, file_key, iv_seed)
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, &self.bytes).unwrap();
        path
    }

    fn build(activation: [u8; 4], file_key: [u8; 16], iv_seed: [u8; 16]) -> Self {
        let title = "The Fifth Season".to_string();
        let author = "N. K. Jemisin".to_string();
        let chapters = 3u32;

        // Key material in the adrm box
        let ik = sha1(&[&AUDIBLE_FIXED_KEY, &activation]);
        let iiv = sha1(&[&AUDIBLE_FIXED_KEY, &ik, &activation]);
        let checksum = sha1(&[&ik[..16], &iiv[..16]]);

        let mut plain = Vec::with_capacity(48);
        plain.extend(activation.iter().rev());
        plain.extend([0u8; 4]);
        plain.extend(file_key);
        plain.extend([0u8; 2]);
        plain.extend(iv_seed);
        plain.extend([0u8; 6]);
        cbc_encrypt(&ik[..16], &iiv[..16], &mut plain);

        let mut adrm = vec![0u8; 8];
        adrm.extend(&plain);
        adrm.extend([0u8; 8]);
        adrm.extend([0u8; 4]);
        adrm.extend(checksum);

        let file_iv = sha1(&[&iv_seed, &file_key, &AUDIBLE_FIXED_KEY]);

        // Odd sizes leave a plain tail; the 12-byte sample is never encrypted
        let plaintext: Vec<Vec<u8>> = [37usize, 64, 100, 12, 48]
            .iter()
            .enumerate()
            .map(|(n, &len)| (0..len).map(|i| (i * 7 + n * 31) as u8).collect())
            .collect();
        let encrypted: Vec<Vec<u8>> = plaintext
            .iter()
            .map(|sample| {
                let mut out = sample.clone();
                let whole = out.len() & !0xF;
                if whole > 0 {
                    cbc_encrypt(&file_key, &file_iv[..16], &mut out[..whole]);
                }
                out
            })
            .collect();
        let chapter_data = vec![0u8; 4 * chapters as usize];

        let ftyp = boxed(b"ftyp", &concat(&[b"aax ".to_vec(), vec![0, 0, 2, 0], b"aax ".to_vec(), b"M4A ".to_vec()]));

        let sizes: Vec<u32> = encrypted.iter().map(|s| s.len() as u32).collect();
        let audio_len: usize = encrypted.iter().map(Vec::len).sum();
        let duration_secs = 7200.0;

        let moov_with = |audio_offset: u32| {
            let text_offset = audio_offset + audio_len as u32;
            build_moov(&adrm, &sizes, audio_offset, chapters, text_offset, &title, &author, duration_secs)
        };

        let moov_len = moov_with(0).len();
        let audio_offset = (ftyp.len() + moov_len + 8) as u32;
        let moov = moov_with(audio_offset);

        let mut mdat_body = encrypted.concat();
        mdat_body.extend(&chapter_data);
        let mdat = boxed(b"mdat", &mdat_body);

        let mut samples = Vec::new();
        let mut offset = audio_offset as u64;
        for sample in plaintext {
            let len = sample.len() as u64;
            samples.push((offset, sample));
            offset += len;
        }

        Self {
            bytes: concat(&[ftyp, moov, mdat]),
            samples,
            title,
            author,
            chapters,
            duration_secs,
        }
    }
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    boxed(b"hdlr", &concat(&[vec![0u8; 8], handler.to_vec(), vec![0u8; 13]]))
}

fn sample_table(entry: Vec<u8>, sizes: &[u32], uniform: Option<(u32, u32)>, chunk_offset: u32) -> Vec<u8> {
    let stsd = boxed(b"stsd", &concat(&[vec![0u8; 4], 1u32.to_be_bytes().to_vec(), entry]));

    let (stsz, count) = match uniform {
        Some((size, count)) => (
            boxed(b"stsz", &concat(&[vec![0u8; 4], size.to_be_bytes().to_vec(), count.to_be_bytes().to_vec()])),
            count,
        ),
        None => {
            let mut body = vec![0u8; 8];
            body.extend((sizes.len() as u32).to_be_bytes());
            for size in sizes {
                body.extend(size.to_be_bytes());
            }
            (boxed(b"stsz", &body), sizes.len() as u32)
        }
    };

    // Every sample in a single chunk
    let stsc = boxed(
        b"stsc",
        &concat(&[vec![0u8; 4], 1u32.to_be_bytes().to_vec(), 1u32.to_be_bytes().to_vec(), count.to_be_bytes().to_vec(), 1u32.to_be_bytes().to_vec()]),
    );
    let stco = boxed(
        b"stco",
        &concat(&[vec![0u8; 4], 1u32.to_be_bytes().to_vec(), chunk_offset.to_be_bytes().to_vec()]),
    );

    boxed(b"stbl", &concat(&[stsd, stsz, stsc, stco]))
}

fn trak(handler: &[u8; 4], stbl: Vec<u8>) -> Vec<u8> {
    let minf = boxed(b"minf", &stbl);
    let mdia = boxed(b"mdia", &concat(&[hdlr(handler), minf]));
    boxed(b"trak", &mdia)
}

fn ilst_item(kind: &[u8; 4], data_type: u32, payload: &[u8]) -> Vec<u8> {
    let data = boxed(b"data", &concat(&[data_type.to_be_bytes().to_vec(), vec![0u8; 4], payload.to_vec()]));
    boxed(kind, &data)
}

#[allow(clippy::too_many_arguments)]
fn build_moov(
    adrm: &[u8],
    sizes: &[u32],
    audio_offset: u32,
    chapters: u32,
    text_offset: u32,
    title: &str,
    author: &str,
    duration_secs: f64,
) -> Vec<u8> {
    let timescale = 1000u32;
    let mut mvhd = vec![0u8; 12];
    mvhd.extend(timescale.to_be_bytes());
    mvhd.extend(((duration_secs * timescale as f64) as u32).to_be_bytes());
    mvhd.extend([0u8; 80]);
    let mvhd = boxed(b"mvhd", &mvhd);

    // Sound description v0: reserved, data ref, version, revision, vendor,
    // channels, sample size, compression id, packet size, sample rate
    let mut entry = vec![0u8; 6];
    entry.extend(1u16.to_be_bytes());
    entry.extend([0u8; 8]);
    entry.extend(2u16.to_be_bytes());
    entry.extend(16u16.to_be_bytes());
    entry.extend([0u8; 4]);
    entry.extend((44_100u32 << 16).to_be_bytes());
    entry.extend(boxed(b"adrm", adrm));
    let aavd = boxed(b"aavd", &entry);

    let audio = trak(b"soun", sample_table(aavd, sizes, None, audio_offset));
    let text_entry = boxed(b"text", &[0u8; 8]);
    let text = trak(b"text", sample_table(text_entry, &[], Some((4, chapters)), text_offset));

    let ilst = boxed(
        b"ilst",
        &concat(&[
            ilst_item(b"\xa9nam", 1, title.as_bytes()),
            ilst_item(b"\xa9ART", 1, author.as_bytes()),
            ilst_item(b"covr", 13, &[0xff, 0xd8, 0xff, 0xe0]),
        ]),
    );
    let meta = boxed(b"meta", &concat(&[vec![0u8; 4], hdlr(b"mdir"), ilst]));
    let udta = boxed(b"udta", &meta);

    boxed(b"moov", &concat(&[mvhd, audio, text, udta]))
}
