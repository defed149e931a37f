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


//! Minimal ISO BMFF (MP4) box reader
//!
//! Enough of the container to locate encrypted samples:
//!
//! ```text
//! ftyp
//! moov
//! ├── mvhd
//! ├── trak
//! │   └── mdia
//! │       ├── hdlr          handler type (soun, text, ...)
//! │       └── minf/stbl
//! │           ├── stsd      sample entries (aavd carries adrm)
//! │           ├── stsz      sample sizes
//! │           ├── stsc      samples per chunk
//! │           └── stco/co64 chunk offsets
//! └── udta/meta/ilst        iTunes-style tags
//! mdat
//! ```
//!
//! Box offsets returned by the slice-based functions are relative to the
//! buffer they were parsed from. Every length is bounds-checked; anything
//! that does not fit is a `FormatError`.

use crate::error::{LibriSyncError, Result};
use std::io::{Read, Seek, SeekFrom};

pub type FourCC = [u8; 4];

/// Refuse sample tables larger than this
const MAX_SAMPLES: u64 = 50_000_000;

/// Header of one box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCC,
    pub offset: u64,
    pub header_len: u64,
    pub size: u64,
}

impl BoxHeader {
    pub fn body(&self) -> u64 {
        self.offset + self.header_len
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn is(&self, kind: &FourCC) -> bool {
        &self.kind == kind
    }

    pub fn body_range(&self) -> (usize, usize) {
        (self.body() as usize, self.end() as usize)
    }
}

fn malformed(message: impl Into<String>) -> LibriSyncError {
    LibriSyncError::format(message)
}

pub fn fourcc_str(kind: &FourCC) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

// ============================================================================
// Bounds-checked big-endian reads
// ============================================================================

/// Sequential reader over `buf[pos..end]`
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8], start: usize, end: usize) -> Result<Self> {
        if start > end || end > buf.len() {
            return Err(malformed("box extends past its parent"));
        }
        Ok(Self { buf, pos: start, end })
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(malformed("unexpected end of box"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn fourcc(&mut self) -> Result<FourCC> {
        let mut kind = [0u8; 4];
        kind.copy_from_slice(self.bytes(4)?);
        Ok(kind)
    }
}

// ============================================================================
// Box traversal
// ============================================================================

/// Parse the box header at `pos`, which must end at or before `limit`
pub fn parse_header(buf: &[u8], pos: usize, limit: usize) -> Result<BoxHeader> {
    let mut cursor = Cursor::new(buf, pos, limit)?;
    let size32 = cursor.u32()?;
    let kind = cursor.fourcc()?;

    let (size, header_len) = match size32 {
        0 => ((limit - pos) as u64, 8),
        1 => (cursor.u64()?, 16),
        n => (n as u64, 8),
    };

    if size < header_len || size > (limit - pos) as u64 {
        return Err(malformed(format!(
            "box '{}' at offset {} has invalid size {}",
            fourcc_str(&kind),
            pos,
            size
        )));
    }

    Ok(BoxHeader {
        kind,
        offset: pos as u64,
        header_len,
        size,
    })
}

/// All boxes laid end to end in `buf[start..end]`
pub fn children(buf: &[u8], start: usize, end: usize) -> Result<Vec<BoxHeader>> {
    let mut boxes = Vec::new();
    let mut pos = start;
    while pos < end {
        // Some writers pad containers with a zero terminator
        if end - pos < 8 && buf[pos..end].iter().all(|&b| b == 0) {
            break;
        }
        let header = parse_header(buf, pos, end)?;
        pos = header.end() as usize;
        boxes.push(header);
    }
    Ok(boxes)
}

pub fn find_child(buf: &[u8], parent: &BoxHeader, kind: &FourCC) -> Result<Option<BoxHeader>> {
    let (start, end) = parent.body_range();
    Ok(children(buf, start, end)?.into_iter().find(|b| b.is(kind)))
}

pub fn find_path(buf: &[u8], parent: &BoxHeader, path: &[&FourCC]) -> Result<Option<BoxHeader>> {
    let mut current = *parent;
    for kind in path {
        match find_child(buf, &current, kind)? {
            Some(child) => current = child,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Walk the top level of a file without loading it
pub fn read_top_level<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Vec<BoxHeader>> {
    let mut boxes = Vec::new();
    let mut pos = 0u64;

    while pos < file_len {
        if file_len - pos < 8 {
            return Err(malformed("trailing bytes after last top-level box"));
        }

        reader.seek(SeekFrom::Start(pos))?;
        let mut head = [0u8; 8];
        reader.read_exact(&mut head)?;
        let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        let kind: FourCC = [head[4], head[5], head[6], head[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - pos, 8),
            1 => {
                if file_len - pos < 16 {
                    return Err(malformed("truncated large box header"));
                }
                let mut large = [0u8; 8];
                reader.read_exact(&mut large)?;
                (u64::from_be_bytes(large), 16)
            }
            n => (n as u64, 8),
        };

        if size < header_len {
            return Err(malformed(format!("box '{}' has invalid size {}", fourcc_str(&kind), size)));
        }
        if size > file_len - pos {
            return Err(malformed(format!(
                "box '{}' is truncated ({} of {} bytes present)",
                fourcc_str(&kind),
                file_len - pos,
                size
            )));
        }

        boxes.push(BoxHeader {
            kind,
            offset: pos,
            header_len,
            size,
        });
        pos += size;
    }

    Ok(boxes)
}

// ============================================================================
// Sample tables
// ============================================================================

/// Byte range of one sample in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRange {
    pub offset: u64,
    pub size: u32,
}

/// stsz + stsc + stco/co64 of one track
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    pub sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    /// (first_chunk, samples_per_chunk), 1-based chunks
    pub sample_to_chunk: Vec<(u32, u32)>,
}

fn checked_count(cursor: &Cursor<'_>, count: u32, entry_len: usize) -> Result<usize> {
    let count = count as usize;
    if count.saturating_mul(entry_len) > cursor.remaining() {
        return Err(malformed("table entry count exceeds box size"));
    }
    Ok(count)
}

impl SampleTable {
    pub fn parse(buf: &[u8], stbl: &BoxHeader) -> Result<Self> {
        let mut table = SampleTable::default();

        let stsz = find_child(buf, stbl, b"stsz")?.ok_or_else(|| malformed("stbl without stsz"))?;
        let (start, end) = stsz.body_range();
        let mut c = Cursor::new(buf, start, end)?;
        c.skip(4)?;
        let uniform = c.u32()?;
        let count = c.u32()?;
        if count as u64 > MAX_SAMPLES {
            return Err(malformed("sample count out of range"));
        }
        table.sizes = if uniform != 0 {
            vec![uniform; count as usize]
        } else {
            let n = checked_count(&c, count, 4)?;
            (0..n).map(|_| c.u32()).collect::<Result<_>>()?
        };

        let stsc = find_child(buf, stbl, b"stsc")?.ok_or_else(|| malformed("stbl without stsc"))?;
        let (start, end) = stsc.body_range();
        let mut c = Cursor::new(buf, start, end)?;
        c.skip(4)?;
        let count = c.u32()?;
        let n = checked_count(&c, count, 12)?;
        for _ in 0..n {
            let first_chunk = c.u32()?;
            let per_chunk = c.u32()?;
            c.skip(4)?;
            if first_chunk == 0 {
                return Err(malformed("stsc chunk numbers start at 1"));
            }
            table.sample_to_chunk.push((first_chunk, per_chunk));
        }

        if let Some(stco) = find_child(buf, stbl, b"stco")? {
            let (start, end) = stco.body_range();
            let mut c = Cursor::new(buf, start, end)?;
            c.skip(4)?;
            let count = c.u32()?;
            let n = checked_count(&c, count, 4)?;
            table.chunk_offsets = (0..n).map(|_| c.u32().map(u64::from)).collect::<Result<_>>()?;
        } else if let Some(co64) = find_child(buf, stbl, b"co64")? {
            let (start, end) = co64.body_range();
            let mut c = Cursor::new(buf, start, end)?;
            c.skip(4)?;
            let count = c.u32()?;
            let n = checked_count(&c, count, 8)?;
            table.chunk_offsets = (0..n).map(|_| c.u64()).collect::<Result<_>>()?;
        } else if !table.sizes.is_empty() {
            return Err(malformed("stbl without chunk offsets"));
        }

        Ok(table)
    }

    pub fn sample_count(&self) -> usize {
        self.sizes.len()
    }

    /// Resolve every sample to its byte range
    pub fn sample_ranges(&self) -> Result<Vec<SampleRange>> {
        let mut ranges = Vec::with_capacity(self.sizes.len());
        let mut sample = 0usize;

        for (index, &chunk_offset) in self.chunk_offsets.iter().enumerate() {
            if sample == self.sizes.len() {
                break;
            }
            let chunk = index as u32 + 1;
            let entry = self.sample_to_chunk.partition_point(|&(first, _)| first <= chunk);
            if entry == 0 {
                return Err(malformed("chunk not covered by stsc"));
            }
            let per_chunk = self.sample_to_chunk[entry - 1].1;

            let mut offset = chunk_offset;
            for _ in 0..per_chunk {
                if sample == self.sizes.len() {
                    break;
                }
                let size = self.sizes[sample];
                ranges.push(SampleRange { offset, size });
                offset = offset
                    .checked_add(size as u64)
                    .ok_or_else(|| malformed("sample offset overflow"))?;
                sample += 1;
            }
        }

        if sample != self.sizes.len() {
            return Err(malformed(format!(
                "chunk tables cover {} of {} samples",
                sample,
                self.sizes.len()
            )));
        }
        Ok(ranges)
    }
}

// ============================================================================
// Tracks
// ============================================================================

/// One entry of stsd. `children` is only filled for audio entries.
#[derive(Debug, Clone)]
pub struct SampleEntry {
    pub format: FourCC,
    pub header: BoxHeader,
    pub children: Vec<BoxHeader>,
}

impl SampleEntry {
    pub fn child(&self, kind: &FourCC) -> Option<&BoxHeader> {
        self.children.iter().find(|b| b.is(kind))
    }
}

/// Audio formats whose sample entries carry child boxes
const AUDIO_ENTRY_FORMATS: [&FourCC; 2] = [b"aavd", b"mp4a"];

pub fn sample_entries(buf: &[u8], stsd: &BoxHeader) -> Result<Vec<SampleEntry>> {
    let (start, end) = stsd.body_range();
    let mut c = Cursor::new(buf, start, end)?;
    c.skip(4)?;
    let count = c.u32()?;

    let mut entries = Vec::new();
    let mut pos = c.position();
    for _ in 0..count {
        let header = parse_header(buf, pos, end)?;
        pos = header.end() as usize;

        let children = if AUDIO_ENTRY_FORMATS.contains(&&header.kind) {
            // 6 reserved + data reference index, then the sound description
            let mut e = Cursor::new(buf, header.body() as usize, header.end() as usize)?;
            e.skip(8)?;
            let version = e.u16()?;
            let extra = match version {
                0 => 0,
                1 => 16,
                2 => 36,
                v => return Err(malformed(format!("unknown sound description version {}", v))),
            };
            let first_child = header.body() as usize + 28 + extra;
            if first_child > header.end() as usize {
                return Err(malformed("audio sample entry too short"));
            }
            children(buf, first_child, header.end() as usize)?
        } else {
            Vec::new()
        };

        entries.push(SampleEntry {
            format: header.kind,
            header,
            children,
        });
    }

    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct Track {
    pub handler: FourCC,
    pub entries: Vec<SampleEntry>,
    pub samples: SampleTable,
}

impl Track {
    pub fn has_format(&self, format: &FourCC) -> bool {
        self.entries.iter().any(|e| &e.format == format)
    }
}

pub fn tracks(buf: &[u8], moov: &BoxHeader) -> Result<Vec<Track>> {
    let (start, end) = moov.body_range();
    let mut tracks = Vec::new();

    for trak in children(buf, start, end)?.iter().filter(|b| b.is(b"trak")) {
        let mdia = find_child(buf, trak, b"mdia")?.ok_or_else(|| malformed("trak without mdia"))?;

        let handler = match find_child(buf, &mdia, b"hdlr")? {
            Some(hdlr) => {
                let (s, e) = hdlr.body_range();
                let mut c = Cursor::new(buf, s, e)?;
                c.skip(8)?;
                c.fourcc()?
            }
            None => *b"\0\0\0\0",
        };

        let stbl = find_path(buf, &mdia, &[b"minf", b"stbl"])?
            .ok_or_else(|| malformed("trak without sample table"))?;
        let stsd = find_child(buf, &stbl, b"stsd")?.ok_or_else(|| malformed("stbl without stsd"))?;

        tracks.push(Track {
            handler,
            entries: sample_entries(buf, &stsd)?,
            samples: SampleTable::parse(buf, &stbl)?,
        });
    }

    Ok(tracks)
}

// ============================================================================
// Metadata
// ============================================================================

/// Children of a `meta` box. Handles both the full-box and QuickTime layouts.
pub fn meta_children(buf: &[u8], meta: &BoxHeader) -> Result<Vec<BoxHeader>> {
    let (start, end) = meta.body_range();
    let is_full_box = end - start >= 4 && buf[start..start + 4] == [0, 0, 0, 0];
    let first = if is_full_box { start + 4 } else { start };
    children(buf, first, end)
}

/// Text of an ilst item (`©nam`, `©ART`, ...) from its `data` child
pub fn ilst_text(buf: &[u8], item: &BoxHeader) -> Result<Option<String>> {
    let data = match find_child(buf, item, b"data")? {
        Some(data) => data,
        None => return Ok(None),
    };
    let (start, end) = data.body_range();
    if end - start < 8 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf[start + 8..end]).trim().to_string();
    Ok(Some(text).filter(|t| !t.is_empty()))
}

/// Duration in seconds from mvhd
pub fn movie_duration(buf: &[u8], mvhd: &BoxHeader) -> Result<f64> {
    let (start, end) = mvhd.body_range();
    let mut c = Cursor::new(buf, start, end)?;
    let version = c.bytes(4)?[0];
    let (timescale, duration) = if version == 1 {
        c.skip(16)?;
        (c.u32()?, c.u64()?)
    } else {
        c.skip(8)?;
        (c.u32()?, c.u32()? as u64)
    };
    if timescale == 0 {
        return Ok(0.0);
    }
    Ok(duration as f64 / timescale as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
        out
    }

    fn full(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut b = vec![0u8; 4];
        b.extend_from_slice(body);
        boxed(kind, &b)
    }

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn test_parse_header_sizes() {
        let buf = boxed(b"free", &[1, 2, 3]);
        let h = parse_header(&buf, 0, buf.len()).unwrap();
        assert!(h.is(b"free"));
        assert_eq!(h.size, 11);
        assert_eq!(h.body(), 8);

        let mut large = 1u32.to_be_bytes().to_vec();
        large.extend_from_slice(b"mdat");
        large.extend_from_slice(&20u64.to_be_bytes());
        large.extend_from_slice(&[0u8; 4]);
        let h = parse_header(&large, 0, large.len()).unwrap();
        assert_eq!((h.size, h.header_len), (20, 16));

        let mut to_end = 0u32.to_be_bytes().to_vec();
        to_end.extend_from_slice(b"mdat");
        to_end.extend_from_slice(&[0u8; 12]);
        assert_eq!(parse_header(&to_end, 0, to_end.len()).unwrap().size, 20);
    }

    #[test]
    fn test_parse_header_rejects_overflow() {
        let mut buf = boxed(b"moov", &[0u8; 8]);
        buf.truncate(12);
        assert!(matches!(parse_header(&buf, 0, buf.len()), Err(LibriSyncError::FormatError(_))));
        assert!(parse_header(&[0, 0, 0, 4, b'f', b'r', b'e', b'e'], 0, 8).is_err());
    }

    #[test]
    fn test_read_top_level_truncated() {
        let mut file = boxed(b"ftyp", b"M4B \0\0\0\0");
        file.extend(boxed(b"mdat", &[0u8; 32]));
        let full_len = file.len() as u64;

        let boxes = read_top_level(&mut std::io::Cursor::new(&file), full_len).unwrap();
        assert_eq!(boxes.len(), 2);

        file.truncate(file.len() - 10);
        let len = file.len() as u64;
        let err = read_top_level(&mut std::io::Cursor::new(&file), len).unwrap_err();
        assert!(matches!(err, LibriSyncError::FormatError(_)));
    }

    #[test]
    fn test_find_path() {
        let stbl = boxed(b"stbl", &[]);
        let minf = boxed(b"minf", &stbl);
        let root = boxed(b"mdia", &minf);
        let header = parse_header(&root, 0, root.len()).unwrap();

        let found = find_path(&root, &header, &[b"minf", b"stbl"]).unwrap().unwrap();
        assert!(found.is(b"stbl"));
        assert!(find_path(&root, &header, &[b"minf", b"stsd"]).unwrap().is_none());
    }

    #[test]
    fn test_sample_ranges() {
        let mut body = Vec::new();
        body.extend(full(b"stsz", &u32s(&[0, 5, 10, 20, 30, 40, 50])));
        // chunks 1-2 hold two samples, chunk 3 onward one
        body.extend(full(b"stsc", &u32s(&[2, 1, 2, 1, 3, 1, 1])));
        body.extend(full(b"stco", &u32s(&[3, 1000, 2000, 3000])));
        let stbl = boxed(b"stbl", &body);
        let header = parse_header(&stbl, 0, stbl.len()).unwrap();

        let table = SampleTable::parse(&stbl, &header).unwrap();
        assert_eq!(table.sample_count(), 5);
        let ranges = table.sample_ranges().unwrap();
        assert_eq!(
            ranges,
            vec![
                SampleRange { offset: 1000, size: 10 },
                SampleRange { offset: 1010, size: 20 },
                SampleRange { offset: 2000, size: 30 },
                SampleRange { offset: 2030, size: 40 },
                SampleRange { offset: 3000, size: 50 },
            ]
        );
    }

    #[test]
    fn test_sample_ranges_missing_chunks() {
        let table = SampleTable {
            sizes: vec![10, 10, 10],
            chunk_offsets: vec![100],
            sample_to_chunk: vec![(1, 2)],
        };
        assert!(table.sample_ranges().is_err());
    }

    #[test]
    fn test_table_count_exceeds_box() {
        let stsz = full(b"stsz", &u32s(&[0, 1000]));
        let stbl = boxed(b"stbl", &stsz);
        let header = parse_header(&stbl, 0, stbl.len()).unwrap();
        assert!(SampleTable::parse(&stbl, &header).is_err());
    }

    #[test]
    fn test_ilst_text_and_meta() {
        let mut data_body = u32s(&[1, 0]);
        data_body.extend_from_slice(b"A Title");
        let item = boxed(b"\xa9nam", &boxed(b"data", &data_body));
        let ilst = boxed(b"ilst", &item);
        let meta = full(b"meta", &ilst);

        let header = parse_header(&meta, 0, meta.len()).unwrap();
        let kids = meta_children(&meta, &header).unwrap();
        assert!(kids[0].is(b"ilst"));

        let items = children(&meta, kids[0].body() as usize, kids[0].end() as usize).unwrap();
        assert_eq!(ilst_text(&meta, &items[0]).unwrap().as_deref(), Some("A Title"));
    }

    #[test]
    fn test_movie_duration() {
        let mvhd = full(b"mvhd", &u32s(&[0, 0, 1000, 90_500]));
        let header = parse_header(&mvhd, 0, mvhd.len()).unwrap();
        assert_eq!(movie_duration(&mvhd, &header).unwrap(), 90.5);
    }
}
