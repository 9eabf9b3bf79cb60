//! HFZC cache file: fixed-layout, little-endian serialization of a snapshot.
//!
//! Layout:
//!
//! ```text
//! header (64 bytes)
//!   magic "HFZC" | version u32 | entry_count u32 | index_offset u64
//!   last_modified i64 | body_crc32 u32 | content_hash [u8; 32]
//! entries      (u16 len + url, u16 len + title, u16 visits, u32 days, u16 score)*
//! trigrams     u32 count, (u8 key_len + key, u32 n, n * u32)*   keys ascending
//! sorted index u32 count, count * u32
//! ```
//!
//! The prefix trie is not stored; [`CacheSnapshot::from_parts`] rebuilds it.
//! Decoding never trusts a declared length before checking it against the
//! bytes that remain, so truncated or hostile files are rejected without
//! panicking.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use fxhash::FxHashMap;
use memmap2::{Mmap, MmapMut};
use tempfile::NamedTempFile;

use crate::error::CacheError;
use crate::model::types::CompactEntry;
use crate::search::index::{CacheSnapshot, SNAPSHOT_VERSION};
use crate::search::normalize::{Trigram, trigram_from_str, trigram_to_string};
use crate::search::trigram::TrigramIndex;

pub const MAGIC: [u8; 4] = *b"HFZC";
pub const FORMAT_VERSION: u32 = SNAPSHOT_VERSION;
pub const HEADER_LEN: usize = 64;

/// Smallest possible encoded entry: two empty strings plus the fixed fields.
const MIN_ENTRY_LEN: usize = 2 + 2 + 2 + 4 + 2;
/// Smallest possible trigram record: three ASCII chars and zero ids.
const MIN_TRIGRAM_LEN: usize = 1 + 3 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub entry_count: u32,
    /// Absolute offset of the trigram section.
    pub index_offset: u64,
    pub last_modified: i64,
    /// CRC32 of every byte after the header.
    pub body_crc32: u32,
    pub content_hash: [u8; 32],
}

impl FileHeader {
    fn write_into(&self, out: &mut [u8]) -> Result<()> {
        let mut w = SliceWriter::new(out);
        w.put(&MAGIC)?;
        w.put_u32(self.version)?;
        w.put_u32(self.entry_count)?;
        w.put(&self.index_offset.to_le_bytes())?;
        w.put(&self.last_modified.to_le_bytes())?;
        w.put_u32(self.body_crc32)?;
        w.put(&self.content_hash)?;
        debug_assert_eq!(w.pos, HEADER_LEN);
        Ok(())
    }

    /// Parse and check magic and version. Does not look at the body.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("file too short for header ({} < {HEADER_LEN} bytes)", bytes.len());
        }
        let mut r = SliceReader::new(&bytes[..HEADER_LEN]);
        let magic = r.take(4)?;
        if magic != MAGIC {
            bail!("invalid HFZC magic: {magic:?}");
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            bail!("unsupported HFZC version: {version}");
        }
        let entry_count = r.u32()?;
        let index_offset = r.u64()?;
        let last_modified = r.i64()?;
        let body_crc32 = r.u32()?;
        let mut content_hash = [0u8; 32];
        content_hash.copy_from_slice(r.take(32)?);
        Ok(Self {
            version,
            entry_count,
            index_offset,
            last_modified,
            body_crc32,
            content_hash,
        })
    }
}

/// Exact number of bytes [`encode_into`] writes for `snapshot`.
pub fn encoded_len(snapshot: &CacheSnapshot) -> usize {
    let entries: usize = snapshot
        .entries
        .iter()
        .map(|e| MIN_ENTRY_LEN + e.url.len() + e.title.len())
        .sum();
    let trigrams: usize = snapshot
        .trigram_index
        .sorted_postings()
        .iter()
        .map(|(key, ids)| 1 + key.iter().map(|c| c.len_utf8()).sum::<usize>() + 4 + 4 * ids.len())
        .sum();
    HEADER_LEN + entries + 4 + trigrams + 4 + 4 * snapshot.sorted_index.len()
}

/// Serialize `snapshot` into `out`, which must be exactly [`encoded_len`] bytes.
pub fn encode_into(snapshot: &CacheSnapshot, out: &mut [u8]) -> Result<()> {
    let expected = encoded_len(snapshot);
    if out.len() != expected {
        bail!("output buffer is {} bytes, expected {expected}", out.len());
    }
    let entry_count = u32::try_from(snapshot.entries.len()).context("too many entries")?;

    let (header_buf, body) = out.split_at_mut(HEADER_LEN);
    let mut w = SliceWriter::new(body);

    for entry in &snapshot.entries {
        w.put_str16(&entry.url).context("entry url")?;
        w.put_str16(&entry.title).context("entry title")?;
        w.put_u16(entry.visit_count)?;
        w.put_u32(entry.last_visit_days)?;
        w.put_u16(entry.score)?;
    }
    let index_offset = (HEADER_LEN + w.pos) as u64;

    let postings = snapshot.trigram_index.sorted_postings();
    w.put_u32(u32::try_from(postings.len()).context("too many trigrams")?)?;
    for (key, ids) in postings {
        let key = trigram_to_string(key);
        let key_len = u8::try_from(key.len()).map_err(|_| anyhow!("trigram key too long"))?;
        w.put(&[key_len])?;
        w.put(key.as_bytes())?;
        w.put_u32(u32::try_from(ids.len()).context("posting list too long")?)?;
        for &id in ids {
            w.put_u32(id)?;
        }
    }

    w.put_u32(u32::try_from(snapshot.sorted_index.len()).context("sorted index too long")?)?;
    for &id in &snapshot.sorted_index {
        w.put_u32(id)?;
    }
    if w.pos != w.buf.len() {
        bail!("encoded body is {} bytes, expected {}", w.pos, w.buf.len());
    }

    let header = FileHeader {
        version: FORMAT_VERSION,
        entry_count,
        index_offset,
        last_modified: snapshot.last_modified,
        body_crc32: crc32fast::hash(body),
        content_hash: snapshot.content_hash,
    };
    header.write_into(header_buf)
}

pub fn encode(snapshot: &CacheSnapshot) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; encoded_len(snapshot)];
    encode_into(snapshot, &mut buf)?;
    Ok(buf)
}

/// Parse and validate a complete file image.
pub fn decode(bytes: &[u8]) -> Result<CacheSnapshot> {
    let header = FileHeader::parse(bytes)?;
    let body = &bytes[HEADER_LEN..];
    let crc = crc32fast::hash(body);
    if crc != header.body_crc32 {
        bail!(
            "body CRC mismatch (expected {:#010x}, got {crc:#010x})",
            header.body_crc32
        );
    }

    let entry_count = header.entry_count as usize;
    let mut r = SliceReader::new(body);

    let mut entries = Vec::with_capacity(entry_count.min(r.remaining() / MIN_ENTRY_LEN));
    for i in 0..entry_count {
        let url = r.str16().with_context(|| format!("entry {i} url"))?;
        let title = r.str16().with_context(|| format!("entry {i} title"))?;
        let visit_count = r.u16()?;
        let last_visit_days = r.u32()?;
        let score = r.u16()?;
        entries.push(CompactEntry {
            url,
            title,
            visit_count,
            last_visit_days,
            score,
        });
    }

    let parsed_offset = (HEADER_LEN + r.pos) as u64;
    if parsed_offset != header.index_offset {
        bail!(
            "index offset mismatch (header says {}, entries end at {parsed_offset})",
            header.index_offset
        );
    }

    let trigram_count = r.u32()? as usize;
    let mut postings: FxHashMap<Trigram, Vec<u32>> = FxHashMap::default();
    postings.reserve(trigram_count.min(r.remaining() / MIN_TRIGRAM_LEN));
    for _ in 0..trigram_count {
        let key_len = r.u8()? as usize;
        let key_bytes = r.take(key_len)?;
        let key = std::str::from_utf8(key_bytes).context("trigram key is not valid UTF-8")?;
        let trigram =
            trigram_from_str(key).ok_or_else(|| anyhow!("trigram key {key:?} is not 3 chars"))?;
        let ids = r.ids(entry_count).with_context(|| format!("postings for {key:?}"))?;
        if postings.insert(trigram, ids).is_some() {
            bail!("duplicate trigram key {key:?}");
        }
    }

    let sorted_count = r.u32()? as usize;
    if sorted_count != entry_count {
        bail!("sorted index has {sorted_count} ids for {entry_count} entries");
    }
    let sorted_index = r.ids_with_count(sorted_count, entry_count).context("sorted index")?;

    if r.remaining() != 0 {
        bail!("{} trailing bytes after sorted index", r.remaining());
    }

    Ok(CacheSnapshot::from_parts(
        entries,
        TrigramIndex::from_postings(postings),
        sorted_index,
        header.last_modified,
        header.content_hash,
    ))
}

/// Write `snapshot` to `path` through a temp file in the same directory and an
/// atomic rename. Parent directories are created as needed.
pub fn save(snapshot: &CacheSnapshot, path: &Path, use_mmap: bool) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create cache directory {}", parent.display()))?;

    let temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    write_file(snapshot, temp.as_file(), use_mmap)?;
    temp.persist(path).with_context(|| format!("rename temp file onto {}", path.display()))?;
    Ok(())
}

fn write_file(snapshot: &CacheSnapshot, file: &File, use_mmap: bool) -> Result<()> {
    if use_mmap {
        let len = encoded_len(snapshot);
        file.set_len(len as u64).context("size cache file")?;
        // SAFETY: the file was just created (or truncated) by us and is not
        // shared; the mapping is dropped before the file is renamed.
        let mut map = unsafe { MmapMut::map_mut(file).context("mmap cache file for writing")? };
        encode_into(snapshot, &mut map[..])?;
        map.flush().context("flush cache mapping")?;
    } else {
        let bytes = encode(snapshot)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes).context("write cache file")?;
        writer.flush().context("flush cache file")?;
    }
    Ok(())
}

/// Read and decode `path`. Every failure is reported as
/// [`CacheError::CorruptFile`], the signal to rebuild.
pub fn load(path: &Path, use_mmap: bool) -> Result<CacheSnapshot, CacheError> {
    read_and_decode(path, use_mmap).map_err(|e| CacheError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("{e:#}"),
    })
}

fn read_and_decode(path: &Path, use_mmap: bool) -> Result<CacheSnapshot> {
    if !use_mmap {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        return decode(&bytes);
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file.metadata().context("read cache file metadata")?.len();
    if len < HEADER_LEN as u64 {
        bail!("file too short for header ({len} < {HEADER_LEN} bytes)");
    }
    // SAFETY: the mapping is read-only and only lives for this call. Writers
    // replace the file by rename, so the mapped inode is never modified.
    let map = unsafe { Mmap::map(&file).context("mmap cache file")? };
    decode(&map)
}

/// Header-only validity check: the file exists and has the right magic and
/// version. The body is not read.
pub fn is_valid_cache_file(path: &Path) -> bool {
    read_header(path).is_ok()
}

/// Header of the file at `path`, if it parses.
pub fn read_header(path: &Path) -> Result<FileHeader> {
    let mut buf = [0u8; HEADER_LEN];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut buf))
        .with_context(|| format!("read header of {}", path.display()))?;
    FileHeader::parse(&buf)
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self
            .pos
            .checked_add(bytes.len())
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| anyhow!("write past end of buffer"))?;
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_str16(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| anyhow!("string of {} bytes exceeds u16", s.len()))?;
        self.put_u16(len)?;
        self.put(s.as_bytes())
    }
}

struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            bail!(
                "unexpected end of data: need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            );
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn str16(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).context("invalid UTF-8")
    }

    /// `u32` count followed by that many entry ids, each below `bound`.
    fn ids(&mut self, bound: usize) -> Result<Vec<u32>> {
        let count = self.u32()? as usize;
        self.ids_with_count(count, bound)
    }

    fn ids_with_count(&mut self, count: usize, bound: usize) -> Result<Vec<u32>> {
        let byte_len = count
            .checked_mul(4)
            .ok_or_else(|| anyhow!("id count {count} overflows"))?;
        let raw = self.take(byte_len)?;
        raw.chunks_exact(4)
            .map(|c| {
                let id = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                if (id as usize) < bound {
                    Ok(id)
                } else {
                    Err(anyhow!("entry id {id} out of range (entries: {bound})"))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn sample() -> CacheSnapshot {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let entries = vec![
            CompactEntry::new_at("https://github.com", "GitHub", 50, now - Duration::days(1), now),
            CompactEntry::new_at("https://例え.jp/パス", "日本語のタイトル", 3, now, now),
            CompactEntry::new_at("https://golang.org", "", 0, now - Duration::days(9), now),
        ];
        CacheSnapshot::build(entries, [0xAB; 32], now)
    }

    fn assert_same(a: &CacheSnapshot, b: &CacheSnapshot) {
        assert_eq!(a.entries, b.entries);
        assert_eq!(a.trigram_index, b.trigram_index);
        assert_eq!(a.sorted_index, b.sorted_index);
        assert_eq!(a.version, b.version);
        assert_eq!(a.last_modified, b.last_modified);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn encode_decode_preserves_snapshot() {
        let snap = sample();
        let bytes = encode(&snap).unwrap();
        assert_eq!(bytes.len(), encoded_len(&snap));
        assert_eq!(&bytes[..4], b"HFZC");
        let back = decode(&bytes).unwrap();
        assert_same(&snap, &back);
        assert_eq!(back.prefix_trie.lookup("git"), snap.prefix_trie.lookup("git"));
    }

    #[test]
    fn multibyte_trigram_keys_survive() {
        let snap = sample();
        let key = ['日', '本', '語'];
        assert_eq!(snap.trigram_index.get(&key), &[1]);
        let back = decode(&encode(&snap).unwrap()).unwrap();
        assert_eq!(back.trigram_index.get(&key), &[1]);
    }

    #[test]
    fn empty_snapshot_is_header_plus_two_counts() {
        let snap = CacheSnapshot::empty([0; 32], Utc::now());
        let bytes = encode(&snap).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 8);
        let back = decode(&bytes).unwrap();
        assert_eq!(back.entry_count(), 0);
        assert_eq!(back.trigram_count(), 0);
    }

    #[test]
    fn every_truncation_fails_closed() {
        let bytes = encode(&sample()).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "accepted truncation at {cut}");
        }
    }

    #[test]
    fn flipped_bytes_are_rejected() {
        let bytes = encode(&sample()).unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xFF;
        assert!(decode(&bad_magic).is_err());

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert!(decode(&bad_version).is_err());

        let mut bad_body = bytes.clone();
        let last = bad_body.len() - 1;
        bad_body[last] ^= 0x01;
        let err = decode(&bad_body).unwrap_err();
        assert!(format!("{err:#}").contains("CRC"), "{err:#}");

        let mut trailing = bytes;
        trailing.push(0);
        assert!(decode(&trailing).is_err());
    }

    #[test]
    fn out_of_range_ids_are_rejected_even_with_valid_crc() {
        let snap = sample();
        let mut bytes = encode(&snap).unwrap();
        // Last u32 of the file is the final sorted-index id.
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&99u32.to_le_bytes());
        let crc = crc32fast::hash(&bytes[HEADER_LEN..]);
        // body_crc32 sits after magic, version, count, offset, last_modified.
        bytes[28..32].copy_from_slice(&crc.to_le_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(format!("{err:#}").contains("out of range"), "{err:#}");
    }

    #[test]
    fn save_and_load_both_io_paths() {
        let dir = tempfile::tempdir().unwrap();
        let snap = sample();
        for use_mmap in [true, false] {
            let path = dir.path().join(format!("nested/cache-{use_mmap}.bin"));
            save(&snap, &path, use_mmap).unwrap();
            assert!(is_valid_cache_file(&path));
            for read_mmap in [true, false] {
                let back = load(&path, read_mmap).unwrap();
                assert_same(&snap, &back);
            }
            let header = read_header(&path).unwrap();
            assert_eq!(header.entry_count, 3);
            assert_eq!(header.content_hash, [0xAB; 32]);
        }
    }

    #[test]
    fn header_check_and_load_reject_junk() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk.bin");
        std::fs::write(&junk, b"not a cache").unwrap();
        assert!(!is_valid_cache_file(&junk));
        assert!(!is_valid_cache_file(&dir.path().join("missing.bin")));
        assert!(matches!(load(&junk, true), Err(CacheError::CorruptFile { .. })));
        assert!(matches!(load(&junk, false), Err(CacheError::CorruptFile { .. })));
    }
}
