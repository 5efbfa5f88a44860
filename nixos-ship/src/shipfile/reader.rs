//! Streaming parser for the shipfile format, spec.md §4.4: the mirror image of
//! [`super::writer::ShipfileWriter`]'s state machine, built directly on raw
//! tar header blocks rather than `tar::Archive`'s `Entries` iterator so a
//! single pending entry can be pushed back across a state transition without
//! ever buffering a NAR payload in memory.

use std::io::{self, Read, Write};
use std::path::Path;

use nixrs::path_info::{NarInfo, ParseNarInfoError};
use tar::{EntryType, Header};
use thiserror::Error;

use super::config_info::{self, ConfigInfo, ConfigInfoError};
use super::format::{CACHE_INFO_ENTRY, METADATA_PREFIX, NAR_PREFIX, STORE_PREFIX, VERSION_INFO_ENTRY, nar_entry};
use super::split::SplitReader;
use super::version_info::{CheckError, VersionInfo};

const BLOCK_SIZE: u64 = 512;
/// Transfer buffer for streaming a NAR entry's body into the caller's sink.
const COPY_BUFFER: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("shipfile reader: {0}")]
    Io(#[from] io::Error),
    #[error("shipfile reader: malformed tar entry: {0}")]
    Tar(io::Error),
    #[error("shipfile is empty")]
    EmptyArchive,
    #[error("expected {expected:?} as the first entry, found {found:?}")]
    UnexpectedFirstEntry { expected: &'static str, found: String },
    #[error("shipfile version_info: {0}")]
    VersionInfo(#[from] CheckError),
    #[error("shipfile version_info is not valid JSON: {0}")]
    VersionInfoJson(serde_json::Error),
    #[error("shipfile is missing {}", CONFIG_INFO_MISSING)]
    MissingConfigInfo,
    #[error("shipfile config_info: {0}")]
    ConfigInfo(#[from] ConfigInfoError),
    #[error("shipfile is missing shipfile/store/nix-cache-info")]
    MissingCacheInfo,
    #[error("nix-cache-info StoreDir must be {}, got {0:?}", nixrs::store_path::STORE_DIR)]
    WrongStoreDir(String),
    #[error("malformed nix-cache-info line {0:?}")]
    MalformedCacheInfo(String),
    #[error("shipfile narinfo: {0}")]
    NarInfo(#[from] ParseNarInfoError),
    #[error("reader called out of order: expected {expected}, reader is {actual}")]
    WrongState { expected: &'static str, actual: &'static str },
    #[error("pushback buffer already occupied")]
    DoublePushback,
    #[error("NAR {0} not found before end of archive")]
    NarNotFound(String),
}

const CONFIG_INFO_MISSING: &str = "shipfile/metadata/config_info.json";

/// One read-ahead tar entry: header already parsed, body untouched in the stream.
struct PendingEntry {
    path: String,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Metadata,
    StoreMetadata,
    ReadNar,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Initial => "initial",
            State::Metadata => "metadata",
            State::StoreMetadata => "store_metadata",
            State::ReadNar => "read_nar",
            State::Closed => "closed",
        }
    }
}

pub struct ShipfileReader<R> {
    inner: R,
    state: State,
    pending: Option<PendingEntry>,
}

impl<R: Read> ShipfileReader<R> {
    /// Wraps `inner` (already the decompressed tar byte stream) without reading
    /// anything yet; callers drive the state machine explicitly.
    pub fn new(inner: R) -> Self {
        ShipfileReader {
            inner,
            state: State::Initial,
            pending: None,
        }
    }

    fn push_back(&mut self, entry: PendingEntry) -> Result<(), ReaderError> {
        if self.pending.is_some() {
            return Err(ReaderError::DoublePushback);
        }
        self.pending = Some(entry);
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<PendingEntry>, ReaderError> {
        if let Some(entry) = self.pending.take() {
            return Ok(Some(entry));
        }
        loop {
            let mut first = [0u8; 1];
            let n = self.inner.read(&mut first)?;
            if n == 0 {
                return Ok(None);
            }
            let mut block = [0u8; BLOCK_SIZE as usize];
            block[0] = first[0];
            self.inner.read_exact(&mut block[1..])?;
            if block.iter().all(|&b| b == 0) {
                return Ok(None);
            }
            let header = Header::from_byte_slice(&block);
            let size = header.size().map_err(ReaderError::Tar)?;
            let entry_type = header.entry_type();
            if entry_type != EntryType::Regular && entry_type != EntryType::Continuous {
                self.skip_padded(size)?;
                continue;
            }
            let path = header
                .path()
                .map_err(ReaderError::Tar)?
                .to_string_lossy()
                .into_owned();
            return Ok(Some(PendingEntry { path, size }));
        }
    }

    fn skip_padded(&mut self, size: u64) -> io::Result<()> {
        io::copy(&mut (&mut self.inner).take(padded_len(size)), &mut io::sink())?;
        Ok(())
    }

    fn read_body(&mut self, size: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.inner.read_exact(&mut buf)?;
        let padding = padded_len(size) - size;
        if padding > 0 {
            io::copy(&mut (&mut self.inner).take(padding), &mut io::sink())?;
        }
        Ok(buf)
    }

    fn stream_body<W: Write>(&mut self, size: u64, sink: &mut W) -> io::Result<()> {
        let mut buf = [0u8; COPY_BUFFER];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.inner.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        let padding = padded_len(size) - size;
        if padding > 0 {
            io::copy(&mut (&mut self.inner).take(padding), &mut io::sink())?;
        }
        Ok(())
    }

    fn expect(&self, expected: State) -> Result<(), ReaderError> {
        if self.state != expected {
            return Err(ReaderError::WrongState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    /// `initial -> metadata`. Returns the optional features this reader doesn't
    /// recognize (to be logged as warnings); an unknown mandatory feature is fatal.
    pub fn read_version_info(&mut self) -> Result<Vec<String>, ReaderError> {
        self.expect(State::Initial)?;
        let entry = self
            .next_entry()?
            .ok_or(ReaderError::EmptyArchive)?;
        if entry.path != VERSION_INFO_ENTRY {
            return Err(ReaderError::UnexpectedFirstEntry {
                expected: VERSION_INFO_ENTRY,
                found: entry.path,
            });
        }
        let body = self.read_body(entry.size)?;
        let version_info: VersionInfo =
            serde_json::from_slice(&body).map_err(ReaderError::VersionInfoJson)?;
        let warnings = version_info.check()?;
        self.state = State::Metadata;
        Ok(warnings)
    }

    /// `metadata -> store_metadata`. Consumes entries under `shipfile/metadata/`,
    /// requiring `config_info.json` among them.
    pub fn read_config_info(&mut self) -> Result<ConfigInfo, ReaderError> {
        self.expect(State::Metadata)?;
        let mut config_info = None;
        loop {
            let entry = match self.next_entry()? {
                Some(e) => e,
                None => break,
            };
            if !entry.path.starts_with(METADATA_PREFIX) {
                self.push_back(entry)?;
                break;
            }
            let body = self.read_body(entry.size)?;
            if entry.path == super::format::CONFIG_INFO_ENTRY {
                let value: serde_json::Value = serde_json::from_slice(&body)
                    .map_err(ReaderError::VersionInfoJson)?;
                config_info = Some(config_info::from_json(&value)?);
            }
        }
        self.state = State::StoreMetadata;
        config_info.ok_or(ReaderError::MissingConfigInfo)
    }

    /// `store_metadata -> read_nar`. Consumes entries under `shipfile/store/`
    /// (excluding `shipfile/store/nar/`), requiring `nix-cache-info` among them
    /// and parsing every `.narinfo` entry encountered.
    pub fn read_store_metadata(&mut self) -> Result<Vec<NarInfo>, ReaderError> {
        self.expect(State::StoreMetadata)?;
        let mut saw_cache_info = false;
        let mut narinfos = Vec::new();
        loop {
            let entry = match self.next_entry()? {
                Some(e) => e,
                None => break,
            };
            if entry.path.starts_with(NAR_PREFIX) {
                self.push_back(entry)?;
                break;
            }
            if !entry.path.starts_with(STORE_PREFIX) {
                self.push_back(entry)?;
                break;
            }
            let body = self.read_body(entry.size)?;
            if entry.path == CACHE_INFO_ENTRY {
                check_cache_info(&body)?;
                saw_cache_info = true;
            } else if entry.path.ends_with(".narinfo") {
                let text = String::from_utf8_lossy(&body);
                narinfos.push(NarInfo::parse(&text)?);
            }
        }
        if !saw_cache_info {
            return Err(ReaderError::MissingCacheInfo);
        }
        self.state = State::ReadNar;
        Ok(narinfos)
    }

    /// Advances to the tar entry for `nar_hash_base32` (discarding the body of
    /// any intervening, non-matching entry) and returns a bounded [`Read`] over
    /// exactly that entry's bytes. Callers must invoke this in the archive's
    /// topological order (the contract [`crate::planner`] upholds).
    ///
    /// Never buffers the NAR itself: the returned reader pulls straight from
    /// the underlying decompressor, and its `Drop` skips whatever the caller
    /// left unread plus the tar block padding, so the stream position is
    /// correct for the next call regardless of how much the caller consumed.
    pub fn nar_body(&mut self, nar_hash_base32: &str) -> Result<NarBody<'_, R>, ReaderError> {
        self.expect(State::ReadNar)?;
        let target = nar_entry(nar_hash_base32);
        loop {
            let entry = match self.next_entry()? {
                Some(e) => e,
                None => return Err(ReaderError::NarNotFound(nar_hash_base32.to_owned())),
            };
            if entry.path == target {
                return Ok(NarBody::new(&mut self.inner, entry.size));
            }
            // Not the NAR we were asked for: discard its body and keep scanning.
            self.stream_body(entry.size, &mut io::sink())?;
        }
    }

    /// Convenience wrapper over [`Self::nar_body`] for callers that just want
    /// the bytes copied into a [`Write`] sink (used to discard a shipped-but-
    /// not-needed NAR, and by the round-trip tests below).
    pub fn consume_nar<W: Write>(&mut self, nar_hash_base32: &str, sink: &mut W) -> Result<(), ReaderError> {
        let mut body = self.nar_body(nar_hash_base32)?;
        io::copy(&mut body, sink)?;
        Ok(())
    }

    /// `read_nar -> closed`.
    pub fn close(mut self) -> Result<(), ReaderError> {
        self.state = State::Closed;
        Ok(())
    }
}

/// A bounded, streaming view over a single tar entry's body, returned by
/// [`ShipfileReader::nar_body`].
pub struct NarBody<'a, R: Read> {
    inner: &'a mut R,
    remaining: u64,
    padding: u64,
}

impl<'a, R: Read> NarBody<'a, R> {
    fn new(inner: &'a mut R, size: u64) -> Self {
        let padding = padded_len(size) - size;
        NarBody { inner, remaining: size, padding }
    }
}

impl<R: Read> Read for NarBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<R: Read> Drop for NarBody<'_, R> {
    /// Skips whatever the caller left unread plus the tar block padding, so a
    /// partially-consumed entry (the discard path for a shipped-but-not-needed
    /// NAR) still leaves the stream correctly positioned for the next entry.
    fn drop(&mut self) {
        let total = self.remaining + self.padding;
        if total > 0 {
            if let Err(err) = discard(self.inner, total) {
                tracing::warn!(%err, "failed to skip trailing shipfile NAR bytes");
            }
        }
    }
}

fn discard(reader: &mut impl Read, mut n: u64) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    while n > 0 {
        let want = n.min(buf.len() as u64) as usize;
        let r = reader.read(&mut buf[..want])?;
        if r == 0 {
            break;
        }
        n -= r as u64;
    }
    Ok(())
}

fn padded_len(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE;
    if rem == 0 {
        size
    } else {
        size + (BLOCK_SIZE - rem)
    }
}

fn check_cache_info(body: &[u8]) -> Result<(), ReaderError> {
    let text = String::from_utf8_lossy(body);
    let mut store_dir = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut kv = line.splitn(2, ':');
        let key = kv.next().unwrap();
        let value = kv
            .next()
            .ok_or_else(|| ReaderError::MalformedCacheInfo(line.to_owned()))?
            .trim();
        if key == "StoreDir" {
            store_dir = Some(value.to_owned());
        }
    }
    match store_dir {
        Some(dir) if dir == nixrs::store_path::STORE_DIR => Ok(()),
        Some(dir) => Err(ReaderError::WrongStoreDir(dir)),
        None => Err(ReaderError::MalformedCacheInfo(text.into_owned())),
    }
}

/// Opens a shipfile at `path`, which may be the first part of a
/// `simple_split` archive: [`SplitReader`] chains `path`, `path.1`,
/// `path.2`, … into a single byte stream before it reaches the zstd decoder
/// (window log raised to accommodate `ultra` archives, per §4.4), which
/// feeds a fresh [`ShipfileReader`].
pub fn open(path: &Path) -> Result<ShipfileReader<zstd::Decoder<'static, io::BufReader<SplitReader>>>, ReaderError> {
    let parts = SplitReader::open(path)?;
    let mut decoder = zstd::Decoder::new(parts)?;
    decoder.window_log_max(super::format::Compression::WINDOW_LOG)?;
    Ok(ShipfileReader::new(decoder))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shipfile::writer::ShipfileWriter;
    use crate::shipfile::Compression;
    use nixrs::hash::Algorithm;
    use nixrs::path_info::PathInfo;
    use nixrs::store_path::{StorePath, StorePathSet};

    fn path(s: &str) -> StorePath {
        s.parse().unwrap()
    }

    fn write_minimal(dest: &Path) -> (ConfigInfo, NarInfo, Vec<u8>) {
        write_minimal_with_split(dest, None)
    }

    fn write_minimal_with_split(dest: &Path, split_size: Option<u64>) -> (ConfigInfo, NarInfo, Vec<u8>) {
        let mut writer = ShipfileWriter::create(dest, Compression::Fast, split_size).unwrap();
        writer.write_version_info(VersionInfo::new()).unwrap();

        let top = path("/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-sys");
        let mut config = ConfigInfo::new();
        config.insert("host-a".to_owned(), top.clone());
        writer.write_config_info(&config).unwrap();
        writer.write_cache_info().unwrap();

        let nar_bytes: Vec<u8> = (0u8..16).collect();
        let nar_hash = Algorithm::SHA256.digest(&nar_bytes);
        let path_info = PathInfo {
            path: top,
            deriver: None,
            references: StorePathSet::new(),
            nar_size: nar_bytes.len() as u64,
            nar_hash,
            ca_info: None,
            sigs: Default::default(),
        };
        let narinfo = NarInfo::new(path_info, true);
        writer.write_narinfo(&narinfo).unwrap();
        writer
            .write_nar(
                &narinfo.path_info.nar_hash.encode_base32(),
                nar_bytes.len() as u64,
                &nar_bytes[..],
            )
            .unwrap();
        writer.close().unwrap();
        (config, narinfo, nar_bytes)
    }

    #[test]
    fn round_trips_config_narinfo_and_nar_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");
        let (config, narinfo, nar_bytes) = write_minimal(&dest);

        let mut reader = open(&dest).unwrap();
        let warnings = reader.read_version_info().unwrap();
        assert!(warnings.is_empty());
        let read_config = reader.read_config_info().unwrap();
        assert_eq!(read_config, config);
        let narinfos = reader.read_store_metadata().unwrap();
        assert_eq!(narinfos, vec![narinfo.clone()]);

        let mut out = Vec::new();
        reader
            .consume_nar(&narinfo.path_info.nar_hash.encode_base32(), &mut out)
            .unwrap();
        assert_eq!(out, nar_bytes);
        reader.close().unwrap();
    }

    /// End-to-end split round trip: force many small parts, then point
    /// `open` at just the first one and confirm it transparently reassembles
    /// the rest (spec.md §4.3/§5's split-archive contract).
    #[test]
    fn opens_and_reassembles_a_split_archive_from_its_first_part() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");
        let (config, narinfo, nar_bytes) = write_minimal_with_split(&dest, Some(64));

        assert!(dir.path().join("out.shipfile.1").exists(), "expected more than one part");

        let mut reader = open(&dest).unwrap();
        let warnings = reader.read_version_info().unwrap();
        assert!(warnings.is_empty());
        let read_config = reader.read_config_info().unwrap();
        assert_eq!(read_config, config);
        let narinfos = reader.read_store_metadata().unwrap();
        assert_eq!(narinfos, vec![narinfo.clone()]);

        let mut out = Vec::new();
        reader
            .consume_nar(&narinfo.path_info.nar_hash.encode_base32(), &mut out)
            .unwrap();
        assert_eq!(out, nar_bytes);
        reader.close().unwrap();
    }

    #[test]
    fn rejects_unknown_mandatory_feature_before_other_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");
        let mut writer = ShipfileWriter::create(&dest, Compression::Fast, None).unwrap();
        let mut vi = VersionInfo::new();
        vi.require("future_thing");
        // Bypass the writer's own split-feature bookkeeping: write the record directly.
        writer.write_version_info(vi).unwrap();
        writer.write_config_info(&ConfigInfo::new()).unwrap();
        writer.write_cache_info().unwrap();
        writer.close().unwrap();

        let mut reader = open(&dest).unwrap();
        let err = reader.read_version_info().unwrap_err();
        assert!(matches!(err, ReaderError::VersionInfo(CheckError::UnknownMandatoryFeature(_))));
    }

    #[test]
    fn missing_nar_before_eof_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");
        write_minimal(&dest);

        let mut reader = open(&dest).unwrap();
        reader.read_version_info().unwrap();
        reader.read_config_info().unwrap();
        reader.read_store_metadata().unwrap();
        let mut out = Vec::new();
        let err = reader.consume_nar("0000000000000000000000000000000000000000000000000", &mut out).unwrap_err();
        assert!(matches!(err, ReaderError::NarNotFound(_)));
    }
}
