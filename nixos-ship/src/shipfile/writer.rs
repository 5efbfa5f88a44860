//! Ordered emission of a shipfile, spec.md §4.3: a zstd-compressed tar stream
//! carrying `version_info.json`, `config_info.json`, `nix-cache-info`, one
//! `.narinfo` per shipped object, and the NAR payloads themselves.
//!
//! Grounded on the teacher's streaming style (`nixrs::store::legacy_worker`'s
//! fixed-buffer NAR copies) but built directly on `tar`/`zstd` rather than the
//! teacher's async framing, per SPEC_FULL.md's §5 redesign note.

use std::io::{self, Read, Write};
use std::path::Path;

use nixrs::path_info::NarInfo;
use tar::Header;
use thiserror::Error;

use super::config_info::ConfigInfo;
use super::format::{
    nar_entry, narinfo_entry, Compression, CACHE_INFO_ENTRY, CONFIG_INFO_ENTRY, VERSION_INFO_ENTRY,
};
use super::split::SplitWriter;
use super::version_info::{SIMPLE_SPLIT_FEATURE, VersionInfo};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("shipfile writer: {0}")]
    Io(#[from] io::Error),
    #[error("shipfile writer: {0}")]
    Json(#[from] serde_json::Error),
    #[error("shipfile writer called out of order: expected {expected}, writer is {actual}")]
    WrongState { expected: &'static str, actual: &'static str },
    #[error("NAR for {hash} declared {expected} bytes but source produced {actual}")]
    NarSizeMismatch { hash: String, expected: u64, actual: u64 },
}

/// Mirrors spec.md §4.3's linear writer state machine. `Streaming` covers both
/// narinfo and NAR emission: the writer does not itself enforce that every
/// narinfo precedes every NAR — that ordering is the Planner's responsibility
/// (§4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    WroteVersion,
    WroteConfig,
    WroteCache,
    Streaming,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Initial => "initial",
            State::WroteVersion => "wrote_version",
            State::WroteConfig => "wrote_config",
            State::WroteCache => "wrote_cache",
            State::Streaming => "streaming_narinfos_and_nars",
            State::Closed => "closed",
        }
    }
}

pub struct ShipfileWriter {
    tar: tar::Builder<zstd::Encoder<'static, SplitWriter>>,
    state: State,
    split_size: Option<u64>,
}

impl ShipfileWriter {
    /// Opens `dest` (or `dest`, `dest.1`, `dest.2`, … when `split_size` is set)
    /// and configures the zstd encoder per spec.md §4.3's compression table.
    pub fn create(
        dest: &Path,
        compression: Compression,
        split_size: Option<u64>,
    ) -> Result<Self, WriterError> {
        let split = SplitWriter::create(dest, split_size)?;
        let mut encoder = zstd::Encoder::new(split, compression.level())?;
        encoder.long_distance_matching(compression.long_distance_matching())?;
        if compression.long_distance_matching() {
            encoder.window_log(Compression::WINDOW_LOG)?;
        }
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        encoder.multithread(workers)?;

        Ok(ShipfileWriter {
            tar: tar::Builder::new(encoder),
            state: State::Initial,
            split_size,
        })
    }

    fn expect(&self, expected: State) -> Result<(), WriterError> {
        if self.state != expected {
            return Err(WriterError::WrongState {
                expected: expected.name(),
                actual: self.state.name(),
            });
        }
        Ok(())
    }

    fn append_entry(&mut self, path: &str, data: &[u8]) -> Result<(), WriterError> {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.tar.append_data(&mut header, path, data)?;
        Ok(())
    }

    /// `initial -> wrote_version`. Adds [`SIMPLE_SPLIT_FEATURE`] to the mandatory
    /// features before serializing whenever this writer was opened with a
    /// `split_size`, per §4.3.
    pub fn write_version_info(&mut self, mut version_info: VersionInfo) -> Result<(), WriterError> {
        self.expect(State::Initial)?;
        if self.split_size.is_some() {
            version_info.require(SIMPLE_SPLIT_FEATURE);
        }
        let bytes = serde_json::to_vec(&version_info)?;
        self.append_entry(VERSION_INFO_ENTRY, &bytes)?;
        self.state = State::WroteVersion;
        Ok(())
    }

    /// `wrote_version -> wrote_config`.
    pub fn write_config_info(&mut self, config_info: &ConfigInfo) -> Result<(), WriterError> {
        self.expect(State::WroteVersion)?;
        let bytes = serde_json::to_vec(&super::config_info::to_json(config_info))?;
        self.append_entry(CONFIG_INFO_ENTRY, &bytes)?;
        self.state = State::WroteConfig;
        Ok(())
    }

    /// `wrote_config -> wrote_cache`.
    pub fn write_cache_info(&mut self) -> Result<(), WriterError> {
        self.expect(State::WroteConfig)?;
        let line = format!("StoreDir: {}\n", nixrs::store_path::STORE_DIR);
        self.append_entry(CACHE_INFO_ENTRY, line.as_bytes())?;
        self.state = State::WroteCache;
        Ok(())
    }

    /// `wrote_cache -> streaming` (a no-op once already streaming).
    fn enter_streaming(&mut self) -> Result<(), WriterError> {
        match self.state {
            State::WroteCache => {
                self.state = State::Streaming;
                Ok(())
            }
            State::Streaming => Ok(()),
            _ => Err(WriterError::WrongState {
                expected: State::WroteCache.name(),
                actual: self.state.name(),
            }),
        }
    }

    /// Emits one `.narinfo` record (§4.3's field ordering, via [`NarInfo::display`]).
    pub fn write_narinfo(&mut self, narinfo: &NarInfo) -> Result<(), WriterError> {
        self.enter_streaming()?;
        let path = narinfo_entry(&narinfo.path_info.path.hash().to_string());
        let text = narinfo.display().to_string();
        self.append_entry(&path, text.as_bytes())
    }

    /// Streams exactly `nar_size` bytes from `source` into `shipfile/store/nar/<nar_hash_base32>.nar`.
    pub fn write_nar<R: Read>(
        &mut self,
        nar_hash_base32: &str,
        nar_size: u64,
        source: R,
    ) -> Result<(), WriterError> {
        self.enter_streaming()?;
        let path = nar_entry(nar_hash_base32);

        let mut header = Header::new_gnu();
        header.set_size(nar_size);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();

        let mut counted = CountingReader::new(source.take(nar_size));
        self.tar.append_data(&mut header, &path, &mut counted)?;
        let actual = counted.count();
        if actual != nar_size {
            return Err(WriterError::NarSizeMismatch {
                hash: nar_hash_base32.to_owned(),
                expected: nar_size,
                actual,
            });
        }
        Ok(())
    }

    /// `* -> closed`: flushes the tar trailer, the zstd frame, and the split file(s).
    pub fn close(mut self) -> Result<(), WriterError> {
        let encoder = self.tar.into_inner()?;
        let mut split = encoder.finish()?;
        split.flush()?;
        self.state = State::Closed;
        Ok(())
    }
}

/// Counts bytes read through an inner reader, so [`ShipfileWriter::write_nar`] can
/// detect a short NAR stream without buffering it.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        CountingReader { inner, count: 0 }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nixrs::hash::Algorithm;
    use nixrs::path_info::PathInfo;
    use nixrs::store_path::{StorePath, StorePathSet};
    use std::collections::BTreeMap;

    fn path(s: &str) -> StorePath {
        s.parse().unwrap()
    }

    #[test]
    fn minimal_roundtrip_has_five_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");

        let mut writer = ShipfileWriter::create(&dest, Compression::Fast, None).unwrap();
        writer.write_version_info(VersionInfo::new()).unwrap();

        let mut config = ConfigInfo::new();
        let top = path("/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-sys");
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
            .write_nar(&nar_hash.encode_base32(), nar_bytes.len() as u64, &nar_bytes[..])
            .unwrap();
        writer.close().unwrap();

        let file = std::fs::File::open(&dest).unwrap();
        let decoder = zstd::Decoder::new(file).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        let nar_entry_name = format!("shipfile/store/nar/{}.nar", nar_hash.encode_base32());
        assert!(
            !nar_entry_name.contains(':'),
            "nar entry name must be bare base32, no algo prefix: {nar_entry_name:?}"
        );
        assert_eq!(
            names,
            vec![
                "shipfile/metadata/version_info.json".to_owned(),
                "shipfile/metadata/config_info.json".to_owned(),
                "shipfile/store/nix-cache-info".to_owned(),
                "shipfile/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.narinfo".to_owned(),
                nar_entry_name,
            ]
        );
    }

    #[test]
    fn calling_out_of_order_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");
        let mut writer = ShipfileWriter::create(&dest, Compression::Fast, None).unwrap();
        let err = writer.write_cache_info().unwrap_err();
        assert!(matches!(err, WriterError::WrongState { .. }));
    }

    #[test]
    fn split_size_requires_simple_split_feature() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.shipfile");
        let mut writer = ShipfileWriter::create(&dest, Compression::Fast, Some(1 << 20)).unwrap();
        writer.write_version_info(VersionInfo::new()).unwrap();
        writer.write_config_info(&BTreeMap::new()).unwrap();
        writer.write_cache_info().unwrap();
        writer.close().unwrap();

        let file = std::fs::File::open(&dest).unwrap();
        let decoder = zstd::Decoder::new(file).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let mut entries = archive.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        let mut contents = Vec::new();
        let mut first = first;
        first.read_to_end(&mut contents).unwrap();
        let vi: VersionInfo = serde_json::from_slice(&contents).unwrap();
        assert!(vi.mandatory_features.contains(SIMPLE_SPLIT_FEATURE));
    }
}
