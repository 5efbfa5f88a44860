//! Synchronous client for the Nix legacy worker protocol (`<store-tool> --serve --write`),
//! grounded on `nixrs::store::legacy_worker::client::LegacyStoreClient` but rebuilt on
//! blocking `std::io` per spec.md §5 rather than the teacher's Tokio-async framing.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use nixrs::hash::{Hash, ParseHashError};
use nixrs::path_info::PathInfo;
use nixrs::signature::SignatureSet;
use nixrs::store_path::{canonical_sort, ParseStorePathError, StorePath, StorePathSet, STORE_DIR};
use thiserror::Error;
use tracing::{debug, instrument};

const SERVE_MAGIC_1: u64 = 0x390c9deb;
const SERVE_MAGIC_2: u64 = 0x5452eecb;
const SERVE_PROTOCOL_VERSION: u64 = (2 << 8) | 7;

const CMD_QUERY_VALID_PATHS: u64 = 1;
const CMD_QUERY_PATH_INFOS: u64 = 2;
const CMD_DUMP_STORE_PATH: u64 = 3;
const CMD_QUERY_CLOSURE: u64 = 7;
const CMD_ADD_TO_STORE_NAR: u64 = 9;

/// Fixed transfer buffer size for NAR streaming, per spec.md §4.1.
const NAR_BUFFER: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error talking to store subprocess: {0}")]
    Io(#[from] io::Error),
    #[error("store subprocess failed to launch: {0}")]
    Spawn(io::Error),
    #[error("store subprocess handshake magic mismatch")]
    HandshakeMismatch,
    #[error("store subprocess speaks an incompatible major protocol version")]
    UnsupportedMajorVersion,
    #[error("malformed length-prefixed string from store subprocess")]
    MalformedString,
    #[error("store subprocess reported failure adding path to the store")]
    AddToStoreFailed,
    #[error("store subprocess sent an unparseable store path: {0}")]
    ParseStorePath(#[from] ParseStorePathError),
    #[error("store subprocess sent an unparseable hash: {0}")]
    ParseHash(#[from] ParseHashError),
}

/// Owns the store subprocess and both of its pipe handles.
pub struct StoreClient {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl StoreClient {
    /// Spawns `<program> --serve [--write]` and performs the handshake of spec.md §4.1.
    #[instrument(skip_all, fields(program))]
    pub fn connect(program: &str, write_allowed: bool) -> Result<Self, Error> {
        let mut cmd = Command::new(program);
        cmd.arg("--serve");
        if write_allowed {
            cmd.arg("--write");
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = cmd.spawn().map_err(Error::Spawn)?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut client = StoreClient {
            child,
            stdin: Some(stdin),
            stdout,
        };
        client.handshake()?;
        Ok(client)
    }

    fn handshake(&mut self) -> Result<(), Error> {
        self.write_u64(SERVE_MAGIC_1)?;
        self.write_u64(SERVE_PROTOCOL_VERSION)?;
        self.flush()?;

        let magic = self.read_u64()?;
        if magic != SERVE_MAGIC_2 {
            return Err(Error::HandshakeMismatch);
        }
        let remote_version = self.read_u64()?;
        if (remote_version >> 8) != 2 {
            return Err(Error::UnsupportedMajorVersion);
        }
        debug!(remote_version, "store subprocess handshake complete");
        Ok(())
    }

    fn stdin_mut(&mut self) -> &mut ChildStdin {
        self.stdin.as_mut().expect("stdin open while client is live")
    }

    fn write_u64(&mut self, v: u64) -> io::Result<()> {
        self.stdin_mut().write_all(&v.to_le_bytes())
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.stdout.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_bool(&mut self, v: bool) -> io::Result<()> {
        self.write_u64(v as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin_mut().flush()
    }

    fn write_string(&mut self, s: &str) -> io::Result<()> {
        let bytes = s.as_bytes();
        self.write_u64(bytes.len() as u64)?;
        self.stdin_mut().write_all(bytes)?;
        let pad = (8 - bytes.len() % 8) % 8;
        self.stdin_mut().write_all(&[0u8; 8][..pad])
    }

    fn read_string(&mut self) -> Result<String, Error> {
        let len = self.read_u64()? as usize;
        let mut buf = vec![0u8; len];
        self.stdout.read_exact(&mut buf)?;
        let pad = (8 - len % 8) % 8;
        let mut padbuf = [0u8; 8];
        self.stdout.read_exact(&mut padbuf[..pad])?;
        String::from_utf8(buf).map_err(|_| Error::MalformedString)
    }

    fn write_strings<'a, I: IntoIterator<Item = &'a str>>(&mut self, items: I) -> io::Result<()> {
        let items: Vec<&str> = items.into_iter().collect();
        self.write_u64(items.len() as u64)?;
        for s in items {
            self.write_string(s)?;
        }
        Ok(())
    }

    fn read_strings(&mut self) -> Result<Vec<String>, Error> {
        let len = self.read_u64()?;
        (0..len).map(|_| self.read_string()).collect()
    }

    fn write_store_paths<'a, I: IntoIterator<Item = &'a StorePath>>(
        &mut self,
        paths: I,
    ) -> io::Result<()> {
        let printed: Vec<String> = paths.into_iter().map(StorePath::to_string).collect();
        self.write_strings(printed.iter().map(String::as_str))
    }

    fn read_store_paths(&mut self) -> Result<StorePathSet, Error> {
        self.read_strings()?
            .into_iter()
            .map(|s| s.parse().map_err(Error::from))
            .collect()
    }

    fn read_store_path_field(&mut self) -> Result<Option<StorePath>, Error> {
        let s = self.read_string()?;
        if s.is_empty() {
            Ok(None)
        } else {
            Ok(Some(s.parse()?))
        }
    }

    /// `queryValidPaths(paths, lock, substitute) -> set<StorePath>`, opcode 1.
    #[instrument(skip_all)]
    pub fn query_valid_paths(
        &mut self,
        paths: &StorePathSet,
        lock: bool,
        substitute: bool,
    ) -> Result<StorePathSet, Error> {
        self.write_u64(CMD_QUERY_VALID_PATHS)?;
        self.write_bool(lock)?;
        self.write_bool(substitute)?;
        self.write_store_paths(paths)?;
        self.flush()?;
        self.read_store_paths()
    }

    /// `queryPathInfos(paths) -> list<PathInfo>`, opcode 2.
    #[instrument(skip_all)]
    pub fn query_path_infos(&mut self, paths: &StorePathSet) -> Result<Vec<PathInfo>, Error> {
        self.write_u64(CMD_QUERY_PATH_INFOS)?;
        self.write_store_paths(paths)?;
        self.flush()?;

        let mut infos = Vec::new();
        loop {
            let path_str = self.read_string()?;
            if path_str.is_empty() {
                break;
            }
            let path: StorePath = path_str.parse()?;
            let deriver = self.read_store_path_field()?;
            let mut references: Vec<StorePath> = self.read_store_paths()?.into_iter().collect();
            canonical_sort(&mut references);
            let nar_size = self.read_u64()?;
            let _nar_size_repeat = self.read_u64()?;
            let nar_hash: Hash = self.read_string()?.parse()?;
            let ca_str = self.read_string()?;
            let ca_info = if ca_str.is_empty() { None } else { Some(ca_str) };
            let sigs: SignatureSet = self.read_strings()?.into_iter().collect();

            infos.push(PathInfo {
                path,
                deriver,
                references: references.into_iter().collect(),
                nar_size,
                nar_hash,
                ca_info,
                sigs,
            });
        }
        Ok(infos)
    }

    /// `dumpStorePath(path, expectedSize, sink)`, opcode 3.
    #[instrument(skip(self, sink))]
    pub fn dump_store_path<W: Write>(
        &mut self,
        path: &StorePath,
        expected_size: u64,
        mut sink: W,
    ) -> Result<(), Error> {
        self.write_u64(CMD_DUMP_STORE_PATH)?;
        self.write_string(&path.to_string())?;
        self.flush()?;
        stream_fixed(&mut self.stdout, &mut sink, expected_size, NAR_BUFFER)?;
        Ok(())
    }

    /// Same call as [`Self::dump_store_path`], but returns a bounded `Read`
    /// adapter pulling directly from the subprocess's stdout instead of
    /// pushing into a sink. Lets a caller hand the NAR straight to something
    /// that pulls bytes (the shipfile writer's tar entry) without an
    /// intermediate buffer.
    #[instrument(skip(self))]
    pub fn dump_store_path_reader(
        &mut self,
        path: &StorePath,
        expected_size: u64,
    ) -> Result<DumpReader<'_>, Error> {
        self.write_u64(CMD_DUMP_STORE_PATH)?;
        self.write_string(&path.to_string())?;
        self.flush()?;
        Ok(DumpReader {
            stdout: &mut self.stdout,
            remaining: expected_size,
        })
    }

    /// `addToStoreNar(pathInfo, source)`, opcode 9.
    #[instrument(skip(self, source))]
    pub fn add_to_store_nar<R: Read>(&mut self, info: &PathInfo, mut source: R) -> Result<(), Error> {
        self.write_u64(CMD_ADD_TO_STORE_NAR)?;
        self.write_string(&info.path.to_string())?;
        self.write_string(
            &info
                .deriver
                .as_ref()
                .map(StorePath::to_string)
                .unwrap_or_default(),
        )?;
        self.write_string(&info.nar_hash.to_string())?;
        self.write_store_paths(&info.references)?;
        self.write_u64(0)?; // registrationTime
        self.write_u64(info.nar_size)?;
        self.write_u64(0)?; // ultimate
        self.write_strings(info.sigs.iter().map(String::as_str))?;
        self.write_string(info.ca_info.as_deref().unwrap_or(""))?;
        self.flush()?;

        {
            let stdin = self.stdin_mut();
            stream_fixed(&mut source, &mut *stdin, info.nar_size, NAR_BUFFER)?;
            stdin.flush()?;
        }

        let status = self.read_u64()?;
        if status == 0 {
            return Err(Error::AddToStoreFailed);
        }
        Ok(())
    }

    /// `queryClosure(paths, includeOutputs) -> list<StorePath>`, opcode 7.
    #[instrument(skip_all)]
    pub fn query_closure(
        &mut self,
        paths: &StorePathSet,
        include_outputs: bool,
    ) -> Result<StorePathSet, Error> {
        self.write_u64(CMD_QUERY_CLOSURE)?;
        self.write_bool(include_outputs)?;
        self.write_store_paths(paths)?;
        self.flush()?;
        self.read_store_paths()
    }
}

/// Bounded view over a `dumpStorePath` reply, returned by
/// [`StoreClient::dump_store_path_reader`].
pub struct DumpReader<'a> {
    stdout: &'a mut ChildStdout,
    remaining: u64,
}

impl Read for DumpReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.stdout.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Copies exactly `min(len, available)` bytes through a fixed-size buffer, stopping early
/// on EOF — shared by `dumpStorePath`'s read side and `addToStoreNar`'s write side.
fn stream_fixed<R: Read, W: Write>(
    mut source: R,
    mut sink: W,
    len: u64,
    buffer_size: usize,
) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buffer_size as u64) as usize;
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

impl Drop for StoreClient {
    /// Closes stdin, drains and discards stdout, and waits on the child — per spec.md
    /// §4.1's ownership contract.
    fn drop(&mut self) {
        self.stdin.take();
        let mut buf = [0u8; 4096];
        while matches!(self.stdout.read(&mut buf), Ok(n) if n > 0) {}
        let _ = self.child.wait();
    }
}

/// The canonical store directory this client speaks against, per spec.md's Non-goal that
/// excludes alternate store prefixes.
pub const fn store_dir() -> &'static str {
    STORE_DIR
}
