use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;

use thiserror::Error;

use crate::hash::{Hash, ParseHashError};
use crate::signature::SignatureSet;
use crate::store_path::{ParseStorePathError, StorePath, StorePathSet};

/// Immutable per-object record, spec.md §3's `PathInfo`.
///
/// `ca_info` is carried as an opaque string rather than a parsed content-addressing
/// descriptor: spec.md's Non-goals rule out interpreting it, only transporting it
/// verbatim between the store subprocess and the shipfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    pub references: StorePathSet,
    pub nar_size: u64,
    pub nar_hash: Hash,
    pub ca_info: Option<String>,
    pub sigs: SignatureSet,
}

/// On-disk narinfo record: a [`PathInfo`] plus the bookkeeping the shipfile format
/// needs (`in_file`, §4.3/§4.5), serialized as `Key: value` lines in the exact order
/// spec.md §4.3 specifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    pub path_info: PathInfo,
    /// `true` iff this object's NAR bytes are present in this shipment (§4.5 step 3).
    pub in_file: bool,
}

impl NarInfo {
    pub fn new(path_info: PathInfo, in_file: bool) -> Self {
        NarInfo { path_info, in_file }
    }

    /// `nar/<narHashBase32>.nar`, or empty when `in_file` is false.
    ///
    /// The base32 here is bare (no `algo:` prefix): spec.md §4.3's `nar/<…>.nar`
    /// filename and `URL` field match real-Nix narinfo convention, unlike
    /// `FileHash`/`NarHash`, which keep the prefix.
    pub fn url(&self) -> String {
        if self.in_file {
            format!("nar/{}.nar", self.path_info.nar_hash.encode_base32())
        } else {
            String::new()
        }
    }

    pub fn display(&self) -> impl fmt::Display + '_ {
        DisplayNarInfo(self)
    }

    pub fn parse(s: &str) -> Result<NarInfo, ParseNarInfoError> {
        let mut path = None;
        let mut url = String::new();
        let mut compression = String::new();
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = StorePathSet::new();
        let mut deriver = None;
        let mut sigs = SignatureSet::new();
        let mut ca_info = None;

        for line in s.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            let mut kv = line.splitn(2, ':');
            let key = kv.next().unwrap();
            let value = kv
                .next()
                .ok_or_else(|| ParseNarInfoError::InvalidLine(line.into()))?
                .strip_prefix(' ')
                .unwrap_or("");
            match key {
                "StorePath" => path = Some(value.parse()?),
                "URL" => url = value.into(),
                "Compression" => compression = value.into(),
                "FileHash" => file_hash = Some(Hash::parse_any_prefixed(value)?),
                "FileSize" => file_size = Some(value.parse::<u64>()?),
                "NarHash" => nar_hash = Some(Hash::parse_any_prefixed(value)?),
                "NarSize" => nar_size = Some(value.parse::<u64>()?),
                "References" => {
                    if !value.trim().is_empty() {
                        for reference in value.split(' ') {
                            references.insert(parse_base_name(reference)?);
                        }
                    }
                }
                "Deriver" => {
                    if value != "unknown-deriver" {
                        deriver = Some(parse_base_name(value)?);
                    }
                }
                "Sig" => {
                    sigs.insert(value.to_owned());
                }
                "CA" => {
                    if !value.is_empty() {
                        ca_info = Some(value.to_owned());
                    }
                }
                other => return Err(ParseNarInfoError::UnknownKey(other.into())),
            }
        }

        let path = path.ok_or(ParseNarInfoError::MissingStorePath)?;
        let nar_hash = nar_hash.ok_or(ParseNarInfoError::MissingNarHash)?;
        let nar_size = nar_size.ok_or(ParseNarInfoError::MissingNarSize)?;
        if nar_size == 0 {
            return Err(ParseNarInfoError::ZeroNarSize);
        }

        if compression != "none" {
            return Err(ParseNarInfoError::UnsupportedCompression(compression));
        }
        if let Some(file_size) = file_size {
            if file_size != nar_size {
                return Err(ParseNarInfoError::FileSizeMismatch);
            }
        }
        if let Some(file_hash) = file_hash {
            if file_hash != nar_hash {
                return Err(ParseNarInfoError::FileHashMismatch);
            }
        }

        Ok(NarInfo {
            path_info: PathInfo {
                path,
                deriver,
                references,
                nar_size,
                nar_hash,
                ca_info,
                sigs,
            },
            in_file: !url.is_empty(),
        })
    }
}

fn parse_base_name(s: &str) -> Result<StorePath, ParseStorePathError> {
    format!("{}/{}", crate::store_path::STORE_DIR, s).parse()
}

struct DisplayNarInfo<'a>(&'a NarInfo);

impl fmt::Display for DisplayNarInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.0;
        let pi = &info.path_info;
        writeln!(f, "StorePath: {}", pi.path)?;
        writeln!(f, "URL: {}", info.url())?;
        writeln!(f, "Compression: none")?;
        writeln!(f, "FileHash: {}", pi.nar_hash.to_base32())?;
        writeln!(f, "FileSize: {}", pi.nar_size)?;
        writeln!(f, "NarHash: {}", pi.nar_hash.to_base32())?;
        writeln!(f, "NarSize: {}", pi.nar_size)?;
        write!(f, "References:")?;
        let mut references: Vec<_> = pi.references.iter().cloned().collect();
        crate::store_path::canonical_sort(&mut references);
        for reference in &references {
            write!(f, " {}", reference.base_name())?;
        }
        writeln!(f)?;
        if let Some(deriver) = pi.deriver.as_ref() {
            writeln!(f, "Deriver: {}", deriver.base_name())?;
        }
        for sig in &pi.sigs {
            writeln!(f, "Sig: {sig}")?;
        }
        if let Some(ca) = pi.ca_info.as_ref() {
            writeln!(f, "CA: {ca}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseNarInfoError {
    #[error("invalid narinfo line {0:?}")]
    InvalidLine(String),
    #[error("unknown narinfo key {0:?}")]
    UnknownKey(String),
    #[error("narinfo is missing StorePath")]
    MissingStorePath,
    #[error("narinfo is missing NarHash")]
    MissingNarHash,
    #[error("narinfo is missing NarSize")]
    MissingNarSize,
    #[error("narinfo NarSize must be nonzero, per spec.md §3's PathInfo invariant")]
    ZeroNarSize,
    #[error("narinfo Compression must be \"none\", got {0:?}")]
    UnsupportedCompression(String),
    #[error("narinfo FileSize does not match NarSize")]
    FileSizeMismatch,
    #[error("narinfo FileHash does not match NarHash")]
    FileHashMismatch,
    #[error("error parsing int {0}")]
    ParseInt(
        #[from]
        #[source]
        ParseIntError,
    ),
    #[error("error parsing hash {0}")]
    ParseHash(
        #[from]
        #[source]
        ParseHashError,
    ),
    #[error("error parsing store path {0}")]
    ParseStorePath(
        #[from]
        #[source]
        ParseStorePathError,
    ),
}

/// Builds the `references` adjacency map [`crate::store_path::topo_sort`] needs from a
/// set of narinfo records.
pub fn reference_map(infos: &[NarInfo]) -> BTreeMap<StorePath, StorePathSet> {
    infos
        .iter()
        .map(|info| (info.path_info.path.clone(), info.path_info.references.clone()))
        .collect()
}
