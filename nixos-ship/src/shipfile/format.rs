//! On-stream entry paths and compression tiers of spec.md §4.3.

pub const VERSION_INFO_ENTRY: &str = "shipfile/metadata/version_info.json";
pub const CONFIG_INFO_ENTRY: &str = "shipfile/metadata/config_info.json";
pub const METADATA_PREFIX: &str = "shipfile/metadata/";
pub const CACHE_INFO_ENTRY: &str = "shipfile/store/nix-cache-info";
pub const STORE_PREFIX: &str = "shipfile/store/";
pub const NAR_PREFIX: &str = "shipfile/store/nar/";

pub fn narinfo_entry(hash_part: &str) -> String {
    format!("{STORE_PREFIX}{hash_part}.narinfo")
}

pub fn nar_entry(nar_hash_base32: &str) -> String {
    format!("{NAR_PREFIX}{nar_hash_base32}.nar")
}

/// Compression tier named in spec.md §4.3, with the literal zstd parameters
/// confirmed by original_source's `shipfile.py` (`ShipfileWriter.open_store_paths_file`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Ultra,
    Normal,
    Fast,
}

impl Compression {
    pub const fn level(self) -> i32 {
        match self {
            Compression::Ultra => 22,
            Compression::Normal => 9,
            Compression::Fast => 3,
        }
    }

    pub const fn long_distance_matching(self) -> bool {
        !matches!(self, Compression::Fast)
    }

    /// Window log used whenever long-distance matching is enabled; also the
    /// reader's `window_log_max`, so `ultra` archives decompress correctly.
    pub const WINDOW_LOG: u32 = 31;
}

impl std::str::FromStr for Compression {
    type Err = UnknownCompressionTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ultra" => Ok(Compression::Ultra),
            "normal" => Ok(Compression::Normal),
            "fast" => Ok(Compression::Fast),
            other => Err(UnknownCompressionTier(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown compression tier {0:?} (expected ultra, normal, or fast)")]
pub struct UnknownCompressionTier(pub String);
