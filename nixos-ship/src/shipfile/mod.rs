//! The shipfile container format, spec.md §4.3/§4.4: an ordered,
//! zstd-compressed tar stream carrying a NixOS configuration closure.

pub mod config_info;
pub mod format;
pub mod reader;
pub mod split;
pub mod version_info;
pub mod writer;

pub use config_info::ConfigInfo;
pub use format::Compression;
pub use reader::{ShipfileReader, ReaderError};
pub use version_info::VersionInfo;
pub use writer::{ShipfileWriter, WriterError};
