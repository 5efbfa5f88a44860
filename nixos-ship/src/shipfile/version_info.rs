//! `shipfile/metadata/version_info.json`, spec.md §3's VersionInfo record.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Feature added to `mandatoryFeatures` whenever the writer splits its output
/// across multiple files (§4.3).
pub const SIMPLE_SPLIT_FEATURE: &str = "simple_split";

/// Mandatory features this reader understands. `simple_split` requires no
/// reader-side behavior beyond accepting the flag: the parts are assumed
/// already concatenated into one byte stream before decompression starts.
const SUPPORTED_MANDATORY_FEATURES: &[&str] = &[SIMPLE_SPLIT_FEATURE];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u32,
    #[serde(default)]
    pub mandatory_features: BTreeSet<String>,
    #[serde(default)]
    pub optional_features: BTreeSet<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        VersionInfo {
            version: 1,
            mandatory_features: BTreeSet::new(),
            optional_features: BTreeSet::new(),
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        VersionInfo::default()
    }

    pub fn require(&mut self, feature: &str) {
        self.mandatory_features.insert(feature.to_owned());
    }

    /// Validates this record per §4.4's `initial` state transition. Returns
    /// the optional features this reader doesn't recognize, to be logged as
    /// warnings by the caller; an unknown mandatory feature is fatal.
    pub fn check(&self) -> Result<Vec<String>, CheckError> {
        if self.version != 1 {
            return Err(CheckError::UnsupportedVersion(self.version));
        }
        for feature in &self.mandatory_features {
            if !SUPPORTED_MANDATORY_FEATURES.contains(&feature.as_str()) {
                return Err(CheckError::UnknownMandatoryFeature(feature.clone()));
            }
        }
        Ok(self
            .optional_features
            .iter()
            .filter(|f| !SUPPORTED_MANDATORY_FEATURES.contains(&f.as_str()))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("shipfile version {0} is not supported (expected 1)")]
    UnsupportedVersion(u32),
    #[error("shipfile requires unsupported feature {0:?}")]
    UnknownMandatoryFeature(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let vi = VersionInfo::new();
        let text = serde_json::to_string(&vi).unwrap();
        let back: VersionInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(vi, back);
        assert!(vi.check().unwrap().is_empty());
    }

    #[test]
    fn unknown_optional_feature_is_a_warning_not_an_error() {
        let mut vi = VersionInfo::new();
        vi.optional_features.insert("future_hint".to_owned());
        let warnings = vi.check().unwrap();
        assert_eq!(warnings, vec!["future_hint".to_owned()]);
    }

    #[test]
    fn unknown_mandatory_feature_is_fatal() {
        let mut vi = VersionInfo::new();
        vi.require("future_thing");
        assert_eq!(
            vi.check().unwrap_err(),
            CheckError::UnknownMandatoryFeature("future_thing".to_owned())
        );
    }

    #[test]
    fn simple_split_is_a_known_mandatory_feature() {
        let mut vi = VersionInfo::new();
        vi.require(SIMPLE_SPLIT_FEATURE);
        assert!(vi.check().unwrap().is_empty());
    }
}
