//! `shipfile/metadata/config_info.json`, spec.md §3's ConfigInfo record: a
//! mapping from a human configuration name to the StorePath that is the
//! top-level of its configuration closure.

use std::collections::BTreeMap;

use nixrs::store_path::{ParseStorePathError, StorePath};
use serde_json::{Map, Value};
use thiserror::Error;

pub type ConfigInfo = BTreeMap<String, StorePath>;

#[derive(Debug, Error)]
pub enum ConfigInfoError {
    #[error("config_info is not a JSON object")]
    NotAnObject,
    #[error("config_info entry {0:?} is not a JSON string")]
    NotAString(String),
    #[error("config_info entry {0:?}: {1}")]
    ParseStorePath(String, #[source] ParseStorePathError),
}

pub fn to_json(info: &ConfigInfo) -> Value {
    let map: Map<String, Value> = info
        .iter()
        .map(|(name, path)| (name.clone(), Value::String(path.to_string())))
        .collect();
    Value::Object(map)
}

pub fn from_json(value: &Value) -> Result<ConfigInfo, ConfigInfoError> {
    let obj = value.as_object().ok_or(ConfigInfoError::NotAnObject)?;
    obj.iter()
        .map(|(name, value)| {
            let s = value
                .as_str()
                .ok_or_else(|| ConfigInfoError::NotAString(name.clone()))?;
            let path = s
                .parse()
                .map_err(|e| ConfigInfoError::ParseStorePath(name.clone(), e))?;
            Ok((name.clone(), path))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn path(s: &str) -> StorePath {
        s.parse().unwrap()
    }

    #[test]
    fn round_trips_through_json() {
        let mut info = ConfigInfo::new();
        info.insert(
            "host-a".to_owned(),
            path("/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-sys"),
        );
        let value = to_json(&info);
        let back = from_json(&value).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn rejects_non_string_entries() {
        let value = serde_json::json!({"host-a": 42});
        let err = from_json(&value).unwrap_err();
        assert!(matches!(err, ConfigInfoError::NotAString(_)));
    }
}
