//! Delta-aware object selection, spec.md §4.5: the sender picks which objects
//! must travel (full closure minus an optional delta baseline) and the
//! receiver computes the minimal set it still needs to import.

use std::collections::BTreeMap;
use std::io::{self, Read};

use nixrs::path_info::{NarInfo, PathInfo};
use nixrs::store_path::{canonical_sort, topo_sort, CyclicReferencesError, StorePath, StorePathSet};
use thiserror::Error;
use tracing::{debug, info};

use crate::shipfile::reader::ShipfileReader;
use crate::shipfile::ConfigInfo;
use crate::store_client::{self, StoreClient};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    StoreClient(#[from] store_client::Error),
    #[error(transparent)]
    Reader(#[from] crate::shipfile::reader::ReaderError),
    #[error("draining a not-needed NAR from the shipfile: {0}")]
    Io(#[from] io::Error),
    #[error("configuration {0:?} not found in this shipfile")]
    UnknownConfiguration(String),
    #[error(
        "refusing to install: missing from shipment: {}",
        .0.iter().map(StorePath::to_string).collect::<Vec<_>>().join(", ")
    )]
    MissingPaths(Vec<StorePath>),
    #[error(transparent)]
    Cyclic(#[from] CyclicReferencesError),
}

/// The result of send-side planning (spec.md §4.5 "Send side"): narinfos in
/// the canonical topological order the shipfile must emit them in, each
/// flagged with whether its NAR payload belongs in this shipment.
pub struct SendPlan {
    pub narinfos: Vec<NarInfo>,
}

impl SendPlan {
    /// Paths whose NAR payload must be streamed into the shipfile.
    pub fn shipped_paths(&self) -> StorePathSet {
        self.narinfos
            .iter()
            .filter(|n| n.in_file)
            .map(|n| n.path_info.path.clone())
            .collect()
    }
}

/// Computes which objects to ship for each `(name -> top-level)` entry in
/// `configs`, subtracting the closure of the matching entry in `baseline`
/// when one is present (empty baseline closure otherwise). Queries the
/// *union* of every configuration's full closure for path-infos, so
/// baseline-covered objects are still announced (with `in_file = false`)
/// and the receiver can reconstruct `references`.
pub fn plan_send(
    client: &mut StoreClient,
    configs: &BTreeMap<String, StorePath>,
    baseline: &BTreeMap<String, StorePath>,
) -> Result<SendPlan, PlannerError> {
    let mut announced = StorePathSet::new();
    let mut shipped = StorePathSet::new();

    for (name, top) in configs {
        let new_closure = client.query_closure(&singleton(top), false)?;
        let baseline_closure = match baseline.get(name) {
            Some(base_top) => client.query_closure(&singleton(base_top), false)?,
            None => StorePathSet::new(),
        };
        debug!(
            config = %name,
            new = new_closure.len(),
            baseline = baseline_closure.len(),
            "queried closures"
        );
        for path in &new_closure {
            if !baseline_closure.contains(path) {
                shipped.insert(path.clone());
            }
        }
        announced.extend(new_closure);
    }

    let infos = client.query_path_infos(&announced)?;
    let by_path: BTreeMap<StorePath, PathInfo> =
        infos.into_iter().map(|info| (info.path.clone(), info)).collect();
    let references: BTreeMap<StorePath, StorePathSet> = by_path
        .iter()
        .map(|(path, info)| (path.clone(), info.references.clone()))
        .collect();

    let narinfos = topo_sort(&announced, &references)?
        .into_iter()
        .map(|path| {
            let info = by_path
                .get(&path)
                .expect("topo_sort only ever emits paths drawn from `announced`")
                .clone();
            let in_file = shipped.contains(&path);
            NarInfo::new(info, in_file)
        })
        .collect();

    info!(announced = announced.len(), shipped = shipped.len(), "send plan computed");
    Ok(SendPlan { narinfos })
}

fn singleton(path: &StorePath) -> StorePathSet {
    [path.clone()].into_iter().collect()
}

/// Receive-side closure diff (spec.md §4.5 "Receive side", steps 1-4).
///
/// Returns the set of paths to import, in the archive's topological order.
/// Locks every path in the target's closure against the local store's
/// garbage collector for the remainder of this [`StoreClient`] session
/// (`queryValidPaths(..., lock = true)`) before deciding what's missing.
pub fn compute_needed(
    client: &mut StoreClient,
    config_info: &ConfigInfo,
    narinfos: &[NarInfo],
    config_name: &str,
) -> Result<Vec<StorePath>, PlannerError> {
    let target = config_info
        .get(config_name)
        .ok_or_else(|| PlannerError::UnknownConfiguration(config_name.to_owned()))?;

    let by_path: BTreeMap<&StorePath, &NarInfo> =
        narinfos.iter().map(|n| (&n.path_info.path, n)).collect();
    if !by_path.contains_key(target) {
        return Err(PlannerError::UnknownConfiguration(config_name.to_owned()));
    }

    let mut closure = StorePathSet::new();
    let mut stack = vec![target.clone()];
    while let Some(path) = stack.pop() {
        if !closure.insert(path.clone()) {
            continue;
        }
        if let Some(info) = by_path.get(&path) {
            for reference in &info.path_info.references {
                if !closure.contains(reference) {
                    stack.push(reference.clone());
                }
            }
        }
    }

    let valid = client.query_valid_paths(&closure, true, false)?;
    let needed: StorePathSet = closure.difference(&valid).cloned().collect();

    let mut missing: Vec<StorePath> = needed
        .iter()
        .filter(|path| !matches!(by_path.get(path), Some(info) if info.in_file))
        .cloned()
        .collect();
    if !missing.is_empty() {
        canonical_sort(&mut missing);
        return Err(PlannerError::MissingPaths(missing));
    }

    info!(closure = closure.len(), valid = valid.len(), needed = needed.len(), config = %config_name, "computed needed set");
    Ok(narinfos
        .iter()
        .map(|n| n.path_info.path.clone())
        .filter(|path| needed.contains(path))
        .collect())
}

/// Receive-side import (spec.md §4.5 step 5): streams each needed NAR from the
/// shipfile straight into the destination store, and drains (without
/// importing) the NAR of any shipped object that's already valid locally so
/// the archive stream stays in sync. Objects announced with `in_file = false`
/// never had a NAR emitted and are skipped without touching the reader.
pub fn import<R: Read>(
    client: &mut StoreClient,
    reader: &mut ShipfileReader<R>,
    narinfos: &[NarInfo],
    needed: &StorePathSet,
) -> Result<(), PlannerError> {
    for info in narinfos {
        if !info.in_file {
            continue;
        }
        let hash = info.path_info.nar_hash.encode_base32();
        if needed.contains(&info.path_info.path) {
            let mut body = reader.nar_body(&hash)?;
            client.add_to_store_nar(&info.path_info, &mut body)?;
        } else {
            let mut body = reader.nar_body(&hash)?;
            io::copy(&mut body, &mut io::sink())?;
        }
    }
    Ok(())
}
