use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use thiserror::Error;

use crate::base32;

/// The canonical, and in this crate only, store root. spec.md's Non-goals exclude any
/// alternate store prefix.
pub const STORE_DIR: &str = "/nix/store";

const STORE_PATH_HASH_SIZE: usize = 20;
pub const STORE_PATH_HASH_CHARS: usize = base32::encode_len(STORE_PATH_HASH_SIZE);
pub(crate) const MAX_NAME_LEN: usize = 211;

/// A parsed `/nix/store/<hashPart>-<name>` path.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StorePath {
    hash: StorePathHash,
    name: StorePathName,
}

impl StorePath {
    pub fn new(hash: StorePathHash, name: StorePathName) -> Self {
        StorePath { hash, name }
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    pub fn hash(&self) -> &StorePathHash {
        &self.hash
    }

    /// `<hashPart>-<name>`, the form used in narinfo `References`/`Deriver` fields.
    pub fn base_name(&self) -> String {
        format!("{}-{}", self.hash, self.name)
    }

    fn from_base_name(s: &str) -> Result<Self, StorePathError> {
        let bytes = s.as_bytes();
        if bytes.len() < STORE_PATH_HASH_CHARS + 1 {
            return Err(StorePathError::HashLength);
        }
        if bytes[STORE_PATH_HASH_CHARS] != b'-' {
            return Err(StorePathError::Symbol(
                STORE_PATH_HASH_CHARS as u8,
                bytes[STORE_PATH_HASH_CHARS],
            ));
        }
        let hash = StorePathHash::decode_digest(&bytes[..STORE_PATH_HASH_CHARS])?;
        let name = into_name(&bytes[STORE_PATH_HASH_CHARS + 1..])?;
        Ok(StorePath {
            hash,
            name: StorePathName(name.to_owned()),
        })
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StorePath")
            .field(&format_args!("{}", self))
            .finish()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", STORE_DIR, self.hash, self.name)
    }
}

impl FromStr for StorePath {
    type Err = ParseStorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(STORE_DIR)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| ParseStorePathError {
                path: s.to_owned(),
                error: StorePathError::NotInStore,
            })?;
        StorePath::from_base_name(rest).map_err(|error| ParseStorePathError {
            path: s.to_owned(),
            error,
        })
    }
}

/// Canonical ordering is `(name, hashPart)`, *not* the natural struct field order and *not*
/// the full path string — this is spec.md §3's explicit wire/archive order, distinct from
/// the "sort by full path" one would otherwise reach for.
pub fn canonical_cmp(a: &StorePath, b: &StorePath) -> Ordering {
    (&a.name, &a.hash).cmp(&(&b.name, &b.hash))
}

/// Sorts `paths` into canonical order (`(name, hashPart)`).
pub fn canonical_sort(paths: &mut [StorePath]) {
    paths.sort_by(canonical_cmp);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("parse error {path}: {error}")]
pub struct ParseStorePathError {
    pub path: String,
    pub error: StorePathError,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorePathError {
    #[error("path is not in the store")]
    NotInStore,
    #[error("invalid store path hash length")]
    HashLength,
    #[error("invalid store path name length")]
    NameLength,
    #[error("invalid store path symbol {1:?} at offset {0}")]
    Symbol(u8, u8),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StorePathHash([u8; STORE_PATH_HASH_SIZE]);

impl StorePathHash {
    pub fn decode_digest(data: &[u8]) -> Result<StorePathHash, StorePathError> {
        if data.len() != STORE_PATH_HASH_CHARS {
            return Err(StorePathError::HashLength);
        }
        let mut output = [0u8; STORE_PATH_HASH_SIZE];
        base32::decode_mut(data, &mut output)
            .map_err(|err| StorePathError::Symbol(err.error.position as u8, data[err.error.position]))?;
        Ok(StorePathHash(output))
    }
}

impl fmt::Debug for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathHash({})", self)
    }
}

impl fmt::Display for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut output = [0u8; STORE_PATH_HASH_CHARS];
        base32::encode_mut(&self.0, &mut output);
        // SAFETY: Nix base32 is a subset of ASCII.
        let s = unsafe { std::str::from_utf8_unchecked(&output) };
        f.write_str(s)
    }
}

impl FromStr for StorePathHash {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorePathHash::decode_digest(s.as_bytes())
    }
}

// Hashed/compared in wire-encoded (reversed-byte) order, matching the teacher's
// `StorePathHash` so canonical comparisons agree with base32 textual order.
impl std::hash::Hash for StorePathHash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for c in self.0.iter().rev() {
            c.hash(state);
        }
    }
}

impl Ord for StorePathHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for StorePathHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const NAME_LOOKUP: [bool; 256] = {
    let mut ret = [false; 256];
    let mut idx = 0usize;
    while idx < u8::MAX as usize {
        let ch = idx as u8;
        ret[idx] = matches!(ch, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'+' | b'-' | b'_' | b'?' | b'=' | b'.');
        idx += 1;
    }
    ret
};

fn into_name(s: &[u8]) -> Result<&str, StorePathError> {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return Err(StorePathError::NameLength);
    }
    for (idx, ch) in s.iter().enumerate() {
        if !NAME_LOOKUP[*ch as usize] {
            return Err(StorePathError::Symbol(idx as u8, *ch));
        }
    }
    // SAFETY: checked above to be a subset of ASCII.
    Ok(unsafe { std::str::from_utf8_unchecked(s) })
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathName(String);

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StorePathName {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = into_name(s.as_bytes())?;
        Ok(StorePathName(name.to_owned()))
    }
}

impl AsRef<str> for StorePathName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for StorePathName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub type StorePathSet = BTreeSet<StorePath>;

impl PartialOrd for StorePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// `StorePathSet`'s `BTreeSet` order is the struct's natural `(hash, name)` order, used
// purely for set bookkeeping (membership, dedup); canonical wire order is `canonical_cmp`.
impl Ord for StorePath {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.hash, &self.name).cmp(&(&other.hash, &other.name))
    }
}

/// The store graph is a DAG by construction (content addressing forbids cycles);
/// spec.md §9 says to reject any input that appears cyclic as a format error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cycle detected in store path references, through {0}")]
pub struct CyclicReferencesError(pub StorePath);

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

/// Topologically sorts `paths` so that every path appears before anything that references
/// it, per spec.md §4.2: sort by canonical order, then depth-first-visit each in that
/// order, visiting references before emitting. Stable and independent of insertion order.
///
/// `references` gives, for each path in `paths`, the set of paths (within `paths`) it
/// directly depends on. Returns [`CyclicReferencesError`] if following `references`
/// ever revisits a path still on the current DFS stack (spec.md §9).
pub fn topo_sort(
    paths: &StorePathSet,
    references: &BTreeMap<StorePath, StorePathSet>,
) -> Result<Vec<StorePath>, CyclicReferencesError> {
    let mut ordered: Vec<StorePath> = paths.iter().cloned().collect();
    canonical_sort(&mut ordered);

    let mut state = BTreeMap::new();
    let mut out = Vec::with_capacity(ordered.len());

    fn visit(
        path: &StorePath,
        references: &BTreeMap<StorePath, StorePathSet>,
        state: &mut BTreeMap<StorePath, VisitState>,
        out: &mut Vec<StorePath>,
    ) -> Result<(), CyclicReferencesError> {
        match state.get(path) {
            Some(VisitState::Done) => return Ok(()),
            Some(VisitState::InProgress) => return Err(CyclicReferencesError(path.clone())),
            None => {}
        }
        state.insert(path.clone(), VisitState::InProgress);
        if let Some(refs) = references.get(path) {
            let mut refs: Vec<StorePath> = refs.iter().cloned().collect();
            canonical_sort(&mut refs);
            for r in &refs {
                if r != path {
                    visit(r, references, state, out)?;
                }
            }
        }
        state.insert(path.clone(), VisitState::Done);
        out.push(path.clone());
        Ok(())
    }

    for path in &ordered {
        visit(path, references, &mut state, &mut out)?;
    }
    Ok(out)
}

#[cfg(any(test, feature = "test"))]
pub mod proptest {
    use super::*;
    use ::proptest::prelude::*;

    pub fn arb_store_path_name() -> impl Strategy<Value = StorePathName> {
        "[a-zA-Z0-9+\\-_?=][a-zA-Z0-9+\\-_?=.]{0,30}".prop_map(|s| s.parse().unwrap())
    }

    pub fn arb_store_path() -> impl Strategy<Value = StorePath> {
        (any::<[u8; STORE_PATH_HASH_SIZE]>(), arb_store_path_name())
            .prop_map(|(hash, name)| StorePath::new(StorePathHash(hash), name))
    }
}


/// Quantified invariants from spec.md §8, properties 1 and 2: `topo_sort` always
/// yields a permutation that respects `references`, and `canonical_sort` always
/// orders by `(name, hashPart)` regardless of input order.
#[cfg(test)]
mod proptests {
    use std::collections::{BTreeMap, BTreeSet};

    use ::proptest::prelude::*;

    use super::proptest::arb_store_path;
    use super::*;

    /// A small DAG: each path may reference only paths earlier in `paths`, so
    /// the references graph is acyclic by construction (spec.md §9's "the store
    /// graph is a DAG by construction").
    fn arb_dag() -> impl Strategy<Value = (StorePathSet, BTreeMap<StorePath, StorePathSet>)> {
        prop::collection::vec(arb_store_path(), 1..12).prop_flat_map(|paths| {
            let n = paths.len();
            let ref_choices: Vec<_> = (0..n)
                .map(|_| prop::collection::vec(0..n, 0..=3))
                .collect();
            (Just(paths), ref_choices).prop_map(|(paths, ref_indices)| {
                let set: StorePathSet = paths.iter().cloned().collect();
                let mut references = BTreeMap::new();
                for (i, path) in paths.iter().enumerate() {
                    let refs: StorePathSet = ref_indices[i]
                        .iter()
                        .filter(|&&j| j < i)
                        .map(|&j| paths[j].clone())
                        .collect();
                    references.insert(path.clone(), refs);
                }
                (set, references)
            })
        })
    }

    proptest! {
        #[test]
        fn topo_sort_is_a_permutation_respecting_references((paths, references) in arb_dag()) {
            let sorted = topo_sort(&paths, &references).unwrap();

            let sorted_set: BTreeSet<_> = sorted.iter().cloned().collect();
            prop_assert_eq!(sorted.len(), paths.len());
            prop_assert_eq!(&sorted_set, &paths);

            let position: BTreeMap<&StorePath, usize> =
                sorted.iter().enumerate().map(|(i, p)| (p, i)).collect();
            for path in &sorted {
                for reference in references.get(path).into_iter().flatten() {
                    if paths.contains(reference) {
                        prop_assert!(position[reference] < position[path]);
                    }
                }
            }
        }

        #[test]
        fn canonical_sort_orders_by_name_then_hash_part(mut paths in prop::collection::vec(arb_store_path(), 0..20)) {
            canonical_sort(&mut paths);
            for pair in paths.windows(2) {
                prop_assert_ne!(canonical_cmp(&pair[0], &pair[1]), Ordering::Greater);
            }
        }

        #[test]
        fn canonical_sort_is_stable_under_shuffled_input(paths in prop::collection::vec(arb_store_path(), 0..20)) {
            let mut shuffled_back_to_front: Vec<_> = paths.iter().rev().cloned().collect();
            let mut forward = paths.clone();
            canonical_sort(&mut forward);
            canonical_sort(&mut shuffled_back_to_front);
            prop_assert_eq!(forward, shuffled_back_to_front);
        }
    }
}
