use std::collections::BTreeSet;

/// A set of opaque signature strings, sorted lexicographically.
///
/// spec.md's Non-goals exclude signature verification: signatures are transported
/// verbatim as the `Sig:` lines of a narinfo record, never parsed into keys or checked.
pub type SignatureSet = BTreeSet<String>;
