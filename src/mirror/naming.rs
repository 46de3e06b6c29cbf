//! Deterministic mirror object names
//!
//! A mirror is named `<remote>-<cluster>`. Re-running reconciliation for the
//! same link therefore always targets the same local objects. Names that
//! would exceed the Service name limit are truncated and suffixed with a
//! digest of the full name, which keeps distinct long names distinct.

use crate::kube_utils::deterministic_hash;

/// Maximum length of a Service name (DNS-1035 label)
pub const MAX_NAME_LEN: usize = 63;

/// Hex characters of the digest appended to truncated names
const HASH_SUFFIX_LEN: usize = 8;

/// Local name of the mirror of `remote_name` from `cluster_name`
pub fn mirror_name(remote_name: &str, cluster_name: &str) -> String {
    let full = format!("{}-{}", remote_name, cluster_name);
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let hash = deterministic_hash(full.as_bytes());
    let suffix = &hash[..HASH_SUFFIX_LEN];
    let keep = MAX_NAME_LEN - HASH_SUFFIX_LEN - 1;
    // Names are ASCII (DNS labels), so byte slicing is on char boundaries.
    let prefix = full[..keep].trim_end_matches('-');

    format!("{}-{}", prefix, suffix)
}
