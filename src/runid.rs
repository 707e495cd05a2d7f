//! Mints the opaque run identifier attached to every pod and watch event of
//! one iteration. Pure, infallible, and cheap enough to call once per
//! iteration without a second thought.

use uuid::Uuid;

/// Returns a fresh, lowercase, hyphenated UUID. Collision probability is
/// negligible over the lifetime of a cluster, so callers may treat the
/// result as unique.
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}
