//! Content-derived job references
//!
//! A reference is the idempotency key of a job within its type. Deriving it
//! from the canonical form of the work makes re-submissions of the same
//! logical request collide, while distinct requests get distinct keys.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::QueueError;

/// `"<kind>/<version>(<hex sha256>)"` over the RFC 8785 canonical JSON of
/// `content`. Object key order does not affect the result.
pub fn content_reference<T: Serialize + ?Sized>(
    kind: &str,
    version: u32,
    content: &T,
) -> Result<String, QueueError> {
    let canonical = serde_jcs::to_vec(content)?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("{}/{}({})", kind, version, hex::encode(digest)))
}
