//! # batchfleet-id
//!
//! Typed identifiers for organizations, pipelines, operations, jobs and
//! scheduled tasks.
//!
//! ## ID Format
//!
//! All resource IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `org_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `pl_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `job_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! IDs minted in one process come from a single monotonic generator, so
//! comparing two of them tells you which was created first even when both
//! fall within the same millisecond. Admission relies on this for its FIFO
//! tie-break.

mod error;
mod macros;
mod types;

use std::sync::{LazyLock, Mutex};

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

static GENERATOR: LazyLock<Mutex<ulid::Generator>> =
    LazyLock::new(|| Mutex::new(ulid::Generator::new()));

/// Mint a ULID that is strictly greater than every ULID previously minted
/// by this process.
///
/// Falls back to a plain random ULID if the generator overflows its
/// random component within one millisecond or the lock is poisoned.
pub fn next_ulid() -> Ulid {
    match GENERATOR.lock() {
        Ok(mut generator) => generator.generate().unwrap_or_else(|_| Ulid::new()),
        Err(_) => Ulid::new(),
    }
}

/// Split `{prefix}_{ulid}` and check the prefix.
#[doc(hidden)]
pub fn parse_prefixed(expected: &'static str, s: &str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    let (prefix, raw) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }
    raw.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
