//! Resource limits for spawned processes.

use corral_common::types::ResourceLimits;
use nix::sys::resource::{Resource, setrlimit};

/// Returns the `(resource, value)` pairs that are set in `limits`.
///
/// The list is fixed-size so it can be computed before `fork(2)` and
/// applied without allocating in the child.
#[must_use]
pub fn settings(limits: &ResourceLimits) -> [(Resource, Option<u64>); 9] {
    [
        (Resource::RLIMIT_AS, limits.r#as),
        (Resource::RLIMIT_CORE, limits.core),
        (Resource::RLIMIT_CPU, limits.cpu),
        (Resource::RLIMIT_DATA, limits.data),
        (Resource::RLIMIT_FSIZE, limits.fsize),
        (Resource::RLIMIT_MEMLOCK, limits.memlock),
        (Resource::RLIMIT_NOFILE, limits.nofile),
        (Resource::RLIMIT_NPROC, limits.nproc),
        (Resource::RLIMIT_STACK, limits.stack),
    ]
}

/// Applies precomputed limits to the calling process.
///
/// Each value becomes both the soft and the hard limit.
///
/// # Errors
///
/// Returns the first `setrlimit(2)` failure.
pub fn apply(settings: &[(Resource, Option<u64>)]) -> nix::Result<()> {
    for &(resource, value) in settings {
        if let Some(value) = value {
            setrlimit(resource, value, value)?;
        }
    }
    Ok(())
}
