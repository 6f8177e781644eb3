//! Remote store adapters
//!
//! - [`MemoryRemoteStore`]: in-process store with a real change log, used by
//!   tests and for dry runs
//! - [`DirectoryRemoteStore`]: a second directory acting as the remote,
//!   used by the daemon
//!
//! Both enforce the same naming rules through [`validate_path`].

pub mod directory;
pub mod memory;

pub use directory::DirectoryRemoteStore;
pub use memory::MemoryRemoteStore;

use driftsync_core::domain::{DomainError, RemotePath};
use driftsync_core::ports::RemoteError;

/// Device names the remote refuses regardless of extension
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Checks one path component against the remote naming rules
///
/// # Errors
/// `RemoteError::InvalidName` for backslashes, control characters, trailing
/// spaces or dots, and reserved device names.
pub fn validate_name(name: &str) -> Result<(), RemoteError> {
    let invalid = || RemoteError::InvalidName(name.to_string());

    if name.is_empty() || name.contains('\\') || name.chars().any(char::is_control) {
        return Err(invalid());
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return Err(invalid());
    }
    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Err(invalid());
    }
    Ok(())
}

/// Checks every component of `path`
pub fn validate_path(path: &RemotePath) -> Result<(), RemoteError> {
    path.as_str()
        .split('/')
        .filter(|c| !c.is_empty())
        .try_for_each(validate_name)
        .map_err(|_| RemoteError::InvalidName(path.to_string()))
}

/// Re-parents `path` (at or below `from`) onto `to`
///
/// Components below `from` keep their casing; `to` supplies the new prefix.
pub(crate) fn rebase_path(
    path: &RemotePath,
    from: &RemotePath,
    to: &RemotePath,
) -> Result<RemotePath, DomainError> {
    let depth = from.as_str().split('/').filter(|c| !c.is_empty()).count();
    path.as_str()
        .split('/')
        .filter(|c| !c.is_empty())
        .skip(depth)
        .try_fold(to.clone(), |acc, component| acc.join(component))
}
