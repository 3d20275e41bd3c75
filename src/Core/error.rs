use super::status::Status;
use crate::ffi::{RawStatus, STATUS_NOT_FOUND, STATUS_OK};
use std::time::Duration;
use thiserror::Error;

/// Key of an entry in a callback registration table.
pub type CallbackKey = u64;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The wrapper was used before its native peer was created.
    #[error("native peer has not been created")]
    NotInitialized,

    /// `create` was called on a wrapper that is already bound.
    #[error("native peer already created")]
    AlreadyCreated,

    /// Rejected before crossing the native boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Any non-zero status returned by the engine.
    #[error("native call failed: {0}")]
    Native(Status),

    /// The registration was already resolved, or never existed.
    #[error("no callback registered under key {0}")]
    KeyNotFound(CallbackKey),

    /// A destroy-with-wait did not complete before its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    pub fn status(&self) -> Option<Status> {
        match self {
            BridgeError::Native(status) => Some(*status),
            _ => None,
        }
    }
}

/// Translate a native status into a `Result`.
pub fn check(code: RawStatus) -> Result<()> {
    if code == STATUS_OK {
        Ok(())
    } else {
        Err(BridgeError::Native(Status::from_code(code)))
    }
}

/// Like [`check`], but `NOT_FOUND` is reported as `Ok(false)` for the
/// `try_*` accessors.
pub fn check_found(code: RawStatus) -> Result<bool> {
    match code {
        STATUS_OK => Ok(true),
        STATUS_NOT_FOUND => Ok(false),
        other => Err(BridgeError::Native(Status::from_code(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_maps_codes() {
        assert_eq!(check(0), Ok(()));
        assert_eq!(check(4), Err(BridgeError::Native(Status::InvalidArg)));
        assert_eq!(check(6).unwrap_err().status(), Some(Status::NotFound));
    }

    #[test]
    fn check_found_only_swallows_not_found() {
        assert_eq!(check_found(0), Ok(true));
        assert_eq!(check_found(6), Ok(false));
        assert_eq!(check_found(19), Err(BridgeError::Native(Status::WrongFieldType)));
    }
}
