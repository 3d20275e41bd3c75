// String marshaling across the native boundary.

use crate::Core::{BridgeError, Result};
use libc::c_char;
use std::ffi::{CStr, CString};
use std::ptr;

/// NUL-terminated copy of `value`. Interior NULs cannot be represented.
pub(crate) fn c_string(value: &str, what: &'static str) -> Result<CString> {
    CString::new(value).map_err(|_| BridgeError::InvalidArgument(what))
}

pub(crate) fn opt_c_string(value: Option<&str>, what: &'static str) -> Result<Option<CString>> {
    value.map(|v| c_string(v, what)).transpose()
}

/// Pointer for an optional string; null when absent.
pub(crate) fn opt_ptr(value: &Option<CString>) -> *const c_char {
    value.as_ref().map_or(ptr::null(), |v| v.as_ptr())
}

/// Copy a string the engine handed out. Null reads as empty.
///
/// # Safety
/// `raw` must be null or point at a NUL-terminated string that stays valid
/// for the duration of the call.
pub(crate) unsafe fn copy_c_str(raw: *const c_char) -> String {
    if raw.is_null() {
        return String::new();
    }
    CStr::from_ptr(raw).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_interior_nul() {
        assert_eq!(
            c_string("bad\0topic", "topic").unwrap_err(),
            BridgeError::InvalidArgument("topic")
        );
    }

    #[test]
    fn optional_strings() {
        let none = opt_c_string(None, "source").unwrap();
        assert!(opt_ptr(&none).is_null());

        let some = opt_c_string(Some("NYSE"), "source").unwrap();
        assert_eq!(unsafe { copy_c_str(opt_ptr(&some)) }, "NYSE");
        assert_eq!(unsafe { copy_c_str(ptr::null()) }, "");
    }
}
