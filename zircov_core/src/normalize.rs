//! Maps Zircon status returns onto the `-1` + `errno` convention the executor uses for
//! every call.

use crate::kernel::Status;

/// Prefix shared by every kernel-native syscall name.
pub const NATIVE_PREFIX: &str = "zx_";

/// Native calls whose return value is data, not a status.
pub const NON_STATUS_CALLS: &[&str] = &[
    "zx_debuglog_read",
    "zx_clock_get",
    "zx_clock_get_monotonic",
    "zx_deadline_after",
    "zx_ticks_get",
];

/// Returned for every failed call.
pub const FAILURE: isize = -1;

const ERRNO_MASK: isize = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// A `zx_*` syscall returning a `zx_status_t`.
    Native,
    /// A `zx_*` syscall returning an arbitrary value.
    NativeNonStatus,
    /// A libc-style call cast to return `isize`.
    Conventional,
}

impl CallClass {
    pub fn of(name: &str) -> CallClass {
        if !name.starts_with(NATIVE_PREFIX) {
            CallClass::Conventional
        } else if NON_STATUS_CALLS.iter().any(|&call| call == name) {
            CallClass::NativeNonStatus
        } else {
            CallClass::Native
        }
    }
}

/// Normalizes `raw` according to `class`.
///
/// A failing native call stores `(-raw) & 0x7f` in the calling thread's `errno` and
/// returns [`FAILURE`]. A conventional call that returned a 32-bit `-1` zero-extended to
/// `0xffff_ffff` gets its sign back.
pub fn normalize(class: CallClass, raw: isize) -> isize {
    match class {
        CallClass::NativeNonStatus => 0,
        CallClass::Native if raw == Status::OK.0 as isize => 0,
        CallClass::Native => {
            set_errno((raw.wrapping_neg() & ERRNO_MASK) as i32);
            FAILURE
        }
        CallClass::Conventional if raw as usize as u64 == u64::from(u32::MAX) => FAILURE,
        CallClass::Conventional => raw,
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns a valid pointer to the calling thread's errno.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns a valid pointer to the calling thread's errno.
    unsafe { libc::__error() }
}

/// Sets the calling thread's `errno`.
pub fn set_errno(code: i32) {
    // SAFETY: the pointer is valid and only this thread writes through it.
    unsafe {
        *errno_location() = code;
    }
}

/// Reads the calling thread's `errno`.
pub fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
