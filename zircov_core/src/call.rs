use crate::normalize::{self, CallClass};
use std::fmt;

/// Most arguments any call takes.
pub const MAX_ARGS: usize = 9;

/// Every native callable is invoked through this signature; unused trailing arguments
/// are ignored by the callee.
pub type SyscallFn = unsafe extern "C" fn(
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
    isize,
) -> isize;

/// One entry of the call table, classified when the table is built.
#[derive(Clone, Copy)]
pub struct CallDescriptor {
    name: &'static str,
    func: SyscallFn,
    arity: usize,
    class: CallClass,
}

impl CallDescriptor {
    pub fn new(name: &'static str, func: SyscallFn, arity: usize) -> Self {
        Self {
            name,
            func,
            arity: arity.min(MAX_ARGS),
            class: CallClass::of(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn class(&self) -> CallClass {
        self.class
    }
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("class", &self.class)
            .finish()
    }
}

/// Runs `call` and normalizes its result.
///
/// Arguments past the call's arity are passed as zero.
///
/// # Safety
///
/// `call.func` must be safe to invoke with `args` interpreted the way the callee
/// expects.
pub unsafe fn execute_syscall(call: &CallDescriptor, args: &[isize; MAX_ARGS]) -> isize {
    let mut a = [0isize; MAX_ARGS];
    a[..call.arity].copy_from_slice(&args[..call.arity]);
    // SAFETY: upheld by the caller.
    let raw = unsafe { (call.func)(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8]) };
    normalize::normalize(call.class, raw)
}
