//! Kernel coverage control.
//!
//! Coverage on Zircon is a per-thread resource: a thread first asks the kernel to
//! instrument it, then repeatedly asks the kernel to expose its live execution counters
//! into a VMO that the thread owns. [`CoverageKernel`] is the seam over those two
//! operations; [`zircon::ZirconKernel`] talks to the real kernel and
//! [`SimulatedKernel`] keeps the counters in process memory.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use thiserror::Error;

/// A raw Zircon status code (`zx_status_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const ERR_INTERNAL: Status = Status(-1);
    pub const ERR_NOT_SUPPORTED: Status = Status(-2);
    pub const ERR_NO_RESOURCES: Status = Status(-3);
    pub const ERR_NO_MEMORY: Status = Status(-4);
    pub const ERR_INVALID_ARGS: Status = Status(-10);
    pub const ERR_BAD_HANDLE: Status = Status(-11);
    pub const ERR_OUT_OF_RANGE: Status = Status(-14);
    pub const ERR_BAD_STATE: Status = Status(-20);
    pub const ERR_ACCESS_DENIED: Status = Status(-30);

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "ZX_OK",
            -1 => "ZX_ERR_INTERNAL",
            -2 => "ZX_ERR_NOT_SUPPORTED",
            -3 => "ZX_ERR_NO_RESOURCES",
            -4 => "ZX_ERR_NO_MEMORY",
            -10 => "ZX_ERR_INVALID_ARGS",
            -11 => "ZX_ERR_BAD_HANDLE",
            -12 => "ZX_ERR_WRONG_TYPE",
            -14 => "ZX_ERR_OUT_OF_RANGE",
            -15 => "ZX_ERR_BUFFER_TOO_SMALL",
            -20 => "ZX_ERR_BAD_STATE",
            -21 => "ZX_ERR_TIMED_OUT",
            -24 => "ZX_ERR_PEER_CLOSED",
            -25 => "ZX_ERR_NOT_FOUND",
            -30 => "ZX_ERR_ACCESS_DENIED",
            -40 => "ZX_ERR_IO",
            _ => "ZX_ERR_UNKNOWN",
        }
    }

    pub fn into_result(self) -> Result<(), Status> {
        if self == Status::OK { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Failures reported by the kernel coverage interface.
///
/// Every variant means the thread cannot produce trustworthy coverage; callers escalate
/// them to process termination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("failed to enable coverage. err: {0}")]
    Enable(Status),
    #[error("failed to create covcount region. err: {0}")]
    CreateRegion(Status),
    #[error("failed to fetch coverage. err: {0}")]
    Fetch(Status),
    #[error("failed to copy coverage. err: {0}")]
    Copy(Status),
    #[error("counter read of {requested} slots exceeds region of {slots} slots")]
    RegionBounds { requested: usize, slots: usize },
}

/// Kernel operations consumed by the coverage lifecycle.
///
/// `Region` is an owned handle to the memory the kernel exposes counters into. It is
/// released when dropped.
pub trait CoverageKernel {
    type Region;

    /// Turns on coverage instrumentation for the calling thread only.
    fn enable_current_thread(&mut self) -> Result<(), KernelError>;

    /// Creates a region able to hold `size_bytes` bytes of counters.
    fn create_region(&mut self, size_bytes: usize) -> Result<Self::Region, KernelError>;

    /// Asks the kernel to copy the calling thread's live counters into `region`.
    fn refresh(&mut self, region: &Self::Region) -> Result<(), KernelError>;

    /// Copies the first `dst.len()` counters out of `region`.
    fn read(&mut self, region: &Self::Region, dst: &mut [u64]) -> Result<(), KernelError>;
}

/// Owned counter region sized in slots.
///
/// The raw handle never leaves this type; the only way to get counters out is
/// [`CounterRegion::snapshot_into`], which checks the destination against the region.
#[derive(Debug)]
pub struct CounterRegion<R> {
    handle: R,
    slots: usize,
}

impl<R> CounterRegion<R> {
    pub fn create<K>(kernel: &mut K, slots: usize) -> Result<Self, KernelError>
    where
        K: CoverageKernel<Region = R>,
    {
        let handle = kernel.create_region(slots * size_of::<u64>())?;
        Ok(Self { handle, slots })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Refreshes the region and copies `dst.len()` counters into `dst`.
    pub fn snapshot_into<K>(&self, kernel: &mut K, dst: &mut [u64]) -> Result<(), KernelError>
    where
        K: CoverageKernel<Region = R>,
    {
        if dst.len() > self.slots {
            return Err(KernelError::RegionBounds {
                requested: dst.len(),
                slots: self.slots,
            });
        }
        kernel.refresh(&self.handle)?;
        kernel.read(&self.handle, dst)
    }
}

#[derive(Debug, Default)]
struct SimState {
    counters: Vec<u64>,
    regions: Vec<Vec<u64>>,
    enabled: HashSet<ThreadId>,
    fail_enable: Option<Status>,
    fail_create: Option<Status>,
    fail_fetch: Option<Status>,
    refreshes: usize,
}

/// An in-process stand-in for the kernel coverage interface.
///
/// Clones share the same counter table, so a test can keep one handle to drive the
/// counters while a [`crate::cover::CoverageContext`] owns another. Like the real
/// kernel, refreshing a region fails with `ZX_ERR_BAD_STATE` on a thread that never
/// enabled coverage.
#[derive(Debug, Clone, Default)]
pub struct SimulatedKernel {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedKernel {
    /// Creates a simulated kernel with `slots` zeroed counters.
    pub fn new(slots: usize) -> Self {
        let state = SimState {
            counters: vec![0; slots],
            ..SimState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_counter(&self, slot: usize, value: u64) {
        let mut state = self.lock();
        if slot >= state.counters.len() {
            state.counters.resize(slot + 1, 0);
        }
        state.counters[slot] = value;
    }

    /// Records one more execution of the location at `slot`.
    pub fn hit(&self, slot: usize) {
        let mut state = self.lock();
        if slot >= state.counters.len() {
            state.counters.resize(slot + 1, 0);
        }
        state.counters[slot] = state.counters[slot].wrapping_add(1);
    }

    pub fn fail_enable_with(&self, status: Status) {
        self.lock().fail_enable = Some(status);
    }

    pub fn fail_create_with(&self, status: Status) {
        self.lock().fail_create = Some(status);
    }

    pub fn fail_fetch_with(&self, status: Status) {
        self.lock().fail_fetch = Some(status);
    }

    pub fn is_enabled_for(&self, thread: ThreadId) -> bool {
        self.lock().enabled.contains(&thread)
    }

    /// Number of successful region refreshes so far.
    pub fn refreshes(&self) -> usize {
        self.lock().refreshes
    }
}

impl CoverageKernel for SimulatedKernel {
    type Region = usize;

    fn enable_current_thread(&mut self) -> Result<(), KernelError> {
        let mut state = self.lock();
        if let Some(status) = state.fail_enable {
            return Err(KernelError::Enable(status));
        }
        state.enabled.insert(thread::current().id());
        Ok(())
    }

    fn create_region(&mut self, size_bytes: usize) -> Result<usize, KernelError> {
        let mut state = self.lock();
        if let Some(status) = state.fail_create {
            return Err(KernelError::CreateRegion(status));
        }
        state.regions.push(vec![0; size_bytes / size_of::<u64>()]);
        Ok(state.regions.len() - 1)
    }

    fn refresh(&mut self, region: &usize) -> Result<(), KernelError> {
        let mut state = self.lock();
        if let Some(status) = state.fail_fetch {
            return Err(KernelError::Fetch(status));
        }
        if !state.enabled.contains(&thread::current().id()) {
            return Err(KernelError::Fetch(Status::ERR_BAD_STATE));
        }
        let SimState {
            counters, regions, ..
        } = &mut *state;
        let dst = regions
            .get_mut(*region)
            .ok_or(KernelError::Fetch(Status::ERR_BAD_HANDLE))?;
        let n = counters.len().min(dst.len());
        dst[..n].copy_from_slice(&counters[..n]);
        dst[n..].fill(0);
        state.refreshes += 1;
        Ok(())
    }

    fn read(&mut self, region: &usize, dst: &mut [u64]) -> Result<(), KernelError> {
        let state = self.lock();
        let src = state
            .regions
            .get(*region)
            .ok_or(KernelError::Copy(Status::ERR_BAD_HANDLE))?;
        if dst.len() > src.len() {
            return Err(KernelError::Copy(Status::ERR_OUT_OF_RANGE));
        }
        dst.copy_from_slice(&src[..dst.len()]);
        Ok(())
    }
}

#[cfg(target_os = "fuchsia")]
pub mod zircon {
    //! Bindings to the Zircon coverage syscalls.

    use super::{CoverageKernel, KernelError, Status};

    type ZxHandle = u32;

    const ZX_HANDLE_INVALID: ZxHandle = 0;
    const COVERAGE_ENABLE: u32 = 1;
    const COVERAGE_FETCH: u32 = 2;

    #[link(name = "zircon")]
    unsafe extern "C" {
        fn zx_thread_self() -> ZxHandle;
        fn zx_coverage_ctl(thread: ZxHandle, action: u32, vmo: ZxHandle) -> i32;
        fn zx_vmo_create(size: u64, options: u32, out: *mut ZxHandle) -> i32;
        fn zx_vmo_read(handle: ZxHandle, buffer: *mut u8, offset: u64, buffer_size: usize)
        -> i32;
        fn zx_handle_close(handle: ZxHandle) -> i32;
    }

    /// A VMO that receives the thread's counters. Closed on drop.
    #[derive(Debug)]
    pub struct Vmo(ZxHandle);

    impl Drop for Vmo {
        fn drop(&mut self) {
            // SAFETY: the handle was returned by zx_vmo_create and is owned by this value.
            unsafe {
                zx_handle_close(self.0);
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct ZirconKernel;

    impl ZirconKernel {
        pub fn new() -> Self {
            ZirconKernel
        }
    }

    impl CoverageKernel for ZirconKernel {
        type Region = Vmo;

        fn enable_current_thread(&mut self) -> Result<(), KernelError> {
            // SAFETY: plain syscalls on the calling thread's own handle.
            let status =
                unsafe { zx_coverage_ctl(zx_thread_self(), COVERAGE_ENABLE, ZX_HANDLE_INVALID) };
            Status(status).into_result().map_err(KernelError::Enable)
        }

        fn create_region(&mut self, size_bytes: usize) -> Result<Vmo, KernelError> {
            let mut handle = ZX_HANDLE_INVALID;
            // SAFETY: `handle` is a valid out-pointer for the duration of the call.
            let status = unsafe { zx_vmo_create(size_bytes as u64, 0, &mut handle) };
            Status(status)
                .into_result()
                .map_err(KernelError::CreateRegion)?;
            Ok(Vmo(handle))
        }

        fn refresh(&mut self, region: &Vmo) -> Result<(), KernelError> {
            // SAFETY: `region` holds a live VMO handle.
            let status = unsafe { zx_coverage_ctl(zx_thread_self(), COVERAGE_FETCH, region.0) };
            Status(status).into_result().map_err(KernelError::Fetch)
        }

        fn read(&mut self, region: &Vmo, dst: &mut [u64]) -> Result<(), KernelError> {
            // SAFETY: `dst` is valid for `size_of_val(dst)` bytes and every bit pattern
            // is a valid u64.
            let status = unsafe {
                zx_vmo_read(
                    region.0,
                    dst.as_mut_ptr().cast::<u8>(),
                    0,
                    std::mem::size_of_val(dst),
                )
            };
            Status(status).into_result().map_err(KernelError::Copy)
        }
    }
}
