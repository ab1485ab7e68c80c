pub mod call;
pub mod config;
pub mod cover;
pub mod executor;
pub mod kernel;
pub mod normalize;
pub mod report;
pub mod snapshot;

pub use call::{CallDescriptor, MAX_ARGS, SyscallFn};
pub use config::ExecutorConfig;
pub use cover::{CoverError, CoverageContext, CoverageResult};
pub use executor::{LastScheduled, Worker, WorkerError};
pub use kernel::{CoverageKernel, KernelError, SimulatedKernel, Status};
pub use normalize::CallClass;
pub use report::{CallRecord, Reply, ReplyReader, ReplyWriter, ReportError, ReportFlags};
pub use snapshot::SnapshotError;

/// Exit status of an executor that hit an unrecoverable error.
pub const FAIL_STATUS: i32 = 67;

/// Logs `err` and terminates the process.
///
/// Coverage and reply state cannot be repaired in-process once a kernel call, the PC
/// table or the control pipe has failed, so the supervisor restarts the executor.
pub fn fail(err: impl std::fmt::Display) -> ! {
    log::error!("{err}");
    eprintln!("SYZFAIL: {err}");
    std::process::exit(FAIL_STATUS)
}
