use crate::call::{self, CallDescriptor, MAX_ARGS};
use crate::config::CoverageSettings;
use crate::cover::{CoverError, CoverageContext, CoverageResult};
use crate::kernel::CoverageKernel;
use crate::normalize::{self, FAILURE};
use crate::report::{CallRecord, ReplyWriter, ReportError};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Cover(#[from] CoverError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Id of the worker most recently handed a call.
///
/// A worker whose id is no longer the latest when it reports was overtaken while its
/// call was running, and its reply carries the blocked flag.
#[derive(Debug, Clone)]
pub struct LastScheduled(Arc<AtomicUsize>);

impl LastScheduled {
    const NONE: usize = usize::MAX;

    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(Self::NONE)))
    }

    pub fn mark(&self, worker: usize) {
        self.0.store(worker, Ordering::SeqCst);
    }

    pub fn is(&self, worker: usize) -> bool {
        self.0.load(Ordering::SeqCst) == worker
    }
}

impl Default for LastScheduled {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply channel shared by all workers. Each record is written under the lock.
pub type SharedReplyWriter<W> = Arc<Mutex<ReplyWriter<W>>>;

pub fn shared_writer<W: Write>(writer: ReplyWriter<W>) -> SharedReplyWriter<W> {
    Arc::new(Mutex::new(writer))
}

/// Runs calls on one thread and reports each of them.
///
/// A worker must be built on the thread it runs calls on, since enabling coverage
/// instruments the calling thread.
pub struct Worker<K: CoverageKernel, W: Write> {
    id: usize,
    cover: Option<CoverageContext<K>>,
    channel: SharedReplyWriter<W>,
    schedule: LastScheduled,
    record: CallRecord,
}

impl<K: CoverageKernel, W: Write> Worker<K, W> {
    /// Creates a worker, enabling coverage for the calling thread when a context is
    /// given.
    pub fn new(
        id: usize,
        mut cover: Option<CoverageContext<K>>,
        channel: SharedReplyWriter<W>,
        schedule: LastScheduled,
    ) -> Result<Self, WorkerError> {
        if let Some(ctx) = cover.as_mut() {
            ctx.open()?;
            ctx.enable()?;
        }
        Ok(Self {
            id,
            cover,
            channel,
            schedule,
            record: CallRecord::default(),
        })
    }

    /// Creates a worker from the `[coverage]` settings.
    pub fn from_settings(
        id: usize,
        kernel: K,
        settings: &CoverageSettings,
        channel: SharedReplyWriter<W>,
        schedule: LastScheduled,
    ) -> Result<Self, WorkerError> {
        let cover = if settings.enabled {
            Some(CoverageContext::new(
                kernel,
                settings.capacity,
                settings.pcs_file.clone(),
                settings.pc_fixup,
            )?)
        } else {
            None
        };
        Self::new(id, cover, channel, schedule)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn last_call(&self) -> &CallRecord {
        &self.record
    }

    pub fn coverage(&self) -> Option<&CoverageContext<K>> {
        self.cover.as_ref()
    }

    /// Runs `run` as call `call_index` between a coverage reset and collect, then reports
    /// it as finished. Returns the call's result.
    pub fn execute_with<F>(
        &mut self,
        call_index: u32,
        call_num: u32,
        fault_injected: bool,
        run: F,
    ) -> Result<isize, WorkerError>
    where
        F: FnOnce() -> isize,
    {
        self.schedule.mark(self.id);
        self.record = CallRecord {
            call_index,
            call_num,
            res: 0,
            reserrno: 0,
            fault_injected,
        };
        if let Some(ctx) = self.cover.as_mut() {
            ctx.reset()?;
        }

        let res = run();
        // Read before collecting: the PC table read may clobber errno.
        let reserrno = if res == FAILURE {
            normalize::errno() as u32
        } else {
            0
        };
        self.record.res = res;
        self.record.reserrno = reserrno;

        if let Some(ctx) = self.cover.as_mut() {
            ctx.collect()?;
            ctx.protect();
        }
        self.report(true)?;
        Ok(res)
    }

    /// Runs `call` through the normalizer and reports it.
    ///
    /// # Safety
    ///
    /// Same contract as [`call::execute_syscall`].
    pub unsafe fn execute_call(
        &mut self,
        call_index: u32,
        call_num: u32,
        call: &CallDescriptor,
        args: &[isize; MAX_ARGS],
        fault_injected: bool,
    ) -> Result<isize, WorkerError> {
        // SAFETY: upheld by the caller.
        self.execute_with(call_index, call_num, fault_injected, || unsafe {
            call::execute_syscall(call, args)
        })
    }

    /// Reports the current call, with the coverage of the latest collection.
    pub fn report(&mut self, finished: bool) -> Result<(), WorkerError> {
        let blocked = !self.schedule.is(self.id);
        let cov = self
            .cover
            .as_ref()
            .map_or(CoverageResult::EMPTY, |ctx| ctx.result());
        let mut channel = self
            .channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channel.write_call_output(&self.record, finished, blocked, &cov)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::DEFAULT_PC_FIXUP;
    use crate::kernel::{KernelError, SimulatedKernel, Status};
    use crate::normalize::set_errno;
    use crate::report::{
        CALL_FLAG_BLOCKED, CALL_FLAG_EXECUTED, CALL_FLAG_FINISHED, CALL_REPLY_SIZE, Reply,
        ReplyReader, ReportFlags, UNFINISHED_ERRNO,
    };
    use std::thread;
    use tempfile::NamedTempFile;

    const A: u64 = 0xffff_ffff_8010_0000;
    const B: u64 = 0xffff_ffff_8020_1234;

    fn table_file(pcs: &[u64]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for pc in pcs {
            file.write_all(&pc.to_ne_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn coverage_flags() -> ReportFlags {
        ReportFlags {
            coverage: true,
            collect_cover: false,
        }
    }

    fn replies(channel: &SharedReplyWriter<Vec<u8>>) -> Vec<Reply> {
        let bytes = channel.lock().unwrap().get_ref().clone();
        ReplyReader::new(bytes.as_slice())
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn worker_with_coverage(
        id: usize,
        kernel: SimulatedKernel,
        table: &NamedTempFile,
        channel: &SharedReplyWriter<Vec<u8>>,
        schedule: &LastScheduled,
    ) -> Worker<SimulatedKernel, Vec<u8>> {
        let ctx = CoverageContext::new(kernel, 16, table.path(), DEFAULT_PC_FIXUP).unwrap();
        Worker::new(id, Some(ctx), channel.clone(), schedule.clone()).unwrap()
    }

    #[test]
    fn single_changed_location_is_reported_end_to_end() {
        let table = table_file(&[A, B]);
        let kernel = SimulatedKernel::new(16);
        kernel.set_counter(0, 0);
        kernel.set_counter(1, 5);
        let channel = shared_writer(ReplyWriter::new(Vec::new(), coverage_flags()));
        let schedule = LastScheduled::new();
        let mut worker = worker_with_coverage(0, kernel.clone(), &table, &channel, &schedule);

        let res = worker
            .execute_with(0, 42, false, || {
                kernel.hit(1);
                0
            })
            .unwrap();
        assert_eq!(res, 0);

        let bytes = channel.lock().unwrap().get_ref().clone();
        assert_eq!(bytes.len(), CALL_REPLY_SIZE + 4);
        let payload = u32::from_ne_bytes(bytes[CALL_REPLY_SIZE..].try_into().unwrap());
        assert_eq!(payload, ((B + 1) & 0xFFFF_FFFF) as u32);

        match &replies(&channel)[0] {
            Reply::Call { reply, signal, cover } => {
                assert_eq!(reply.body.call_num, 42);
                assert_eq!(reply.body.signal_size, 1);
                assert_eq!(reply.body.cover_size, 0);
                assert_eq!(reply.body.reserrno, 0);
                assert_eq!(reply.body.flags, CALL_FLAG_EXECUTED | CALL_FLAG_FINISHED);
                assert_eq!(signal, &vec![0x8020_1235]);
                assert!(cover.is_empty());
            }
            other => panic!("Expected a call reply, got {other:?}"),
        }
    }

    #[test]
    fn each_call_gets_a_fresh_baseline() {
        let table = table_file(&[A, B]);
        let kernel = SimulatedKernel::new(16);
        let channel = shared_writer(ReplyWriter::new(Vec::new(), coverage_flags()));
        let schedule = LastScheduled::new();
        let mut worker = worker_with_coverage(0, kernel.clone(), &table, &channel, &schedule);

        worker.execute_with(0, 1, false, || {
            kernel.hit(0);
            0
        })
        .unwrap();
        worker.execute_with(1, 2, false, || 0).unwrap();

        let sizes: Vec<u32> = replies(&channel)
            .iter()
            .map(|reply| match reply {
                Reply::Call { reply, .. } => reply.body.signal_size,
                Reply::Completed { .. } => panic!("unexpected completion record"),
            })
            .collect();
        assert_eq!(sizes, vec![1, 0]);
    }

    extern "C" fn zx_bad_state(
        _: isize,
        _: isize,
        _: isize,
        _: isize,
        _: isize,
        _: isize,
        _: isize,
        _: isize,
        _: isize,
    ) -> isize {
        Status::ERR_BAD_STATE.0 as isize
    }

    #[test]
    fn native_failure_errno_reaches_the_reply() {
        let channel = shared_writer(ReplyWriter::new(Vec::new(), ReportFlags::default()));
        let mut worker: Worker<SimulatedKernel, Vec<u8>> =
            Worker::new(0, None, channel.clone(), LastScheduled::new()).unwrap();
        set_errno(0);
        let call = CallDescriptor::new("zx_port_wait", zx_bad_state, 3);
        let res = unsafe { worker.execute_call(7, 99, &call, &[0; MAX_ARGS], true) }.unwrap();
        assert_eq!(res, FAILURE);
        assert_eq!(worker.last_call().reserrno, 20);

        match &replies(&channel)[0] {
            Reply::Call { reply, signal, .. } => {
                assert_eq!(reply.body.call_index, 7);
                assert_eq!(reply.body.reserrno, 20);
                assert!(signal.is_empty());
            }
            other => panic!("Expected a call reply, got {other:?}"),
        }
    }

    #[test]
    fn overtaken_worker_reports_blocked_and_unfinished() {
        let channel = shared_writer(ReplyWriter::new(Vec::new(), ReportFlags::default()));
        let schedule = LastScheduled::new();
        let mut first: Worker<SimulatedKernel, Vec<u8>> =
            Worker::new(1, None, channel.clone(), schedule.clone()).unwrap();

        first
            .execute_with(0, 5, false, || {
                schedule.mark(2);
                0
            })
            .unwrap();
        first.report(false).unwrap();

        let all = replies(&channel);
        let flags: Vec<(u32, u32)> = all
            .iter()
            .map(|reply| match reply {
                Reply::Call { reply, .. } => (reply.body.flags, reply.body.reserrno),
                Reply::Completed { .. } => panic!("unexpected completion record"),
            })
            .collect();
        assert_eq!(
            flags,
            vec![
                (CALL_FLAG_EXECUTED | CALL_FLAG_FINISHED | CALL_FLAG_BLOCKED, 0),
                (CALL_FLAG_EXECUTED | CALL_FLAG_BLOCKED, UNFINISHED_ERRNO),
            ]
        );
    }

    #[test]
    fn workers_on_separate_threads_keep_separate_coverage() {
        let table = table_file(&[A, B]);
        let kernel = SimulatedKernel::new(16);
        let channel = shared_writer(ReplyWriter::new(Vec::new(), coverage_flags()));
        let schedule = LastScheduled::new();

        let handles: Vec<_> = (0..2usize)
            .map(|id| {
                let kernel = kernel.clone();
                let channel = channel.clone();
                let schedule = schedule.clone();
                let path = table.path().to_path_buf();
                thread::spawn(move || {
                    let ctx = CoverageContext::new(kernel, 16, path, DEFAULT_PC_FIXUP).unwrap();
                    let mut worker = Worker::new(id, Some(ctx), channel, schedule).unwrap();
                    worker.execute_with(id as u32, 0, false, || 0).unwrap();
                    thread::current().id()
                })
            })
            .collect();
        for handle in handles {
            let tid = handle.join().unwrap();
            assert!(kernel.is_enabled_for(tid));
        }
        assert!(!kernel.is_enabled_for(thread::current().id()));
        assert_eq!(replies(&channel).len(), 2);
    }

    #[test]
    fn context_moved_off_its_thread_cannot_snapshot() {
        let table = table_file(&[A]);
        let mut ctx =
            CoverageContext::new(SimulatedKernel::new(4), 4, table.path(), DEFAULT_PC_FIXUP)
                .unwrap();
        ctx.enable().unwrap();
        let err = thread::spawn(move || ctx.reset().unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(
            err,
            CoverError::Kernel(KernelError::Fetch(Status::ERR_BAD_STATE))
        ));
    }

    #[test]
    fn enable_failure_prevents_worker_creation() {
        let kernel = SimulatedKernel::new(4);
        kernel.fail_enable_with(Status::ERR_NOT_SUPPORTED);
        let channel = shared_writer(ReplyWriter::new(Vec::new(), coverage_flags()));
        let settings = CoverageSettings {
            capacity: 4,
            ..CoverageSettings::default()
        };
        let result = Worker::from_settings(0, kernel, &settings, channel, LastScheduled::new());
        match result {
            Err(WorkerError::Cover(CoverError::Kernel(KernelError::Enable(status)))) => {
                assert_eq!(status, Status::ERR_NOT_SUPPORTED)
            }
            Err(e) => panic!("Expected an enable failure, got {e:?}"),
            Ok(_) => panic!("Expected an enable failure, got a worker"),
        }
    }

    #[test]
    fn disabled_coverage_skips_the_kernel() {
        let kernel = SimulatedKernel::new(4);
        let probe = kernel.clone();
        let channel = shared_writer(ReplyWriter::new(Vec::new(), ReportFlags::default()));
        let settings = CoverageSettings {
            enabled: false,
            ..CoverageSettings::default()
        };
        let mut worker =
            Worker::from_settings(0, kernel, &settings, channel.clone(), LastScheduled::new())
                .unwrap();
        assert!(worker.coverage().is_none());
        worker.execute_with(0, 0, false, || 0).unwrap();
        assert_eq!(probe.refreshes(), 0);
        assert_eq!(replies(&channel).len(), 1);
    }
}
