//! Per-thread coverage collection.
//!
//! A [`CoverageContext`] owns every table the diff needs, sized once from the configured
//! capacity. Each call goes through `reset` (baseline snapshot), the call itself, and
//! `collect` (current snapshot, PC table re-read, diff). Nothing is allocated per call.

use crate::kernel::{CounterRegion, CoverageKernel, KernelError};
use crate::snapshot::{self, SnapshotError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default number of instrumentation slots.
pub const MAX_COVSZ: usize = 1 << 20;

/// Sancov records the return address minus one on x86_64; adding one points back at a
/// valid PC.
pub const DEFAULT_PC_FIXUP: u64 = 1;

#[derive(Error, Debug)]
pub enum CoverError {
    #[error("coverage capacity must be at least one slot")]
    ZeroCapacity,
    #[error("coverage is not enabled on this thread")]
    NotEnabled,
    #[error("coverage collected without a baseline; call reset first")]
    NoBaseline,
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Snapshot(SnapshotError),
}

impl From<SnapshotError> for CoverError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Kernel(e) => CoverError::Kernel(e),
            other => CoverError::Snapshot(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverState {
    Uninitialized,
    Enabled,
    Baseline,
    Collected,
}

/// Hits from the latest [`CoverageContext::collect`], borrowed from the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoverageResult<'a> {
    pub size: usize,
    pub hits: &'a [u32],
}

impl<'a> CoverageResult<'a> {
    pub const EMPTY: CoverageResult<'static> = CoverageResult { size: 0, hits: &[] };

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Appends every changed, instrumented location to `out` and returns how many were
/// written.
///
/// Slot `i` is a hit when `pcs[i] != 0` and `baseline[i] != current[i]`. Hits keep table
/// order and are stored as `(pc + fixup)` truncated to 32 bits. Only the common prefix
/// of the three tables is compared, and hits beyond `out.len()` are dropped.
pub fn diff_counters(
    pcs: &[u64],
    baseline: &[u64],
    current: &[u64],
    fixup: u64,
    out: &mut [u32],
) -> usize {
    let hits = pcs
        .iter()
        .zip(baseline)
        .zip(current)
        .filter(|((pc, before), after)| **pc != 0 && before != after)
        .map(|((pc, _), _)| pc.wrapping_add(fixup) as u32);
    let mut written = 0;
    for (slot, hit) in out.iter_mut().zip(hits) {
        *slot = hit;
        written += 1;
    }
    written
}

/// Coverage state for one worker thread.
///
/// The context must be created and used on the thread whose coverage it records; the
/// kernel enables instrumentation for the calling thread only.
pub struct CoverageContext<K: CoverageKernel> {
    kernel: K,
    region: Option<CounterRegion<K::Region>>,
    state: CoverState,
    pcs_file: PathBuf,
    pc_fixup: u64,
    baseline_counts: Vec<u64>,
    current_counts: Vec<u64>,
    location_table: Vec<u64>,
    truncated_hits: Vec<u32>,
    total_locations: usize,
    num_hits: usize,
}

impl<K: CoverageKernel> CoverageContext<K> {
    /// Allocates all tables for `capacity` slots.
    pub fn new(
        kernel: K,
        capacity: usize,
        pcs_file: impl Into<PathBuf>,
        pc_fixup: u64,
    ) -> Result<Self, CoverError> {
        if capacity == 0 {
            return Err(CoverError::ZeroCapacity);
        }
        Ok(Self {
            kernel,
            region: None,
            state: CoverState::Uninitialized,
            pcs_file: pcs_file.into(),
            pc_fixup,
            baseline_counts: vec![0; capacity],
            current_counts: vec![0; capacity],
            location_table: vec![0; capacity],
            truncated_hits: vec![0; capacity],
            total_locations: 0,
            num_hits: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.location_table.len()
    }

    pub fn state(&self) -> CoverState {
        self.state
    }

    pub fn pcs_file(&self) -> &Path {
        &self.pcs_file
    }

    /// Number of PC table entries seen by the latest collection.
    pub fn total_locations(&self) -> usize {
        self.total_locations
    }

    /// Nothing to open on Zircon; kept so every backend exposes the same steps.
    pub fn open(&mut self) -> Result<(), CoverError> {
        Ok(())
    }

    /// Enables coverage for the calling thread and provisions the counter region.
    ///
    /// Either both steps succeed or the context stays uninitialized.
    pub fn enable(&mut self) -> Result<(), CoverError> {
        self.kernel.enable_current_thread()?;
        let capacity = self.capacity();
        let region = CounterRegion::create(&mut self.kernel, capacity)?;
        log::info!(
            "coverage enabled: {} slots, pc table {}",
            region.slots(),
            self.pcs_file.display()
        );
        self.region = Some(region);
        self.state = CoverState::Enabled;
        Ok(())
    }

    /// Takes the baseline snapshot for the next call.
    pub fn reset(&mut self) -> Result<(), CoverError> {
        let region = self.region.as_ref().ok_or(CoverError::NotEnabled)?;
        let count = self.baseline_counts.len();
        let baseline = &mut self.baseline_counts;
        snapshot::read_counter_snapshot(&mut self.kernel, region, baseline, count)?;
        self.num_hits = 0;
        self.state = CoverState::Baseline;
        Ok(())
    }

    /// Snapshots the counters, re-reads the PC table and diffs against the baseline.
    pub fn collect(&mut self) -> Result<CoverageResult<'_>, CoverError> {
        let region = match (self.state, self.region.as_ref()) {
            (CoverState::Uninitialized, _) | (_, None) => return Err(CoverError::NotEnabled),
            (CoverState::Enabled, _) => return Err(CoverError::NoBaseline),
            (_, Some(region)) => region,
        };
        let count = self.current_counts.len();
        let current = &mut self.current_counts;
        snapshot::read_counter_snapshot(&mut self.kernel, region, current, count)?;
        self.total_locations =
            snapshot::read_location_table(&self.pcs_file, &mut self.location_table)?;

        let n = self.total_locations;
        self.num_hits = diff_counters(
            &self.location_table[..n],
            &self.baseline_counts[..n],
            &self.current_counts[..n],
            self.pc_fixup,
            &mut self.truncated_hits,
        );
        self.state = CoverState::Collected;
        Ok(self.result())
    }

    /// Hits from the latest collection, or an empty result if none has happened since
    /// the last reset.
    pub fn result(&self) -> CoverageResult<'_> {
        CoverageResult {
            size: self.num_hits,
            hits: &self.truncated_hits[..self.num_hits],
        }
    }

    /// No-op on Zircon: the hit table is not exposed to the test program.
    pub fn protect(&mut self) {}
}
