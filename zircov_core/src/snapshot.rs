use crate::kernel::{CounterRegion, CoverageKernel, KernelError};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Location of the kernel's sancov PC table on a Zircon image.
pub const DEFAULT_PCS_FILE: &str = "/boot/kernel/data/zircon.elf.1.sancov";

const WORD: usize = size_of::<u64>();

/// Errors produced while snapshotting the PC table or the counters.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The PC table file could not be opened.
    #[error("could not open coverage file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading the PC table failed midway.
    #[error("failed to read coverage file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The PC table holds more entries than the buffer has slots.
    #[error("pc table is too small: '{path}' has more than {capacity} entries")]
    CapacityExceeded { path: PathBuf, capacity: usize },

    /// A counter snapshot asked for more slots than the destination holds.
    #[error("counter snapshot of {count} slots does not fit a {capacity}-slot buffer")]
    DestinationTooSmall { count: usize, capacity: usize },

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

enum Word {
    Full,
    Partial(usize),
    End,
}

fn read_word<R: Read>(reader: &mut R, word: &mut [u8; WORD]) -> io::Result<Word> {
    let mut filled = 0;
    while filled < WORD {
        match reader.read(&mut word[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(match filled {
        0 => Word::End,
        WORD => Word::Full,
        n => Word::Partial(n),
    })
}

/// Reads the PC table at `path` into `dst`, returning the number of entries read.
///
/// The whole of `dst` is usable. Once it is full, one more entry is probed for; finding
/// one means the table would have been truncated and is reported as
/// [`SnapshotError::CapacityExceeded`]. Trailing bytes that do not make up a whole
/// entry are ignored.
pub fn read_location_table(path: &Path, dst: &mut [u64]) -> Result<usize, SnapshotError> {
    let file = File::open(path).map_err(|source| SnapshotError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let read_err = |source: io::Error| SnapshotError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut word = [0u8; WORD];
    let mut count = 0;
    while count < dst.len() {
        match read_word(&mut reader, &mut word).map_err(read_err)? {
            Word::Full => {
                dst[count] = u64::from_ne_bytes(word);
                count += 1;
            }
            Word::Partial(n) => {
                log::warn!("ignoring {n} trailing bytes in {}", path.display());
                return Ok(count);
            }
            Word::End => return Ok(count),
        }
    }

    match read_word(&mut reader, &mut word).map_err(read_err)? {
        Word::Full => Err(SnapshotError::CapacityExceeded {
            path: path.to_path_buf(),
            capacity: dst.len(),
        }),
        Word::Partial(n) => {
            log::warn!("ignoring {n} trailing bytes in {}", path.display());
            Ok(count)
        }
        Word::End => Ok(count),
    }
}

/// Refreshes `region` and copies its first `count` counters into `dst`.
pub fn read_counter_snapshot<K: CoverageKernel>(
    kernel: &mut K,
    region: &CounterRegion<K::Region>,
    dst: &mut [u64],
    count: usize,
) -> Result<(), SnapshotError> {
    let capacity = dst.len();
    let dst = dst
        .get_mut(..count)
        .ok_or(SnapshotError::DestinationTooSmall { count, capacity })?;
    region.snapshot_into(kernel, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimulatedKernel;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn table_file(pcs: &[u64]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp pc table");
        for pc in pcs {
            file.write_all(&pc.to_ne_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_a_table_smaller_than_the_buffer() {
        let file = table_file(&[0x1000, 0, 0x2000]);
        let mut dst = [0u64; 8];
        let n = read_location_table(file.path(), &mut dst).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&dst[..3], &[0x1000, 0, 0x2000]);
    }

    #[test]
    fn table_exactly_filling_the_buffer_is_accepted() {
        let file = table_file(&[1, 2, 3, 4]);
        let mut dst = [0u64; 4];
        assert_eq!(read_location_table(file.path(), &mut dst).unwrap(), 4);
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn table_larger_than_the_buffer_is_refused() {
        let file = table_file(&[1, 2, 3, 4, 5]);
        let mut dst = [0u64; 4];
        match read_location_table(file.path(), &mut dst) {
            Err(SnapshotError::CapacityExceeded { capacity, .. }) => assert_eq!(capacity, 4),
            other => panic!("Expected CapacityExceeded, got {other:?}"),
        }
    }

    #[test]
    fn trailing_partial_entry_is_ignored() {
        let mut file = table_file(&[7, 8]);
        file.write_all(&[0xAA, 0xBB, 0xCC]).unwrap();
        file.flush().unwrap();
        let mut dst = [0u64; 2];
        assert_eq!(read_location_table(file.path(), &mut dst).unwrap(), 2);
        assert_eq!(dst, [7, 8]);
    }

    #[test]
    fn missing_table_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zircon.elf.1.sancov");
        let mut dst = [0u64; 1];
        let err = read_location_table(&path, &mut dst).unwrap_err();
        assert!(matches!(err, SnapshotError::Open { .. }));
        assert!(err.to_string().contains("zircon.elf.1.sancov"));
    }

    #[test]
    fn counter_snapshot_copies_the_requested_prefix() {
        let mut kernel = SimulatedKernel::new(4);
        kernel.enable_current_thread().unwrap();
        let region = CounterRegion::create(&mut kernel, 4).unwrap();
        for slot in 0..4 {
            kernel.set_counter(slot, 10 + slot as u64);
        }

        let mut dst = [0u64; 4];
        read_counter_snapshot(&mut kernel, &region, &mut dst, 2).unwrap();
        assert_eq!(dst, [10, 11, 0, 0]);

        let err = read_counter_snapshot(&mut kernel, &region, &mut dst, 5).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::DestinationTooSmall {
                count: 5,
                capacity: 4
            }
        ));
    }

    #[test]
    fn counter_snapshot_propagates_kernel_failures() {
        let mut kernel = SimulatedKernel::new(1);
        kernel.enable_current_thread().unwrap();
        let region = CounterRegion::create(&mut kernel, 1).unwrap();
        kernel.fail_fetch_with(crate::kernel::Status::ERR_BAD_HANDLE);
        let mut dst = [0u64; 1];
        let err = read_counter_snapshot(&mut kernel, &region, &mut dst, 1).unwrap_err();
        assert!(matches!(err, SnapshotError::Kernel(KernelError::Fetch(_))));
    }
}
