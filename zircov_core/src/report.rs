//! Call reply wire protocol.
//!
//! Every record starts with a 12-byte [`ExecuteReply`] header. A call record (`done ==
//! 0`) continues with the rest of [`CallReply`] and then `signal_size` and `cover_size`
//! native-endian `u32` PCs. A completion record (`done == 1`) ends the program's stream.
//! All fields are native-endian `u32`s in declaration order; the controller parses them
//! positionally.

use crate::cover::CoverageResult;
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, NoLimit},
    error::{DecodeError, EncodeError},
};
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;

#[cfg(target_endian = "little")]
type WireEndian = bincode::config::LittleEndian;
#[cfg(target_endian = "big")]
type WireEndian = bincode::config::BigEndian;

type WireConfig = Configuration<WireEndian, Fixint, NoLimit>;

fn wire_config() -> WireConfig {
    let config = bincode::config::standard().with_fixed_int_encoding();
    #[cfg(target_endian = "big")]
    let config = config.with_big_endian();
    config
}

pub const OUT_MAGIC: u32 = 0x0BAD_F00D;

/// Error code reported for a call that has not finished.
pub const UNFINISHED_ERRNO: u32 = 999;

pub const CALL_FLAG_EXECUTED: u32 = 1 << 0;
pub const CALL_FLAG_FINISHED: u32 = 1 << 1;
pub const CALL_FLAG_BLOCKED: u32 = 1 << 2;
pub const CALL_FLAG_FAULT_INJECTED: u32 = 1 << 3;

pub const EXECUTE_REPLY_SIZE: usize = 3 * size_of::<u32>();
pub const CALL_REPLY_SIZE: usize = 10 * size_of::<u32>();

#[derive(Encode, Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteReply {
    pub magic: u32,
    pub done: u32,
    pub status: u32,
}

#[derive(Encode, Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallReplyBody {
    pub call_index: u32,
    pub call_num: u32,
    pub reserrno: u32,
    pub flags: u32,
    pub signal_size: u32,
    pub cover_size: u32,
    pub comps_size: u32,
}

#[derive(Encode, Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallReply {
    pub header: ExecuteReply,
    #[serde(flatten)]
    pub body: CallReplyBody,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("control pipe call write failed: wrote {wrote} of {expected} bytes")]
    HeaderShortWrite { wrote: usize, expected: usize },
    #[error("signals table write failed. Wrote {wrote} of {expected} bytes")]
    SignalShortWrite { wrote: usize, expected: usize },
    #[error("coverage table write failed. Wrote {wrote} of {expected} bytes")]
    CoverShortWrite { wrote: usize, expected: usize },
    #[error("control pipe completion write failed: wrote {wrote} of {expected} bytes")]
    CompletionShortWrite { wrote: usize, expected: usize },
    #[error("control pipe I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("reply encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("reply decoding error: {0}")]
    Decode(#[from] DecodeError),
    #[error("bad reply magic {0:#x}")]
    BadMagic(u32),
    #[error("comparison tables are not produced by this executor (comps_size {0})")]
    UnexpectedComps(u32),
}

/// What the reporter needs to know about one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallRecord {
    pub call_index: u32,
    pub call_num: u32,
    pub res: isize,
    pub reserrno: u32,
    pub fault_injected: bool,
}

/// Coverage reporting switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportFlags {
    /// Send the signal table.
    pub coverage: bool,
    /// Also send the cover table.
    pub collect_cover: bool,
}

/// Builds the reply for `call`.
pub fn call_reply(
    call: &CallRecord,
    finished: bool,
    blocked: bool,
    flags: ReportFlags,
    cov: &CoverageResult<'_>,
) -> CallReply {
    let mut reserrno = UNFINISHED_ERRNO;
    let mut call_flags = CALL_FLAG_EXECUTED;
    if blocked {
        call_flags |= CALL_FLAG_BLOCKED;
    }
    if finished {
        reserrno = if call.res != -1 { 0 } else { call.reserrno };
        call_flags |= CALL_FLAG_FINISHED;
        if call.fault_injected {
            call_flags |= CALL_FLAG_FAULT_INJECTED;
        }
    }

    let mut body = CallReplyBody {
        call_index: call.call_index,
        call_num: call.call_num,
        reserrno,
        flags: call_flags,
        ..CallReplyBody::default()
    };
    if flags.coverage {
        body.signal_size = cov.size as u32;
        if flags.collect_cover {
            body.cover_size = cov.size as u32;
        }
    }
    CallReply {
        header: ExecuteReply {
            magic: OUT_MAGIC,
            done: 0,
            status: 0,
        },
        body,
    }
}

/// Writes reply records to the control pipe.
///
/// Each piece of a record goes out in a single `write`; a short write leaves the
/// controller desynchronized and is returned as an error for the owner to escalate.
pub struct ReplyWriter<W: Write> {
    out: W,
    flags: ReportFlags,
    scratch: Vec<u8>,
}

impl<W: Write> ReplyWriter<W> {
    pub fn new(out: W, flags: ReportFlags) -> Self {
        Self {
            out,
            flags,
            scratch: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Writes the reply for `call` followed by its signal and cover tables.
    pub fn write_call_output(
        &mut self,
        call: &CallRecord,
        finished: bool,
        blocked: bool,
        cov: &CoverageResult<'_>,
    ) -> Result<(), ReportError> {
        let reply = call_reply(call, finished, blocked, self.flags, cov);
        let mut buf = [0u8; CALL_REPLY_SIZE];
        bincode::encode_into_slice(reply, &mut buf, wire_config())?;
        let wrote = self.out.write(&buf)?;
        if wrote != buf.len() {
            return Err(ReportError::HeaderShortWrite {
                wrote,
                expected: buf.len(),
            });
        }

        if self.flags.coverage {
            // Zircon instruments edges, so the signal is the coverage itself.
            self.scratch.clear();
            for pc in cov.hits {
                self.scratch.extend_from_slice(&pc.to_ne_bytes());
            }
            let expected = self.scratch.len();
            let wrote = self.write_table()?;
            if wrote != expected {
                return Err(ReportError::SignalShortWrite { wrote, expected });
            }
            if self.flags.collect_cover {
                let wrote = self.write_table()?;
                if wrote != expected {
                    return Err(ReportError::CoverShortWrite { wrote, expected });
                }
            }
        }

        log::debug!(
            "out: index={} num={} errno={} finished={} blocked={}",
            call.call_index,
            call.call_num,
            reply.body.reserrno,
            finished,
            blocked
        );
        Ok(())
    }

    fn write_table(&mut self) -> io::Result<usize> {
        if self.scratch.is_empty() {
            return Ok(0);
        }
        self.out.write(&self.scratch)
    }

    /// Writes the record that closes a program's reply stream.
    pub fn write_completed(&mut self, status: u32) -> Result<(), ReportError> {
        let reply = ExecuteReply {
            magic: OUT_MAGIC,
            done: 1,
            status,
        };
        let mut buf = [0u8; EXECUTE_REPLY_SIZE];
        bincode::encode_into_slice(reply, &mut buf, wire_config())?;
        let wrote = self.out.write(&buf)?;
        if wrote != buf.len() {
            return Err(ReportError::CompletionShortWrite {
                wrote,
                expected: buf.len(),
            });
        }
        self.out.flush()?;
        Ok(())
    }
}

/// One record read back from a reply stream.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Reply {
    Call {
        #[serde(flatten)]
        reply: CallReply,
        signal: Vec<u32>,
        cover: Vec<u32>,
    },
    Completed {
        status: u32,
    },
}

/// Parses a reply stream written by [`ReplyWriter`].
pub struct ReplyReader<R: Read> {
    input: R,
}

impl<R: Read> ReplyReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Returns the next record, or `None` at a clean end of stream.
    pub fn next_reply(&mut self) -> Result<Option<Reply>, ReportError> {
        let mut head = [0u8; EXECUTE_REPLY_SIZE];
        match self.input.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let (header, _): (ExecuteReply, usize) = bincode::decode_from_slice(&head, wire_config())?;
        if header.magic != OUT_MAGIC {
            return Err(ReportError::BadMagic(header.magic));
        }
        if header.done != 0 {
            return Ok(Some(Reply::Completed {
                status: header.status,
            }));
        }

        let mut rest = [0u8; CALL_REPLY_SIZE - EXECUTE_REPLY_SIZE];
        self.input.read_exact(&mut rest)?;
        let (body, _): (CallReplyBody, usize) = bincode::decode_from_slice(&rest, wire_config())?;
        if body.comps_size != 0 {
            return Err(ReportError::UnexpectedComps(body.comps_size));
        }
        let signal = self.read_table(body.signal_size)?;
        let cover = self.read_table(body.cover_size)?;
        Ok(Some(Reply::Call {
            reply: CallReply { header, body },
            signal,
            cover,
        }))
    }

    fn read_table(&mut self, len: u32) -> Result<Vec<u32>, ReportError> {
        let mut bytes = vec![0u8; len as usize * size_of::<u32>()];
        self.input.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(size_of::<u32>())
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

impl<R: Read> Iterator for ReplyReader<R> {
    type Item = Result<Reply, ReportError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_reply().transpose()
    }
}
