//! The interface between the tracer and the preloaded helper library that
//! lets tracees run "boring" syscalls without a ptrace stop. The tracee
//! writes fixed-layout records into a shared anonymous segment; a desched
//! perf event interposes when such a syscall would block.
//!
//! Change anything here and the preload library must change with it.

use crate::remote_ptr::RemotePtr;
use static_assertions::assert_eq_size;
use std::mem::size_of;

pub const SYSCALLBUF_LIB_FILENAME: &str = "libretrace_preload.so";

/// Size of the shared segment: header plus record area.
pub const SYSCALLBUF_BUFFER_SIZE: usize = 1 << 20;

/// The signal the desched perf event delivers while a tracee sits in a
/// blocked untraced syscall. We rely on its delivery; if tracees block
/// it, the buffer must be locked or we deadlock.
pub const SYSCALLBUF_DESCHED_SIGNAL: i32 = libc::SIGSYS;

/// Stand-in fd number used for the tracee's desched fd when the real fd
/// was not shared with the tracer (i.e. during replay).
pub const REPLAY_DESCHED_EVENT_FD: i32 = -10;

/// The tracee's desched fd is dup'd to a fixed high number so that
/// software wanting the low fds for itself doesn't trip over it.
pub const DESCHED_EVENT_FLOOR_FD: i32 = 100;

/// Shared-memory segment name for tracee `tid`; briefly visible in the
/// filesystem until unlinked.
pub fn syscallbuf_shmem_path(tid: libc::pid_t, nonce: u32) -> String {
    format!("/retrace-tracee-shmem-{}-{}", tid, nonce)
}

/// Unix-socket path the tracee connects to when handing us its desched
/// fd. Built from the recorded tid, which the preload library also knows.
pub fn syscallbuf_socket_path(rec_tid: libc::pid_t) -> String {
    format!("/tmp/retrace-tracee-fd-{}", rec_tid)
}

/// Head of the shared segment.
///
/// The tracer only writes the header while the tracee is stopped, or to
/// the `locked` byte while the desched signal is blocked in the tracee;
/// that discipline stands in for locks.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct SyscallbufHdr {
    /// Bytes of records currently stored; the tracee bumps this as it
    /// commits records, the tracer zeroes it at flush.
    pub num_rec_bytes: u32,
    /// Set by the tracee while a record is allocated but not yet
    /// committed; a flush observing this would tear a record.
    pub abort_commit: u8,
    /// While set, the tracee must not write new records. Kept in sync
    /// with "desched signal blocked" in the tracee.
    pub locked: u8,
    pub _pad: [u8; 2],
}
assert_eq_size!(SyscallbufHdr, [u8; 8]);

/// One buffered syscall, written by the tracee.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct SyscallbufRecord {
    /// Bytes in this record, including these fields and any extra data.
    pub size: u32,
    pub syscallno: u16,
    /// Nonzero when a desched notification interrupted this syscall.
    pub desched: u8,
    pub _pad: u8,
    pub ret: i64,
}
assert_eq_size!(SyscallbufRecord, [u8; 16]);

/// Arguments to the buffer-setup call the preload library traps into the
/// tracer with. The tracee fills in the pointers; the tracer writes back
/// the mapped buffer address and fd numbers.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct RtcallInitBuffersParams {
    /// Whether the tracee was built/configured to use buffering; must
    /// agree with the tracer's view.
    pub syscallbuf_enabled: i32,
    pub _pad: i32,
    /// Instruction pointers of the preload library's traced and untraced
    /// syscall instructions.
    pub traced_syscall_ip: usize,
    pub untraced_syscall_ip: usize,
    /// A sockaddr_un in tracee memory, pre-filled by the preload library
    /// with the socket path for this tracee.
    pub sockaddr: usize,
    /// A msghdr in tracee memory carrying the desched fd as SCM_RIGHTS.
    pub msg: usize,
    /// An int in tracee memory holding the tracee-side desched fd number.
    pub fdptr: usize,
    /// Out: where the tracer mapped the buffer in the tracee.
    pub syscallbuf_ptr: usize,
}

/// The number of bytes a flush blob occupies for a buffer holding
/// `num_rec_bytes` of records.
pub fn flush_blob_size(num_rec_bytes: u32) -> usize {
    num_rec_bytes as usize + size_of::<SyscallbufHdr>()
}

/// Walk the records in a buffer snapshot. `buf` starts at the header.
pub fn next_record_offset(buf: &[u8], offset: usize) -> Option<usize> {
    let hdr_size = size_of::<SyscallbufHdr>();
    let num_rec_bytes = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if offset >= num_rec_bytes {
        return None;
    }
    let rec_start = hdr_size + offset;
    let size = u32::from_le_bytes([
        buf[rec_start],
        buf[rec_start + 1],
        buf[rec_start + 2],
        buf[rec_start + 3],
    ]) as usize;
    debug_assert!(size >= size_of::<SyscallbufRecord>());
    Some(offset + size)
}

pub type SyscallbufRecordPtr = RemotePtr<SyscallbufRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_blob_size_includes_header() {
        assert_eq!(size_of::<SyscallbufHdr>(), flush_blob_size(0));
        assert_eq!(8 + 100, flush_blob_size(100));
    }

    #[test]
    fn record_walk() {
        let mut buf = vec![0u8; 128];
        // Two records: 16 + 24 bytes.
        let num_rec_bytes: u32 = 40;
        buf[0..4].copy_from_slice(&num_rec_bytes.to_le_bytes());
        buf[8..12].copy_from_slice(&16u32.to_le_bytes());
        buf[24..28].copy_from_slice(&24u32.to_le_bytes());

        let first = next_record_offset(&buf, 0).unwrap();
        assert_eq!(16, first);
        let second = next_record_offset(&buf, first).unwrap();
        assert_eq!(40, second);
        assert_eq!(None, next_record_offset(&buf, second));
    }

    #[test]
    fn shmem_paths_are_unique_per_nonce() {
        assert_ne!(syscallbuf_shmem_path(5, 0), syscallbuf_shmem_path(5, 1));
    }
}
