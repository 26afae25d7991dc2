//! x86-64 Linux ABI details that the libc crate doesn't carry: the ptrace
//! emulation requests, the kernel-side sigaction layout, and the pieces of
//! siginfo we synthesize or inspect for perf-counter signals.

use static_assertions::assert_eq_size;
use std::mem::size_of;

/// The `syscall` instruction.
pub const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

/// `int3`, planted on top of instructions we must not re-execute.
pub const BREAKPOINT_INSN: u8 = 0xcc;
pub const BREAKPOINT_INSN_LEN: usize = 1;

/// PTRACE_SYSEMU and friends aren't part of the official ptrace API.
pub const PTRACE_SYSEMU: u32 = 31;
pub const PTRACE_SYSEMU_SINGLESTEP: u32 = 32;

/// regset note number for the XSAVE area.
pub const NT_X86_XSTATE: i32 = 0x202;

/// Some kernels report seccomp events with the obsolete number.
pub const PTRACE_EVENT_SECCOMP_OBSOLETE: u32 = 8;

/// The kernel's in-syscall restart errnos; a syscall returning one of these
/// was interrupted and may be restarted.
pub const ERESTARTSYS: i64 = 512;
pub const ERESTARTNOINTR: i64 = 513;
pub const ERESTARTNOHAND: i64 = 514;
pub const ERESTART_RESTARTBLOCK: i64 = 516;

pub fn syscall_may_restart(result: i64) -> bool {
    matches!(
        -result,
        ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND | ERESTART_RESTARTBLOCK
    )
}

/// We need to complement sigsets in order to update a task's blocked set,
/// but POSIX doesn't define a convenient helper. So we keep our own
/// linux-compatible sig_set_t and use bit operators.
pub type SigSet = u64;
assert_eq_size!(SigSet, [u8; 8]);

pub fn sig_bit(sig: i32) -> SigSet {
    debug_assert!(sig >= 1);
    1u64 << (sig - 1)
}

/// The kernel SYS_rt_sigaction ABI is different from the libc API; this is
/// the kernel layout. We see these at rt_sigaction traps.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct KernelSigaction {
    pub k_sa_handler: usize,
    pub sa_flags: usize,
    pub sa_restorer: usize,
    pub sa_mask: SigSet,
}
assert_eq_size!(KernelSigaction, [u8; 32]);

pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// The layout of the `tls` argument to clone() and set_thread_area().
/// The packed bitfields of the kernel struct are kept as one word.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct UserDesc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: u32,
}
assert_eq_size!(UserDesc, [u8; 16]);

/// siginfo_t field offsets on x86-64 for the SIGPOLL-style layout the
/// kernel uses for fd-owner signals: three leading ints, padding to 16,
/// then { si_band: long, si_fd: int }.
const SIGINFO_SIGNO_OFFSET: usize = 0;
const SIGINFO_CODE_OFFSET: usize = 8;
const SIGINFO_BAND_OFFSET: usize = 16;
const SIGINFO_FD_OFFSET: usize = 24;
assert_eq_size!(libc::siginfo_t, [u8; 128]);
// Not exposed by the libc crate on this target; value is fixed by the
// kernel ABI (asm-generic/siginfo.h).
const POLL_IN: i32 = 1;

/// Build the siginfo the kernel would deliver for an O_ASYNC fd becoming
/// readable: si_code == POLL_IN and si_fd naming the counter fd.
pub fn synthesize_poll_in_siginfo(sig: i32, fd: i32) -> libc::siginfo_t {
    let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let base = &mut si as *mut libc::siginfo_t as *mut u8;
    unsafe {
        *(base.add(SIGINFO_SIGNO_OFFSET) as *mut i32) = sig;
        *(base.add(SIGINFO_CODE_OFFSET) as *mut i32) = POLL_IN;
        *(base.add(SIGINFO_BAND_OFFSET) as *mut libc::c_long) = libc::POLLIN as libc::c_long;
        *(base.add(SIGINFO_FD_OFFSET) as *mut i32) = fd;
    }
    si
}

pub fn siginfo_fd(si: &libc::siginfo_t) -> i32 {
    let base = si as *const libc::siginfo_t as *const u8;
    unsafe { *(base.add(SIGINFO_FD_OFFSET) as *const i32) }
}

pub fn siginfo_bytes(si: &libc::siginfo_t) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(si as *const libc::siginfo_t as *const u8, size_of::<libc::siginfo_t>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_in_siginfo_round_trip() {
        let si = synthesize_poll_in_siginfo(libc::SIGSTKFLT, 42);
        assert_eq!(libc::SIGSTKFLT, si.si_signo);
        assert_eq!(POLL_IN, si.si_code);
        assert_eq!(42, siginfo_fd(&si));
    }

    #[test]
    fn sig_bits() {
        assert_eq!(1, sig_bit(1));
        assert_eq!(1 << 30, sig_bit(31));
    }

    #[test]
    fn restart_errnos() {
        assert!(syscall_may_restart(-ERESTARTSYS));
        assert!(syscall_may_restart(-ERESTART_RESTARTBLOCK));
        assert!(!syscall_may_restart(-(libc::EINTR as i64)));
        assert!(!syscall_may_restart(0));
    }
}
