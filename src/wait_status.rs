use crate::kernel_metadata::{ptrace_event_name, signal_name};
use libc::{SIGSTOP, SIGTRAP};
use libc::{WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt::{Display, Formatter, Result};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. (See ptrace man page.)
    /// You must use PTRACE_SEIZE to generate PTRACE_EVENT_STOPs, or these
    /// will be treated as SignalStop.
    GroupStop,
    /// Task is in a syscall-stop triggered by PTRACE_SYSCALL
    /// and PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop, except for PTRACE_EVENT_STOP
    /// which is treated as GroupStop.
    PtraceEvent,
}

/// The raw status word from waitpid(), with the classifications the
/// controller needs layered on top. A syscall stop (SIGTRAP|0x80 under
/// PTRACE_O_TRACESYSGOOD) is never reported as a pending signal.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct WaitStatus {
    status: i32,
}

impl Default for WaitStatus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }

        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if WIFEXITED(self.status) {
            Some(WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        let termsig = WTERMSIG(self.status);
        if WIFSIGNALED(self.status) && termsig > 0 {
            Some(termsig)
        } else {
            None
        }
    }

    /// Stop signal if wait_type() == SignalStop, otherwise None. A zero
    /// signal (rare but observed via PTRACE_INTERRUPT) is converted to
    /// SIGSTOP.
    pub fn stop_sig(&self) -> Option<i32> {
        // The high status byte distinguishes ptrace events (including
        // PTRACE_EVENT_STOP group-stops under PTRACE_SEIZE) from plain
        // signal stops.
        if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff) != 0 {
            return None;
        }

        let mut sig: i32 = WSTOPSIG(self.status);

        if sig == (SIGTRAP | 0x80) {
            // Syscall-enter or -exit stop under PTRACE_O_TRACESYSGOOD.
            return None;
        }

        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    /// Group stop signal if wait_type() == GroupStop, otherwise None.
    pub fn group_stop_sig(&self) -> Option<i32> {
        if !WIFSTOPPED(self.status)
            || ((self.status >> 16) & 0xff) != libc::PTRACE_EVENT_STOP
        {
            return None;
        }

        let mut sig: i32 = WSTOPSIG(self.status);

        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn is_syscall(&self) -> bool {
        if self.ptrace_event().is_some() || !WIFSTOPPED(self.status) {
            return false;
        }

        WSTOPSIG(self.status) == (SIGTRAP | 0x80)
    }

    /// ptrace event if wait_type() == PtraceEvent, None otherwise.
    pub fn ptrace_event(&self) -> Option<u32> {
        let event: i32 = (self.status >> 16) & 0xff;
        if event == libc::PTRACE_EVENT_STOP || event == 0 {
            None
        } else {
            Some(event as u32)
        }
    }

    /// Return a WaitStatus for a process exit.
    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    /// Return a WaitStatus for a fatal signal.
    pub fn for_fatal_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus { status: sig }
    }

    /// Return a WaitStatus for a stop signal.
    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    pub fn for_ptrace_event(ptrace_event: i32) -> WaitStatus {
        debug_assert!(ptrace_event >= 1 && ptrace_event < 0x100);
        WaitStatus {
            status: (ptrace_event << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }

    pub fn get(&self) -> i32 {
        self.status
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(f, " (STOP-{})", signal_name(self.stop_sig().unwrap())),
            WaitType::GroupStop => write!(
                f,
                " (GROUP-STOP-{})",
                signal_name(self.group_stop_sig().unwrap())
            ),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_round_trip() {
        let ws = WaitStatus::for_exit_code(3);
        assert_eq!(WaitType::Exit, ws.wait_type());
        assert_eq!(Some(3), ws.exit_code());
        assert_eq!(None, ws.stop_sig());
    }

    #[test]
    fn fatal_sig_round_trip() {
        let ws = WaitStatus::for_fatal_sig(libc::SIGKILL);
        assert_eq!(WaitType::FatalSignal, ws.wait_type());
        assert_eq!(Some(libc::SIGKILL), ws.fatal_sig());
    }

    #[test]
    fn stop_sig_round_trip() {
        let ws = WaitStatus::for_stop_sig(libc::SIGSTKFLT);
        assert_eq!(WaitType::SignalStop, ws.wait_type());
        assert_eq!(Some(libc::SIGSTKFLT), ws.stop_sig());
        assert_eq!(None, ws.ptrace_event());
    }

    #[test]
    fn syscall_stop_is_not_a_signal() {
        let ws = WaitStatus::new((((libc::SIGTRAP | 0x80) << 8) | 0x7f) as i32);
        assert_eq!(WaitType::SyscallStop, ws.wait_type());
        assert!(ws.is_syscall());
        assert_eq!(None, ws.stop_sig());
    }

    #[test]
    fn ptrace_event_round_trip() {
        let ws = WaitStatus::for_ptrace_event(libc::PTRACE_EVENT_EXEC);
        assert_eq!(WaitType::PtraceEvent, ws.wait_type());
        assert_eq!(Some(libc::PTRACE_EVENT_EXEC as u32), ws.ptrace_event());
        assert_eq!(None, ws.stop_sig());
    }
}
