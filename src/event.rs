use crate::kernel_metadata::{signal_name, syscall_name};
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use crate::sig::Sig;
use crate::syscallbuf::SyscallbufRecord;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter, Result};

/// Events serve two purposes: tracking Task state during recording, and
/// being stored in traces to guide replay.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EventType {
    /// The always-present bottom of every task's event stack.
    EvSentinel,
    /// Uses no data; communicates between parts of the recorder.
    EvNoop,
    /// A desched-event notification fired during a may-block buffered
    /// syscall; see DeschedEventData.
    EvDesched,
    EvSignalDelivery,
    EvSignalHandler,
    EvSyscall,
    EvSyscallInterruption,
    /// Recorded syscallbuf data for one or more buffered syscalls.
    EvSyscallbufFlush,
}
use EventType::*;

/// Syscall events track syscalls through entry into the kernel,
/// processing in the kernel, and exit from the kernel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    NoSyscall,
    EnteringSyscall,
    ProcessingSyscall,
    ExitingSyscall,
}

impl Display for SyscallState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let disp = match self {
            SyscallState::NoSyscall => "NO_SYSCALL",
            SyscallState::EnteringSyscall => "ENTERING_SYSCALL",
            SyscallState::ProcessingSyscall => "PROCESSING_SYSCALL",
            SyscallState::ExitingSyscall => "EXITING_SYSCALL",
        };
        write!(f, "{}", disp)
    }
}

/// Desched events track the fact that a tracee's desched-event
/// notification fired during a may-block buffered syscall, which we
/// interpret as the syscall actually blocking (for a potentially
/// unbounded amount of time). After the syscall exits, the tracee is
/// advanced to where the desched is disarmed.
#[derive(Copy, Clone)]
pub struct DeschedEventData {
    /// Record of the syscall that was interrupted by the desched
    /// notification. It's legal to reference this memory only while the
    /// desched is being processed: the tracee has allocated (but not yet
    /// committed) this record.
    pub rec: RemotePtr<SyscallbufRecord>,
}

#[derive(Copy, Clone)]
pub struct SignalEventData {
    pub siginfo: libc::siginfo_t,
    /// True if this signal will be raised again deterministically by
    /// re-executing the triggering instruction during replay.
    pub deterministic: bool,
    /// Set once the signal has actually been delivered to the tracee.
    pub delivered: bool,
}

impl SignalEventData {
    pub fn new(siginfo: libc::siginfo_t, deterministic: bool) -> SignalEventData {
        SignalEventData {
            siginfo,
            deterministic,
            delivered: false,
        }
    }

    pub fn sig(&self) -> i32 {
        self.siginfo.si_signo
    }

    /// The checked signal, when the siginfo carries a valid number.
    pub fn maybe_sig(&self) -> Option<Sig> {
        Sig::try_from(self.siginfo.si_signo).ok()
    }
}

#[derive(Copy, Clone)]
pub struct SyscallEventData {
    pub no: i64,
    pub state: SyscallState,
    /// The registers at entry, for comparing a later syscall against an
    /// interrupted one.
    pub regs: Registers,
    /// Nonzero when this syscall was aborted by a desched notification;
    /// points at the tracee-side record.
    pub desched_rec: RemotePtr<SyscallbufRecord>,
}

impl SyscallEventData {
    pub fn new(no: i64, regs: Registers) -> SyscallEventData {
        SyscallEventData {
            no,
            state: SyscallState::EnteringSyscall,
            regs,
            desched_rec: RemotePtr::null(),
        }
    }
}

/// One entry of a Task's pending-event stack.
#[derive(Copy, Clone)]
pub enum Event {
    Sentinel,
    Noop,
    Desched(DeschedEventData),
    SignalDelivery(SignalEventData),
    SignalHandler(SignalEventData),
    Syscall(SyscallEventData),
    SyscallInterruption(SyscallEventData),
    SyscallbufFlush,
}

/// The compact form of an Event that goes into a trace frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EncodedEvent {
    pub event_type: EventType,
    /// Syscall number or signal number, depending on the type.
    pub data: i64,
    pub state: SyscallState,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Sentinel => EvSentinel,
            Event::Noop => EvNoop,
            Event::Desched(_) => EvDesched,
            Event::SignalDelivery(_) => EvSignalDelivery,
            Event::SignalHandler(_) => EvSignalHandler,
            Event::Syscall(_) => EvSyscall,
            Event::SyscallInterruption(_) => EvSyscallInterruption,
            Event::SyscallbufFlush => EvSyscallbufFlush,
        }
    }

    /// True when the frame for this event carries register and counter
    /// snapshots.
    pub fn has_exec_info(&self) -> bool {
        matches!(
            self,
            Event::SignalDelivery(_)
                | Event::SignalHandler(_)
                | Event::Syscall(_)
                | Event::SyscallInterruption(_)
        )
    }

    pub fn is_syscall_event(&self) -> bool {
        matches!(self, Event::Syscall(_) | Event::SyscallInterruption(_))
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(self, Event::SignalDelivery(_) | Event::SignalHandler(_))
    }

    /// The syscall payload; the caller must know this is a syscall event.
    pub fn syscall(&self) -> &SyscallEventData {
        match self {
            Event::Syscall(data) | Event::SyscallInterruption(data) => data,
            _ => panic!("not a syscall event"),
        }
    }

    pub fn syscall_mut(&mut self) -> &mut SyscallEventData {
        match self {
            Event::Syscall(data) | Event::SyscallInterruption(data) => data,
            _ => panic!("not a syscall event"),
        }
    }

    pub fn signal(&self) -> &SignalEventData {
        match self {
            Event::SignalDelivery(data) | Event::SignalHandler(data) => data,
            _ => panic!("not a signal event"),
        }
    }

    pub fn signal_mut(&mut self) -> &mut SignalEventData {
        match self {
            Event::SignalDelivery(data) | Event::SignalHandler(data) => data,
            _ => panic!("not a signal event"),
        }
    }

    pub fn desched(&self) -> &DeschedEventData {
        match self {
            Event::Desched(data) => data,
            _ => panic!("not a desched event"),
        }
    }

    pub fn encode(&self) -> EncodedEvent {
        let (data, state) = match self {
            Event::Syscall(s) | Event::SyscallInterruption(s) => (s.no, s.state),
            Event::SignalDelivery(s) | Event::SignalHandler(s) => {
                (s.sig() as i64, SyscallState::NoSyscall)
            }
            _ => (0, SyscallState::NoSyscall),
        };
        EncodedEvent {
            event_type: self.event_type(),
            data,
            state,
        }
    }

    /// sigreturn restores extended register state, and entering a signal
    /// handler clears it, so frames for those events capture the extended
    /// registers too.
    pub fn record_extra_regs(&self) -> bool {
        match self {
            Event::Syscall(s) => {
                s.state == SyscallState::ExitingSyscall && s.no == libc::SYS_rt_sigreturn
            }
            Event::SignalHandler(_) => true,
            _ => false,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Event::Sentinel => write!(f, "(sentinel)"),
            Event::Noop => write!(f, "(noop)"),
            Event::Desched(d) => write!(f, "DESCHED at rec {}", d.rec),
            Event::SignalDelivery(s) => write!(f, "SIGNAL-DELIVERY of {}", signal_name(s.sig())),
            Event::SignalHandler(s) => write!(f, "SIGNAL-HANDLER for {}", signal_name(s.sig())),
            Event::Syscall(s) => write!(f, "SYSCALL {} ({})", syscall_name(s.no), s.state),
            Event::SyscallInterruption(s) => {
                write!(f, "SYSCALL-INTERRUPTION of {}", syscall_name(s.no))
            }
            Event::SyscallbufFlush => write!(f, "SYSCALLBUF-FLUSH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::synthesize_poll_in_siginfo;

    #[test]
    fn exec_info_split() {
        assert!(!Event::Sentinel.has_exec_info());
        assert!(!Event::SyscallbufFlush.has_exec_info());
        let sig =
            Event::SignalDelivery(SignalEventData::new(
                synthesize_poll_in_siginfo(libc::SIGSTKFLT, 3),
                false,
            ));
        assert!(sig.has_exec_info());
        assert!(!sig.record_extra_regs());
    }

    #[test]
    fn encode_syscall_event() {
        let mut ev = Event::Syscall(SyscallEventData::new(libc::SYS_mprotect, Registers::new()));
        let enc = ev.encode();
        assert_eq!(EventType::EvSyscall, enc.event_type);
        assert_eq!(libc::SYS_mprotect, enc.data);
        assert_eq!(SyscallState::EnteringSyscall, enc.state);

        ev.syscall_mut().state = SyscallState::ExitingSyscall;
        assert_eq!(SyscallState::ExitingSyscall, ev.encode().state);
    }

    #[test]
    fn sigreturn_exit_records_extra_regs() {
        let mut ev =
            Event::Syscall(SyscallEventData::new(libc::SYS_rt_sigreturn, Registers::new()));
        assert!(!ev.record_extra_regs());
        ev.syscall_mut().state = SyscallState::ExitingSyscall;
        assert!(ev.record_extra_regs());
    }

    #[test]
    fn encode_signal_event() {
        let si = synthesize_poll_in_siginfo(libc::SIGSEGV, -1);
        let ev = Event::SignalDelivery(SignalEventData::new(si, true));
        let enc = ev.encode();
        assert_eq!(EventType::EvSignalDelivery, enc.event_type);
        assert_eq!(libc::SIGSEGV as i64, enc.data);
    }
}
