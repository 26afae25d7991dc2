use crate::event::EncodedEvent;
use crate::extra_registers::ExtraRegisters;
use crate::perf_counters::Rbc;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use libc::pid_t;

/// Global event ordinal across all tasks in a recording.
pub type FrameTime = u64;

/// One entry of the trace's event stream: who stopped, why, and enough
/// execution state to steer and validate replay.
#[derive(Clone)]
pub struct TraceFrame {
    pub global_time: FrameTime,
    /// This task's own event ordinal.
    pub thread_time: u32,
    pub tid: pid_t,
    pub ev: EncodedEvent,
    /// Cumulative retired-conditional-branch count at this stop; only
    /// meaningful when the event carries exec info.
    pub rbc: Rbc,
    pub recorded_regs: Option<Registers>,
    /// Captured only for sigreturn exits and signal-handler entries.
    pub recorded_extra_regs: Option<ExtraRegisters>,
}

/// An out-of-band blob of tracee memory attached to the event stream,
/// e.g. a syscall-buffer flush or recorded syscall outparam data.
#[derive(Clone)]
pub struct RawData {
    pub addr: RemotePtr<Void>,
    pub data: Vec<u8>,
    pub ev: EncodedEvent,
    pub global_time: FrameTime,
}
