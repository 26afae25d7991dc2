//! The per-task controller: drives one traced OS task through resume/wait
//! cycles, owns its register and memory views, its performance counters,
//! its pending-event stack, and the tracee side of the syscall-buffer
//! protocol.

use crate::address_space::{AddressSpace, AddressSpaceSharedPtr, TrapType};
use crate::auto_remote_syscalls::{AutoRemoteSyscalls, AutoRestoreMem};
use crate::event::{Event, EventType, SyscallState};
use crate::extra_registers::{xsave_area_size, ExtraRegisters};
use crate::flags::Flags;
use crate::gdb_connection::DbgRegValue;
use crate::gdb_register::{GdbRegister, DREG_NUM_REGS, MAX_REG_SIZE_BYTES};
use crate::kernel_abi::{
    sig_bit, syscall_may_restart, synthesize_poll_in_siginfo, KernelSigaction, SigSet, UserDesc,
    BREAKPOINT_INSN, NT_X86_XSTATE, PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP,
};
use crate::kernel_metadata::{ptrace_req_name, signal_name, syscall_name};
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::perf_counters::{PerfCounters, Rbc, TIME_SLICE_SIGNAL};
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::session::SessionKind;
use crate::sighandlers::{Sighandler, Sighandlers, SighandlersSharedPtr};
use crate::syscallbuf::{
    syscallbuf_shmem_path, syscallbuf_socket_path, RtcallInitBuffersParams, SyscallbufHdr,
    SyscallbufRecord, REPLAY_DESCHED_EVENT_FD, SYSCALLBUF_BUFFER_SIZE, SYSCALLBUF_DESCHED_SIGNAL,
};
use crate::task_group::{TaskGroup, TaskGroupSharedPtr};
use crate::trace_frame::{RawData, TraceFrame};
use crate::trace_stream::TraceWriterSharedPtr;
use crate::util::{
    ceil_page_size, is_ignored_replay_signal, page_size, prname_from_exe_image, resolve_exe_path,
    value_bytes, value_bytes_mut, word_size,
};
use crate::wait_status::WaitStatus;
use libc::{c_void, pid_t};
use nix::errno::{errno, Errno};
use nix::sys::socket::{
    accept, bind, listen, recvmsg, socket, AddressFamily, ControlMessageOwned, MsgFlags, SockAddr,
    SockFlag, SockType,
};
use nix::sys::uio::IoVec;
use std::cell::{Cell, RefCell};
use std::cmp::min;
use std::convert::TryFrom;
use std::ffi::CString;
use std::mem::{size_of, MaybeUninit};
use std::os::unix::io::RawFd;
use std::ptr::addr_of;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering::SeqCst};

pub type TaskSharedPtr = Rc<RefCell<Task>>;

const NUM_X86_DEBUG_REGS: usize = 8;
const NUM_X86_WATCHPOINTS: usize = 4;

bitflags! {
    /// Which resources a newly cloned Task shares with (or copies from)
    /// its parent. CloneFlags::empty() is the semantics of fork().
    pub struct CloneFlags: u32 {
        /// Child will share the table of signal dispositions with its
        /// parent.
        const CLONE_SHARE_SIGHANDLERS = 1 << 0;
        /// Child will join its parent's task group.
        const CLONE_SHARE_TASK_GROUP = 1 << 1;
        /// Child will share its parent's address space.
        const CLONE_SHARE_VM = 1 << 2;
        /// Kernel will clear and notify tid futex on task exit.
        const CLONE_CLEARTID = 1 << 3;
        /// Set the thread area to what's specified by the `tls` arg.
        const CLONE_SET_TLS = 1 << 4;
    }
}

bitflags! {
    pub struct DestroyBufferFlags: u32 {
        const DESTROY_SCRATCH = 1 << 0;
        const DESTROY_SYSCALLBUF = 1 << 1;
    }
}

/// Enumeration of ways to resume execution. See the ptrace manual for
/// details of the semantics of these.
///
/// We define a new datatype because the PTRACE_SYSEMU* requests aren't
/// part of the official ptrace API, and we want to use a strong type
/// for these resume requests to ensure callers don't confuse their
/// arguments.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResumeRequest {
    ResumeCont = libc::PTRACE_CONT,
    ResumeSinglestep = libc::PTRACE_SINGLESTEP,
    ResumeSyscall = libc::PTRACE_SYSCALL,
    ResumeSysemu = PTRACE_SYSEMU,
    ResumeSysemuSinglestep = PTRACE_SYSEMU_SINGLESTEP,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitRequest {
    /// After resuming, blocking-waitpid() until tracee status changes.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

pub type DebugRegs = Vec<WatchConfig>;

// The task currently being wait()ed on, for the SIGALRM runaway-recovery
// handler. The handler runs outside any call context, so this is a
// process-wide cell; the single-threaded controller guarantees only one
// task ever wait()s at a time.
static WAITER_TID: AtomicI32 = AtomicI32::new(0);
static WAITER_STATUS_PENDING: AtomicBool = AtomicBool::new(false);
static WAITER_INTERRUPTED: AtomicBool = AtomicBool::new(false);
static SHMEM_NONCE: AtomicU32 = AtomicU32::new(0);

/// The rbc interrupt has failed to stop the task currently being
/// wait()ed, so the alarm we programmed has fired. PTRACE_INTERRUPT the
/// runaway tracee.
extern "C" fn handle_runaway(_sig: libc::c_int) {
    let tid = WAITER_TID.load(SeqCst);
    if tid == 0 || !WAITER_STATUS_PENDING.load(SeqCst) {
        // False alarm; the genuine event won the race.
        return;
    }
    unsafe {
        libc::ptrace(libc::PTRACE_INTERRUPT, tid, 0, 0);
    }
    WAITER_INTERRUPTED.store(true, SeqCst);
}

fn is_signal_triggered_by_ptrace_interrupt(sig: i32) -> bool {
    // We sometimes see SIGSTOP at interrupts, though the docs don't
    // mention that.
    sig == libc::SIGTRAP || sig == libc::SIGSTOP
}

fn dr_user_word_offset(i: usize) -> usize {
    debug_assert!(i < NUM_X86_DEBUG_REGS);
    let base = MaybeUninit::<libc::user>::uninit();
    let p = base.as_ptr();
    let offset = unsafe { addr_of!((*p).u_debugreg) as usize - p as usize };
    offset + word_size() * i
}

fn num_bytes_to_dr_len(num_bytes: usize) -> u64 {
    match num_bytes {
        1 => 0x0,
        2 => 0x1,
        4 => 0x3,
        8 => 0x2,
        _ => fatal!("Unsupported breakpoint size {}", num_bytes),
    }
}

/// Send `sig` to task `tid` within group `tgid`.
fn sys_tgkill(tgid: pid_t, tid: pid_t, sig: i32) -> i32 {
    unsafe { libc::syscall(libc::SYS_tgkill, tgid, tid, sig) as i32 }
}

/// A "task" is a task in the linux usage: the unit of scheduling. (OS
/// people sometimes call this a "thread control block".) Multiple tasks
/// may share the same address space and file descriptors, in which case
/// they're commonly called "threads". Or two tasks may have their own
/// address spaces and file descriptors, in which case they're called
/// "processes". Both look the same to us, so no distinction is made.
pub struct Task {
    /// The running count of events recorded for this task. Starts at 1
    /// to match the trace's global time.
    pub thread_time: u32,
    /// Whether switching away from this task is allowed in its current
    /// state. Some operations must be completed atomically and aren't
    /// switchable.
    pub switchable: bool,
    /// True when this is switchable for semantic purposes, but definitely
    /// isn't blocked on any resource. In that case it's safe for the
    /// scheduler to do a blocking waitpid on this if its scheduling slot
    /// is open.
    pub pseudo_blocked: bool,
    /// Number of times this task has been scheduled in a row.
    pub succ_event_counter: i32,
    /// Set when any assumptions made about the status of this process
    /// have been invalidated and must be re-established with a waitpid()
    /// call; see destabilize_task_group().
    pub unstable: Cell<bool>,
    pub priority: i32,

    /// Scratch memory for redirecting may-block syscall outparams; a
    /// private mapping in the tracee.
    pub scratch_ptr: RemotePtr<Void>,
    pub scratch_size: usize,

    /// Nonzero after the recorder has flushed the syscallbuf, meaning a
    /// buffer reset must be prepared at the next opportunity.
    pub flushed_syscallbuf: bool,
    /// Set when code wants to prevent the syscall buffer from being reset
    /// when it normally would be; the desched'd-syscall path uses this.
    pub delay_syscallbuf_reset: bool,
    /// Set when the syscallbuf should be treated as empty even though its
    /// record counter is nonzero; used with delay_syscallbuf_reset to keep
    /// the buffer intact across reentrant events.
    pub delay_syscallbuf_flush: bool,

    /// Our dup of the tracee's desched counter fd, and the fd number it
    /// has on the tracee side.
    pub desched_fd: ScopedFd,
    pub desched_fd_child: i32,
    /// True once we've seen the first PTRACE_SECCOMP event from this
    /// task, i.e. the tracee has started using the syscall buffer.
    pub seccomp_bpf_enabled: bool,
    /// True when this was forced to enter a syscall with PTRACE_SYSCALL
    /// when PTRACE_SINGLESTEP was wanted.
    pub stepped_into_syscall: bool,

    pub hpc: PerfCounters,

    /// This is always the "real" tid of the tracee.
    pub tid: pid_t,
    /// This is always the recorded tid of the tracee. During recording
    /// it's synonymous with `tid`; during replay it's the tid that was
    /// recorded.
    pub rec_tid: pid_t,

    /// The instruction pointer from which traced syscalls made by the
    /// syscallbuf will originate.
    pub traced_syscall_ip: RemotePtr<Void>,
    /// The instruction pointer from which untraced syscalls will
    /// originate, used to determine whether a syscall is being made by
    /// the syscallbuf wrappers.
    pub untraced_syscall_ip: RemotePtr<Void>,
    /// Start and end of the mapping of the syscallbuf code section, used
    /// to determine whether a tracee's $ip is in the lib.
    pub syscallbuf_lib_start: RemotePtr<Void>,
    pub syscallbuf_lib_end: RemotePtr<Void>,
    /// Our mapping of the shared syscall buffer, null until init_buffers.
    syscallbuf_local: *mut SyscallbufHdr,
    pub num_syscallbuf_bytes: usize,
    /// The tracee's mapping of the buffer.
    pub syscallbuf_child: RemotePtr<SyscallbufHdr>,

    /// The set of signals currently blocked in the tracee, as inferred
    /// from its rt_sigprocmask calls.
    blocked_sigs: SigSet,
    /// The exe path passed to the most recent execve call.
    execve_file: String,
    /// The current stack of events being processed; the base is always
    /// the sentinel.
    pending_events: Vec<Event>,
    /// Task's OS name, what /proc/tid/comm would say.
    prname: String,
    /// Count of all rbcs seen by this task since tracees became
    /// consistent.
    rbcs: Rbc,

    /// When `registers_known`, these are our cached child registers. On
    /// resume the flag is unset; the next read after a trace-stop
    /// refreshes the cache. Setting registers updates the cache and the
    /// flag.
    registers: Registers,
    registers_known: bool,
    extra_registers: ExtraRegisters,
    extra_registers_known: bool,

    /// Futex list head from set_robust_list(); we only remember the
    /// address and size.
    robust_futex_list: RemotePtr<Void>,
    robust_futex_list_len: usize,

    session_kind: SessionKind,
    trace: TraceWriterSharedPtr,

    /// The signal-handler table of this task. Non-fork clone children
    /// share the table with their siblings; fork children get a copy;
    /// exec copies then strips user handlers.
    sighandlers: SighandlersSharedPtr,

    /// Stashed signal-delivery state, ready to be re-delivered at the
    /// next opportunity; meaningful only when stashed_wait_status != 0.
    stashed_si: libc::siginfo_t,
    stashed_wait_status: WaitStatus,

    tg: TaskGroupSharedPtr,
    /// From set_thread_area() or the clone() tls argument.
    thread_area: Option<UserDesc>,
    /// The memory cell the kernel will clear and notify on exit, if our
    /// clone parent requested it.
    tid_futex: RemotePtr<i32>,
    /// The `stack` argument passed to clone(); for "threads" the top of
    /// the user-allocated stack. NOT the stack pointer.
    pub top_of_stack: RemotePtr<Void>,
    /// The most recent status as returned by waitpid().
    wait_status: WaitStatus,

    as_: AddressSpaceSharedPtr,
}

impl Task {
    pub fn new(
        tid: pid_t,
        rec_tid: Option<pid_t>,
        priority: i32,
        session_kind: SessionKind,
        trace: TraceWriterSharedPtr,
        tg: TaskGroupSharedPtr,
        as_: AddressSpaceSharedPtr,
        sighandlers: SighandlersSharedPtr,
    ) -> Task {
        let rec_tid = rec_tid.filter(|t| *t > 0).unwrap_or(tid);
        Task {
            thread_time: 1,
            // Outside recording, switchability isn't meaningful.
            switchable: session_kind != SessionKind::Recording,
            pseudo_blocked: false,
            succ_event_counter: 0,
            unstable: Cell::new(false),
            priority,
            scratch_ptr: RemotePtr::null(),
            scratch_size: 0,
            flushed_syscallbuf: false,
            delay_syscallbuf_reset: false,
            delay_syscallbuf_flush: false,
            desched_fd: ScopedFd::new(),
            desched_fd_child: -1,
            seccomp_bpf_enabled: false,
            stepped_into_syscall: false,
            hpc: PerfCounters::new(tid),
            tid,
            rec_tid,
            traced_syscall_ip: RemotePtr::null(),
            untraced_syscall_ip: RemotePtr::null(),
            syscallbuf_lib_start: RemotePtr::null(),
            syscallbuf_lib_end: RemotePtr::null(),
            syscallbuf_local: std::ptr::null_mut(),
            num_syscallbuf_bytes: 0,
            syscallbuf_child: RemotePtr::null(),
            blocked_sigs: 0,
            execve_file: String::new(),
            pending_events: vec![Event::Sentinel],
            prname: "???".to_owned(),
            rbcs: 0,
            registers: Registers::new(),
            registers_known: false,
            extra_registers: ExtraRegisters::new(),
            extra_registers_known: false,
            robust_futex_list: RemotePtr::null(),
            robust_futex_list_len: 0,
            session_kind,
            trace,
            sighandlers,
            stashed_si: unsafe { std::mem::zeroed() },
            stashed_wait_status: WaitStatus::default(),
            tg,
            thread_area: None,
            tid_futex: RemotePtr::null(),
            top_of_stack: RemotePtr::null(),
            wait_status: WaitStatus::default(),
            as_,
        }
    }

    pub fn into_shared(t: Task) -> TaskSharedPtr {
        Rc::new(RefCell::new(t))
    }

    pub fn vm(&self) -> AddressSpaceSharedPtr {
        self.as_.clone()
    }

    pub fn task_group(&self) -> TaskGroupSharedPtr {
        self.tg.clone()
    }

    pub fn sighandlers(&self) -> SighandlersSharedPtr {
        self.sighandlers.clone()
    }

    pub fn trace_writer(&self) -> TraceWriterSharedPtr {
        self.trace.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.session_kind == SessionKind::Recording
    }

    pub fn tgid(&self) -> pid_t {
        self.tg.borrow().tgid
    }

    pub fn real_tgid(&self) -> pid_t {
        self.tg.borrow().real_tgid
    }

    pub fn name(&self) -> &str {
        &self.prname
    }

    pub fn exec_file(&self) -> &str {
        &self.execve_file
    }

    pub fn task_time(&self) -> u32 {
        self.thread_time
    }

    // ---------------------------------------------------------------
    // Wait status and its projections
    // ---------------------------------------------------------------

    /// The status as of the last successful wait()/try_wait().
    pub fn status(&self) -> WaitStatus {
        self.wait_status
    }

    /// Force the wait status of this to `status`, as if wait() had
    /// returned it.
    pub fn force_status(&mut self, status: WaitStatus) {
        self.wait_status = status;
    }

    /// The signal pending for this task as of the last wait; 0 means "no
    /// signal". Syscall stops and ptrace events are not signals.
    pub fn pending_sig(&self) -> i32 {
        if self.wait_status.get() == 0 {
            return 0;
        }
        self.wait_status.stop_sig().unwrap_or(0)
    }

    pub fn stop_sig(&self) -> i32 {
        self.wait_status.stop_sig().unwrap_or(0)
    }

    pub fn stopped(&self) -> bool {
        self.wait_status.stop_sig().is_some()
    }

    pub fn ptrace_event(&self) -> u32 {
        self.wait_status.ptrace_event().unwrap_or(0)
    }

    /// Return true if this exited because of a SYS_exit/exit_group call.
    pub fn exited(&self) -> bool {
        self.wait_status.exit_code().is_some()
    }

    pub fn signaled(&self) -> bool {
        self.wait_status.fatal_sig().is_some()
    }

    pub fn is_ptrace_seccomp_event(&self) -> bool {
        use crate::kernel_abi::PTRACE_EVENT_SECCOMP_OBSOLETE;
        let event = self.ptrace_event();
        event == libc::PTRACE_EVENT_SECCOMP as u32 || event == PTRACE_EVENT_SECCOMP_OBSOLETE
    }

    // ---------------------------------------------------------------
    // Event stack
    // ---------------------------------------------------------------

    /// The event at the top of this task's stack.
    pub fn ev(&self) -> &Event {
        self.pending_events.last().unwrap()
    }

    pub fn ev_mut(&mut self) -> &mut Event {
        self.pending_events.last_mut().unwrap()
    }

    pub fn push_event(&mut self, ev: Event) {
        self.pending_events.push(ev);
    }

    pub fn pop_event(&mut self, expected_type: EventType) -> Event {
        let ev = self.pending_events.pop().unwrap();
        assert_eq!(expected_type, ev.event_type());
        debug_assert!(!self.pending_events.is_empty(), "popped the sentinel");
        ev
    }

    pub fn pop_noop(&mut self) {
        self.pop_event(EventType::EvNoop);
    }

    pub fn pop_desched(&mut self) {
        self.pop_event(EventType::EvDesched);
    }

    pub fn pop_signal_delivery(&mut self) {
        self.pop_event(EventType::EvSignalDelivery);
    }

    pub fn pop_signal_handler(&mut self) {
        self.pop_event(EventType::EvSignalHandler);
    }

    pub fn pop_syscall(&mut self) {
        self.pop_event(EventType::EvSyscall);
    }

    pub fn pop_syscall_interruption(&mut self) {
        self.pop_event(EventType::EvSyscallInterruption);
    }

    pub fn pending_events_depth(&self) -> usize {
        self.pending_events.len()
    }

    /// Dump all pending events to the INFO log.
    pub fn log_pending_events(&self) {
        if self.pending_events.len() == 1 {
            log!(LogInfo, "(no pending events)");
            return;
        }
        // The sentinel at depth 0 isn't useful to log; skip it.
        for ev in self.pending_events.iter().skip(1).rev() {
            log!(LogInfo, "  {}", ev);
        }
    }

    /// Shortcut to the single desched record when there's a desched or
    /// desched-aborted syscall event on the stack, so that clients don't
    /// need to dig around in the event stack for it.
    pub fn desched_rec(&self) -> RemotePtr<SyscallbufRecord> {
        match self.ev() {
            ev if ev.is_syscall_event() => ev.syscall().desched_rec,
            Event::Desched(d) => d.rec,
            _ => RemotePtr::null(),
        }
    }

    /// Return true iff this is at an execution state where resuming might
    /// lead to the restart of an interrupted syscall: either directly at
    /// an interruption, or delivering a signal just after one.
    pub fn at_may_restart_syscall(&self) -> bool {
        let depth = self.pending_events.len();
        let prev_is_interruption = depth > 2
            && matches!(
                self.pending_events[depth - 2].event_type(),
                EventType::EvSyscallInterruption
            );
        match self.ev().event_type() {
            EventType::EvSyscallInterruption => true,
            EventType::EvSignalDelivery => prev_is_interruption,
            _ => false,
        }
    }

    /// Return nonzero if this may not be immediately runnable, i.e.
    /// resuming execution and then waitpid()'ing may block for an
    /// unbounded amount of time.
    pub fn may_be_blocked(&self) -> bool {
        match self.ev() {
            Event::Syscall(s) => s.state == SyscallState::ProcessingSyscall,
            Event::SignalDelivery(s) => s.delivered,
            _ => false,
        }
    }

    /// Return true if the current state looks like the interrupted
    /// syscall at the top of the event stack, if there is one.
    pub fn is_syscall_restart(&mut self) -> bool {
        let mut syscallno = self.regs().original_syscallno();
        let must_restart = syscallno == libc::SYS_restart_syscall;

        log!(
            LogDebug,
            "  is syscall interruption of recorded {}? (now {})",
            self.ev(),
            syscall_name(syscallno)
        );

        let is_restart = loop {
            if self.ev().event_type() != EventType::EvSyscallInterruption {
                break false;
            }
            let old = *self.ev().syscall();
            if must_restart {
                syscallno = old.no;
                log!(LogDebug, "  (SYS_restart_syscall)");
            }
            if old.no != syscallno {
                log!(
                    LogDebug,
                    "  interrupted {} != {}",
                    self.ev(),
                    syscall_name(syscallno)
                );
                break false;
            }
            // It's possible for the tracee to resume after a sighandler
            // with a fresh syscall that happens to be the same as the one
            // that was interrupted, so check the arguments too.
            let regs = self.regs();
            if !regs.syscall_args_eq(&old.regs) {
                log!(
                    LogDebug,
                    "  regs different at interrupted {}",
                    syscall_name(syscallno)
                );
                break false;
            }
            break true;
        };

        ed_assert!(
            self,
            !must_restart || is_restart,
            "Must restart {} but won't",
            syscall_name(syscallno)
        );
        if is_restart {
            log!(LogDebug, "  restart of {}", syscall_name(syscallno));
        }
        is_restart
    }

    // ---------------------------------------------------------------
    // Resume and wait
    // ---------------------------------------------------------------

    /// Continue according to the semantics implied by the helper's name.
    /// If `sig` is nonzero it's delivered to this as part of the resume.
    /// Return true if the subsequent wait succeeded, false if it was
    /// interrupted.
    pub fn cont(&mut self, sig: i32) -> bool {
        self.resume_execution(ResumeRequest::ResumeCont, WaitRequest::ResumeWait, sig, 0)
    }

    pub fn cont_nonblocking(&mut self, sig: i32) {
        self.resume_execution(
            ResumeRequest::ResumeCont,
            WaitRequest::ResumeNonblocking,
            sig,
            0,
        );
    }

    pub fn cont_singlestep(&mut self, sig: i32) -> bool {
        self.resume_execution(
            ResumeRequest::ResumeSinglestep,
            WaitRequest::ResumeWait,
            sig,
            0,
        )
    }

    pub fn cont_syscall(&mut self, sig: i32) -> bool {
        self.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            sig,
            0,
        )
    }

    pub fn cont_syscall_nonblocking(&mut self, sig: i32) {
        self.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeNonblocking,
            sig,
            0,
        );
    }

    pub fn cont_sysemu(&mut self, sig: i32) -> bool {
        self.resume_execution(ResumeRequest::ResumeSysemu, WaitRequest::ResumeWait, sig, 0)
    }

    pub fn cont_sysemu_singlestep(&mut self, sig: i32) -> bool {
        self.resume_execution(
            ResumeRequest::ResumeSysemuSinglestep,
            WaitRequest::ResumeWait,
            sig,
            0,
        )
    }

    /// Resume execution `how`, delivering `sig` if nonzero. If
    /// `rbc_period` is nonzero, reset the rbc counter to that budget
    /// first. After resuming, wait per `wait_how`. The register caches
    /// are invalid once this returns.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        sig: i32,
        rbc_period: Rbc,
    ) -> bool {
        // Accumulate rbcs so none are lost if we reprogram the counter.
        self.rbc_count();
        if rbc_period != 0 {
            self.hpc.reset(rbc_period);
        }
        log!(
            LogDebug,
            "resuming execution of {} with {}",
            self.tid,
            ptrace_req_name(how as u32)
        );
        self.xptrace(how as u32, 0, sig as usize as *mut c_void);
        self.registers_known = false;
        self.extra_registers_known = false;
        if let WaitRequest::ResumeNonblocking = wait_how {
            return true;
        }
        self.wait()
    }

    /// Block until the status of this changes. Return true if successful,
    /// false if interrupted, and don't return at all on errors.
    ///
    /// During recording a 3-second wall-clock alarm backs this up: if the
    /// tracee is running away in userspace, PTRACE_INTERRUPT it and
    /// synthesize a time-slice-signal stop. Races between the interrupt
    /// and a genuine event resolve in favor of the genuine event.
    pub fn wait(&mut self) -> bool {
        log!(LogDebug, "going into blocking waitpid({}) ...", self.tid);
        ed_assert!(self, !self.unstable.get(), "Don't wait for unstable tasks");

        // We only need the runaway escape hatch during recording. If
        // tracees go runaway during replay, something else is at fault.
        let enable_wait_interrupt = self.is_recording();
        if enable_wait_interrupt {
            WAITER_TID.store(self.tid, SeqCst);
            WAITER_STATUS_PENDING.store(true, SeqCst);
            // Where does the 3 seconds come from? No especially good
            // reason. It's a last-ditch recovery mechanism, not a primary
            // thread scheduler, so it should be high enough to almost
            // never interfere with legitimate events.
            unsafe { libc::alarm(3) };
        }

        let mut raw_status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::__WALL) };
        if enable_wait_interrupt {
            WAITER_TID.store(0, SeqCst);
            unsafe { libc::alarm(0) };
        }

        if ret < 0 && errno() == libc::EINTR {
            log!(LogDebug, "  waitpid({}) interrupted!", self.tid);
            return false;
        }
        WAITER_STATUS_PENDING.store(false, SeqCst);
        self.wait_status = WaitStatus::new(raw_status);
        log!(
            LogDebug,
            "  waitpid({}) returns {}; status {}",
            self.tid,
            ret,
            self.wait_status
        );
        ed_assert!(
            self,
            self.tid == ret,
            "waitpid({}) failed with {}",
            self.tid,
            ret
        );

        // If some other ptrace-stop happened to race with our
        // PTRACE_INTERRUPT, let the other event win. We only want to
        // interrupt tracees stuck running in userspace.
        let interrupted_group_stop = self
            .wait_status
            .group_stop_sig()
            .map_or(false, is_signal_triggered_by_ptrace_interrupt);
        if WAITER_INTERRUPTED.load(SeqCst) && interrupted_group_stop {
            log!(LogWarn, "Forced to PTRACE_INTERRUPT tracee");
            self.wait_status = WaitStatus::for_stop_sig(TIME_SLICE_SIGNAL);
            self.stashed_wait_status = self.wait_status;
            self.stashed_si = synthesize_poll_in_siginfo(TIME_SLICE_SIGNAL, self.hpc.rbc_fd());
            // Starve the runaway task of CPU time. It just got the
            // equivalent of hundreds of time slices.
            self.succ_event_counter = i32::MAX / 2;
        } else if WAITER_INTERRUPTED.load(SeqCst) {
            log!(
                LogWarn,
                "  PTRACE_INTERRUPT raced with another event {}",
                self.wait_status
            );
        }
        WAITER_INTERRUPTED.store(false, SeqCst);
        true
    }

    /// Return true if the status of this has changed, but don't block.
    pub fn try_wait(&mut self) -> bool {
        let mut raw_status: i32 = 0;
        let ret = unsafe {
            libc::waitpid(
                self.tid,
                &mut raw_status,
                libc::WNOHANG | libc::__WALL | libc::WSTOPPED,
            )
        };
        log!(
            LogDebug,
            "waitpid({}, NOHANG) returns {}, status {:#x}",
            self.tid,
            ret,
            raw_status
        );
        ed_assert!(
            self,
            0 <= ret,
            "waitpid({}, NOHANG) failed with {}",
            self.tid,
            ret
        );
        if ret == self.tid {
            self.wait_status = WaitStatus::new(raw_status);
            true
        } else {
            false
        }
    }

    // ---------------------------------------------------------------
    // Stashed signals
    // ---------------------------------------------------------------

    /// If a signal becomes pending at an awkward time, but could be
    /// handled "soon", stash the current pending-signal state here.
    /// Exactly one signal may be stashed at a time.
    pub fn stash_sig(&mut self) {
        let sig = self.pending_sig();
        debug_assert!(sig != 0);
        ed_assert!(
            self,
            !self.has_stashed_sig(),
            "Tried to stash {} when {} was already stashed",
            signal_name(sig),
            signal_name(self.stashed_si.si_signo)
        );
        self.stashed_wait_status = self.wait_status;
        self.stashed_si = self.get_siginfo();
    }

    pub fn has_stashed_sig(&self) -> bool {
        self.stashed_wait_status.get() != 0
    }

    /// Restore the stashed wait-status and return the stashed siginfo.
    /// After this, has_stashed_sig() is false.
    pub fn pop_stash_sig(&mut self) -> libc::siginfo_t {
        debug_assert!(self.has_stashed_sig());
        self.wait_status = self.stashed_wait_status;
        self.stashed_wait_status = WaitStatus::default();
        self.stashed_si
    }

    /// Return the siginfo at the signal-stop of this. Not meaningful
    /// unless this is actually at a signal stop.
    pub fn get_siginfo(&self) -> libc::siginfo_t {
        let mut si: libc::siginfo_t = unsafe { std::mem::zeroed() };
        self.xptrace(
            libc::PTRACE_GETSIGINFO,
            0,
            &mut si as *mut libc::siginfo_t as *mut c_void,
        );
        si
    }

    pub fn set_siginfo(&self, si: &libc::siginfo_t) {
        self.xptrace(
            libc::PTRACE_SETSIGINFO,
            0,
            si as *const libc::siginfo_t as *mut c_void,
        );
    }

    /// Return the message associated with the current ptrace event, e.g.
    /// the new child's pid at PTRACE_EVENT_CLONE.
    pub fn get_ptrace_eventmsg(&self) -> usize {
        let mut msg: usize = 0;
        self.xptrace(
            libc::PTRACE_GETEVENTMSG,
            0,
            &mut msg as *mut usize as *mut c_void,
        );
        msg
    }

    // ---------------------------------------------------------------
    // Registers
    // ---------------------------------------------------------------

    /// The current registers, from the cache or the kernel.
    pub fn regs(&mut self) -> Registers {
        if !self.registers_known {
            log!(LogDebug, "  (refreshing register cache)");
            let mut ptrace_regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
            self.xptrace(
                libc::PTRACE_GETREGS,
                0,
                &mut ptrace_regs as *mut libc::user_regs_struct as *mut c_void,
            );
            self.registers = Registers::from_ptrace(ptrace_regs);
            self.registers_known = true;
        }
        self.registers
    }

    pub fn set_regs(&mut self, regs: &Registers) {
        self.registers = *regs;
        self.xptrace(
            libc::PTRACE_SETREGS,
            0,
            self.registers.ptrace_regs() as *const libc::user_regs_struct as *mut c_void,
        );
        self.registers_known = true;
    }

    pub fn ip(&mut self) -> RemotePtr<Void> {
        self.regs().ip()
    }

    pub fn sp(&mut self) -> RemotePtr<Void> {
        self.regs().sp()
    }

    pub fn extra_regs(&mut self) -> ExtraRegisters {
        if !self.extra_registers_known {
            log!(LogDebug, "  (refreshing extra-register cache)");
            let size = xsave_area_size();
            let mut data = vec![0u8; size];
            let mut vec = libc::iovec {
                iov_base: data.as_mut_ptr() as *mut c_void,
                iov_len: size,
            };
            self.xptrace(
                libc::PTRACE_GETREGSET,
                NT_X86_XSTATE as usize,
                &mut vec as *mut libc::iovec as *mut c_void,
            );
            ed_assert!(
                self,
                vec.iov_len == size,
                "Didn't get enough register data; expected {} but got {}",
                size,
                vec.iov_len
            );
            self.extra_registers.set_data(data);
            self.extra_registers_known = true;
        }
        self.extra_registers.clone()
    }

    pub fn set_extra_regs(&mut self, regs: &ExtraRegisters) {
        ed_assert!(self, !regs.empty(), "Trying to set empty ExtraRegisters");
        self.extra_registers = regs.clone();
        let mut vec = libc::iovec {
            iov_base: self.extra_registers.data_mut().as_mut_ptr() as *mut c_void,
            iov_len: self.extra_registers.data().len(),
        };
        self.xptrace(
            libc::PTRACE_SETREGSET,
            NT_X86_XSTATE as usize,
            &mut vec as *mut libc::iovec as *mut c_void,
        );
        self.extra_registers_known = true;
    }

    /// Fetch the value of `regno` into `buf`: general registers first,
    /// then the extended file. Returns (size, defined).
    pub fn get_reg(&mut self, buf: &mut [u8], regno: GdbRegister) -> (usize, bool) {
        if let Some(size) = self.regs().read_register(buf, regno) {
            return (size, true);
        }
        if let Some(size) = self.extra_regs().read_register(buf, regno) {
            return (size, true);
        }
        (0, false)
    }

    /// One register in the debugger's wire representation.
    pub fn debugger_register(&mut self, regno: GdbRegister) -> DbgRegValue {
        let mut value = [0u8; MAX_REG_SIZE_BYTES];
        let (size, defined) = self.get_reg(&mut value, regno);
        DbgRegValue {
            name: regno.as_u32(),
            value,
            // Registers this build doesn't model still occupy their slot
            // in the 'g' reply, as undefined bytes of their proper width.
            size: if defined { size } else { 8 },
            defined,
        }
    }

    /// The whole register file in the debugger's numbering, for a 'g'
    /// reply.
    pub fn debugger_register_file(&mut self) -> Vec<DbgRegValue> {
        (0..DREG_NUM_REGS)
            .map(|regno| self.debugger_register(GdbRegister::try_from(regno).unwrap()))
            .collect()
    }

    /// Assuming ip() is just past a breakpoint instruction, adjust it
    /// backwards to point at that breakpoint insn.
    pub fn move_ip_before_breakpoint(&mut self) {
        let mut r = self.regs();
        r.undo_breakpoint();
        self.set_regs(&r);
    }

    // ---------------------------------------------------------------
    // Hardware debug registers
    // ---------------------------------------------------------------

    /// Program the debug registers to the vector of watchpoint
    /// configurations (up to four), updating the debug control register
    /// appropriately. Returns true if all registers were programmed.
    /// Atomic: on any failure, no watchpoint is left enabled.
    pub fn set_debug_regs(&self, regs: &DebugRegs) -> bool {
        // Reset the debug status since we're about to change the set of
        // programmed watchpoints, and clear them all so a partial failure
        // can't leave a subset enabled.
        self.xptrace(
            libc::PTRACE_POKEUSER,
            dr_user_word_offset(6),
            std::ptr::null_mut(),
        );
        self.xptrace(
            libc::PTRACE_POKEUSER,
            dr_user_word_offset(7),
            std::ptr::null_mut(),
        );
        if regs.len() > NUM_X86_WATCHPOINTS {
            return false;
        }

        let mut dr7: u64 = 0;
        for (dr, reg) in regs.iter().enumerate() {
            unsafe { Errno::clear() };
            if self.fallible_ptrace(
                libc::PTRACE_POKEUSER,
                dr_user_word_offset(dr),
                reg.addr.as_usize() as *mut c_void,
            ) != 0
            {
                return false;
            }
            // Local-enable bit plus type and length fields for this slot.
            dr7 |= 1 << (dr * 2);
            dr7 |= (reg.type_ as u64) << (16 + dr * 4);
            dr7 |= num_bytes_to_dr_len(reg.num_bytes) << (18 + dr * 4);
        }
        unsafe { Errno::clear() };
        0 == self.fallible_ptrace(
            libc::PTRACE_POKEUSER,
            dr_user_word_offset(7),
            dr7 as *mut c_void,
        )
    }

    /// The debug-status register (DR6).
    pub fn debug_status(&self) -> usize {
        unsafe { Errno::clear() };
        self.fallible_ptrace(
            libc::PTRACE_PEEKUSER,
            dr_user_word_offset(6),
            std::ptr::null_mut(),
        ) as usize
    }

    /// The address programmed at watchpoint slot `i`.
    pub fn watchpoint_addr(&self, i: usize) -> RemotePtr<Void> {
        debug_assert!(i < NUM_X86_WATCHPOINTS);
        unsafe { Errno::clear() };
        RemotePtr::from_val(self.fallible_ptrace(
            libc::PTRACE_PEEKUSER,
            dr_user_word_offset(i),
            std::ptr::null_mut(),
        ) as usize)
    }

    // ---------------------------------------------------------------
    // Memory
    // ---------------------------------------------------------------

    /// Read tracee memory using PTRACE_PEEKDATA calls. Slow, only use as
    /// a fallback. Returns the number of bytes actually read.
    pub fn read_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> usize {
        let mut nread: usize = 0;
        let word = word_size();
        unsafe { Errno::clear() };
        // Only read aligned words. This ensures we can always read the
        // last byte before an unmapped region.
        while nread < buf.len() {
            let start = addr.as_usize() + nread;
            let start_word = start & !(word - 1);
            let end_word = start_word + word;
            let length = min(end_word - start, buf.len() - nread);

            let v = self.fallible_ptrace(libc::PTRACE_PEEKDATA, start_word, std::ptr::null_mut());
            if errno() != 0 {
                break;
            }
            let bytes = v.to_ne_bytes();
            let in_word = start - start_word;
            buf[nread..nread + length].copy_from_slice(&bytes[in_word..in_word + length]);
            nread += length;
        }
        nread
    }

    /// Write tracee memory using PTRACE_POKEDATA calls. Slow, only use as
    /// a fallback. Returns the number of bytes actually written.
    pub fn write_bytes_ptrace(&self, addr: RemotePtr<Void>, buf: &[u8]) -> usize {
        let mut nwritten: usize = 0;
        let word = word_size();
        unsafe { Errno::clear() };
        // Only write aligned words. This ensures we can always write the
        // last byte before an unmapped region.
        while nwritten < buf.len() {
            let start = addr.as_usize() + nwritten;
            let start_word = start & !(word - 1);
            let end_word = start_word + word;
            let length = min(end_word - start, buf.len() - nwritten);

            let mut v: i64 = 0;
            if length < word {
                // Read-modify-write only for a partial word; an
                // unconditional read could touch an unmapped byte past
                // the end of the write.
                v = self.fallible_ptrace(
                    libc::PTRACE_PEEKDATA,
                    start_word,
                    std::ptr::null_mut(),
                );
                if errno() != 0 {
                    break;
                }
            }
            let mut bytes = v.to_ne_bytes();
            let in_word = start - start_word;
            bytes[in_word..in_word + length].copy_from_slice(&buf[nwritten..nwritten + length]);
            v = i64::from_ne_bytes(bytes);
            self.fallible_ptrace(libc::PTRACE_POKEDATA, start_word, v as *mut c_void);
            if errno() != 0 {
                break;
            }
            nwritten += length;
        }
        nwritten
    }

    /// Read up to `buf.len()` bytes at `addr`. A short count is returned
    /// at a mapping boundary; Err(()) when nothing was readable at all.
    pub fn read_bytes_fallible(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &mut [u8],
    ) -> Result<usize, ()> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.vm_mem_fd_open() {
            return Ok(self.read_bytes_ptrace(addr, buf));
        }

        let mut all_read = 0;
        let mut reopened_mem_fd = false;
        while all_read < buf.len() {
            let fd = self.vm_mem_fd();
            unsafe { Errno::clear() };
            let nread = unsafe {
                libc::pread64(
                    fd,
                    buf[all_read..].as_mut_ptr() as *mut c_void,
                    buf.len() - all_read,
                    (addr.as_usize() + all_read) as i64,
                )
            };
            // The mem fd we open just after exec refers to the dying
            // address space; reads from it return 0 with errno 0.
            // Reopening the fd once makes reads work.
            if 0 == nread && 0 == all_read && 0 == errno() && !reopened_mem_fd {
                reopened_mem_fd = true;
                if !self.open_mem_fd() {
                    return Ok(0);
                }
                continue;
            }
            if nread <= 0 {
                if all_read > 0 {
                    // We did read some data, so return success and ignore
                    // the error.
                    unsafe { Errno::clear() };
                    return Ok(all_read);
                }
                return Err(());
            }
            all_read += nread as usize;
        }

        Ok(all_read)
    }

    /// Read exactly `buf.len()` bytes or die.
    pub fn read_bytes_helper(&mut self, addr: RemotePtr<Void>, buf: &mut [u8]) {
        let buf_len = buf.len();
        let result = self.read_bytes_fallible(addr, buf);
        let nread = result.unwrap_or(0);
        ed_assert!(
            self,
            nread == buf_len,
            "Should have read {} bytes from {}, but only read {}",
            buf_len,
            addr,
            nread
        );
    }

    /// Write `buf` at `addr`. If `ok` is provided, a short write clears
    /// it; otherwise a short write is fatal.
    pub fn write_bytes_helper(
        &mut self,
        addr: RemotePtr<Void>,
        buf: &[u8],
        ok: Option<&mut bool>,
    ) {
        if buf.is_empty() {
            return;
        }

        if !self.vm_mem_fd_open() {
            let nwritten = self.write_bytes_ptrace(addr, buf);
            if let Some(ok) = ok {
                if nwritten < buf.len() {
                    *ok = false;
                }
            } else {
                ed_assert!(
                    self,
                    nwritten == buf.len(),
                    "Should have written {} bytes to {}, but only wrote {}",
                    buf.len(),
                    addr,
                    nwritten
                );
            }
            return;
        }

        let fd = self.vm_mem_fd();
        unsafe { Errno::clear() };
        let nwritten = unsafe {
            libc::pwrite64(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                addr.as_usize() as i64,
            )
        };
        // See the comment in read_bytes_fallible().
        if 0 == nwritten && 0 == errno() {
            self.open_mem_fd();
            return self.write_bytes_helper(addr, buf, ok);
        }
        if nwritten < 0 && errno() == libc::EPERM {
            fatal!(
                "Can't write to /proc/{}/mem; maybe the kernel is locked \
                 down or the mapping is sealed",
                self.tid
            );
        }

        let nwritten = if nwritten < 0 { 0 } else { nwritten as usize };
        if let Some(ok) = ok {
            if nwritten < buf.len() {
                *ok = false;
            }
        } else {
            ed_assert!(
                self,
                nwritten == buf.len(),
                "Should have written {} bytes to {}, but only wrote {}",
                buf.len(),
                addr,
                nwritten
            );
        }
    }

    /// Read and return the C string located at `child_addr`.
    ///
    /// We're only guaranteed that [child_addr, end_of_page) is mapped, so
    /// walk page by page, never dereferencing past a page boundary before
    /// testing the page before it.
    pub fn read_c_str(&mut self, child_addr: RemotePtr<Void>) -> String {
        let mut p = child_addr;
        let mut s: Vec<u8> = Vec::new();
        loop {
            let end_of_page = ceil_page_size(p.as_usize() + 1);
            let nbytes = end_of_page - p.as_usize();
            let mut buf = vec![0u8; nbytes];

            self.read_bytes_helper(p, &mut buf);
            for &b in &buf {
                if b == 0 {
                    return String::from_utf8_lossy(&s).into_owned();
                }
                s.push(b);
            }
            p = RemotePtr::from_val(end_of_page);
        }
    }

    /// Return the word at `child_addr`.
    pub fn read_word(&mut self, child_addr: RemotePtr<Void>) -> usize {
        let mut buf = [0u8; size_of::<usize>()];
        self.read_bytes_helper(child_addr, &mut buf);
        usize::from_ne_bytes(buf)
    }

    /// Read a typed value from tracee memory.
    pub fn read_val_mem<D>(&mut self, child_addr: RemotePtr<D>) -> D {
        let mut v: D = unsafe { std::mem::zeroed() };
        let buf = unsafe { value_bytes_mut(&mut v) };
        self.read_bytes_helper(RemotePtr::cast(child_addr), buf);
        v
    }

    /// Write a typed value into tracee memory.
    pub fn write_val_mem<D>(&mut self, child_addr: RemotePtr<D>, val: &D) {
        let buf = unsafe { value_bytes(val) };
        self.write_bytes_helper(RemotePtr::cast(child_addr), buf, None);
    }

    /// Copy `num_bytes` from `src` to `dst` within this address space.
    pub fn remote_memcpy(
        &mut self,
        dst: RemotePtr<Void>,
        src: RemotePtr<Void>,
        num_bytes: usize,
    ) {
        let mut buf = vec![0u8; num_bytes];
        self.read_bytes_helper(src, &mut buf);
        self.write_bytes_helper(dst, &buf, None);
    }

    fn vm_mem_fd(&self) -> RawFd {
        self.as_.borrow().mem_fd_raw()
    }

    fn vm_mem_fd_open(&self) -> bool {
        self.as_.borrow().mem_fd_is_open()
    }

    /// Open /proc/tid/mem for our AddressSpace, closing the old one
    /// first. Returns false if the process is gone or unreadable; memory
    /// access then falls back to the ptrace path.
    pub fn open_mem_fd(&mut self) -> bool {
        let path = format!("/proc/{}/mem", self.tid);
        let fd = ScopedFd::open_path(path.as_str(), nix::fcntl::OFlag::O_RDWR);
        if !fd.is_open() {
            log!(
                LogWarn,
                "Can't open {}; process gone or permissions too tight, \
                 falling back to ptrace for memory access",
                path
            );
            self.as_.borrow_mut().set_mem_fd(ScopedFd::new());
            return false;
        }
        self.as_.borrow_mut().set_mem_fd(fd);
        true
    }

    pub fn open_mem_fd_if_needed(&mut self) {
        if !self.vm_mem_fd_open() {
            self.open_mem_fd();
        }
    }

    // ---------------------------------------------------------------
    // Breakpoints
    // ---------------------------------------------------------------

    /// Plant (or reference-bump) a software breakpoint at `addr`.
    pub fn vm_set_breakpoint(&mut self, addr: RemotePtr<Void>, which: TrapType) {
        let already_set = self.as_.borrow().breakpoint_at(addr).is_some();
        let overwritten = if already_set {
            0
        } else {
            let mut b = [0u8; 1];
            self.read_bytes_helper(addr, &mut b);
            self.write_bytes_helper(addr, &[BREAKPOINT_INSN], None);
            b[0]
        };
        self.as_
            .borrow_mut()
            .note_breakpoint_set(addr, which, overwritten);
    }

    /// Drop one reference to the breakpoint at `addr`, restoring the
    /// original byte when the last reference goes away.
    pub fn vm_remove_breakpoint(&mut self, addr: RemotePtr<Void>, which: TrapType) {
        let restored = self.as_.borrow_mut().note_breakpoint_removed(addr, which);
        if let Some(byte) = restored {
            self.write_bytes_helper(addr, &[byte], None);
        }
    }

    // ---------------------------------------------------------------
    // Emulated syscalls
    // ---------------------------------------------------------------

    /// This must be in an emulated syscall, entered through cont_sysemu()
    /// or cont_sysemu_singlestep(), but that's not checked. If so, step
    /// over the system call instruction to "exit" the emulated syscall.
    ///
    /// This operation is (assumed to be) idempotent; checkpointing relies
    /// on that.
    pub fn finish_emulated_syscall(&mut self) {
        let r = self.regs();
        let ip = r.ip();
        let known_idempotent_insn_after_syscall =
            self.is_traced_syscall() || self.is_untraced_syscall();

        // We're about to single-step the tracee at its $ip just past the
        // syscall insn, then back up the $ip to where it started. That
        // executes the insn at the current $ip twice; if it isn't
        // idempotent, replay diverges from recording.
        //
        // To prevent that, insert a breakpoint trap at the current $ip.
        // Executing that has no side effects. After the single-step,
        // remove the breakpoint, restoring the original insn.
        //
        // Syscalls made from the syscallbuf are known to execute an
        // idempotent insn after the syscall trap (restore register from
        // stack), so they skip this expense.
        if !known_idempotent_insn_after_syscall {
            self.vm_set_breakpoint(ip, TrapType::BkptInternal);
        }
        self.cont_sysemu_singlestep(0);

        if !known_idempotent_insn_after_syscall {
            // The breakpoint should raise SIGTRAP, but we can also see
            // any of the host of replay-ignored signals.
            let sig = self.pending_sig();
            ed_assert!(
                self,
                sig == libc::SIGTRAP || is_ignored_replay_signal(sig),
                "PENDING SIG IS {}",
                signal_name(sig)
            );
            self.vm_remove_breakpoint(ip, TrapType::BkptInternal);
        }
        self.set_regs(&r);
        self.force_status(WaitStatus::default());
    }

    // ---------------------------------------------------------------
    // Syscall-buffer protocol
    // ---------------------------------------------------------------

    pub fn syscallbuf_hdr(&self) -> Option<&SyscallbufHdr> {
        if self.syscallbuf_local.is_null() {
            None
        } else {
            Some(unsafe { &*self.syscallbuf_local })
        }
    }

    pub fn syscallbuf_hdr_mut(&mut self) -> Option<&mut SyscallbufHdr> {
        if self.syscallbuf_local.is_null() {
            None
        } else {
            Some(unsafe { &mut *self.syscallbuf_local })
        }
    }

    /// Return true if this task is within the syscallbuf library. This
    /// does NOT imply that $ip is at a buffered syscall.
    pub fn is_in_syscallbuf(&mut self) -> bool {
        let ip = self.ip();
        self.syscallbuf_lib_start <= ip && ip < self.syscallbuf_lib_end
    }

    /// Return true when this is at a traced syscall made by the
    /// syscallbuf code; is_in_syscallbuf() is implied.
    pub fn is_traced_syscall(&mut self) -> bool {
        self.ip() == self.traced_syscall_ip
    }

    /// Return true when this is just before a syscall trap instruction
    /// for a traced syscall made by the syscallbuf code.
    pub fn is_entering_traced_syscall(&mut self) -> bool {
        let next_ip = self.ip() + crate::kernel_abi::SYSCALL_INSN.len();
        next_ip == self.traced_syscall_ip
    }

    /// Return true when this is at an untraced syscall, i.e. one
    /// initiated by a function in the syscallbuf; is_in_syscallbuf() is
    /// implied.
    pub fn is_untraced_syscall(&mut self) -> bool {
        self.ip() == self.untraced_syscall_ip
    }

    /// Return true if this is at an ioctl on the tracee's desched fd.
    pub fn is_desched_event_syscall(&mut self) -> bool {
        let regs = self.regs();
        libc::SYS_ioctl == regs.original_syscallno()
            && (self.desched_fd_child == regs.arg1_signed() as i32
                || self.desched_fd_child == REPLAY_DESCHED_EVENT_FD)
    }

    /// Arming is PERF_EVENT_IOC_ENABLE on the desched fd.
    pub fn is_arm_desched_event_syscall(&mut self) -> bool {
        self.is_desched_event_syscall()
            && perf_event_open_sys::bindings::ENABLE as usize == self.regs().arg2()
    }

    /// Disarming is PERF_EVENT_IOC_DISABLE on the desched fd.
    pub fn is_disarm_desched_event_syscall(&mut self) -> bool {
        self.is_desched_event_syscall()
            && perf_event_open_sys::bindings::DISABLE as usize == self.regs().arg2()
    }

    pub fn is_desched_sig_blocked(&self) -> bool {
        self.is_sig_blocked(SYSCALLBUF_DESCHED_SIGNAL)
    }

    /// Call this before recording events or data. Records syscallbuf
    /// contents and flushes the buffer, if there's buffered data.
    pub fn maybe_flush_syscallbuf(&mut self) {
        if self.ev().event_type() == EventType::EvSyscallbufFlush {
            // Already flushing.
            return;
        }
        let num_rec_bytes = match self.syscallbuf_hdr() {
            Some(hdr) => hdr.num_rec_bytes,
            None => return,
        };
        if num_rec_bytes == 0 || self.delay_syscallbuf_flush {
            // No records; no flushing to do.
            return;
        }

        // Write the entire buffer in one shot without parsing it, because
        // replay will take care of that.
        self.push_event(Event::SyscallbufFlush);
        let total = crate::syscallbuf::flush_blob_size(num_rec_bytes);
        let blob: Vec<u8> = unsafe {
            std::slice::from_raw_parts(self.syscallbuf_local as *const u8, total).to_vec()
        };
        let child_addr = RemotePtr::cast(self.syscallbuf_child);
        self.record_local(child_addr, &blob);
        self.record_current_event();
        self.pop_event(EventType::EvSyscallbufFlush);

        // Reset the buffer.
        let delay_reset = self.delay_syscallbuf_reset;
        if let Some(hdr) = self.syscallbuf_hdr_mut() {
            debug_assert!(hdr.abort_commit == 0);
            if !delay_reset {
                hdr.num_rec_bytes = 0;
            }
        }
        self.flushed_syscallbuf = true;
    }

    /// Initialize tracee buffers in this, i.e., implement the
    /// rtcall-init-buffers trap. This task must be at the point of *exit
    /// from* the rtcall. Registers will be updated with the return value,
    /// which is also returned from this call. `map_hint` suggests where
    /// to map the region.
    pub fn init_buffers(
        &mut self,
        map_hint: RemotePtr<Void>,
        share_desched_fd: bool,
    ) -> RemotePtr<Void> {
        // NB: the tracee can't be interrupted with a signal while we're
        // processing the rtcall, because it's masked off all signals.
        let child_args =
            RemotePtr::<RtcallInitBuffersParams>::from_val(self.regs().arg1());
        let mut args: RtcallInitBuffersParams = self.read_val_mem(child_args);

        ed_assert!(
            self,
            Flags::get().use_syscall_buffer == (args.syscallbuf_enabled != 0),
            "Tracee thinks syscallbuf is {}abled, tracer thinks {}abled",
            if args.syscallbuf_enabled != 0 { "en" } else { "dis" },
            if Flags::get().use_syscall_buffer { "en" } else { "dis" }
        );

        let mut child_map_addr = RemotePtr::null();
        if args.syscallbuf_enabled != 0 {
            self.traced_syscall_ip = args.traced_syscall_ip.into();
            self.untraced_syscall_ip = args.untraced_syscall_ip.into();
            child_map_addr = self.init_syscall_buffer(map_hint);
            args.syscallbuf_ptr = child_map_addr.as_usize();
            self.init_desched_fd(&args, share_desched_fd);
            // Zero out the scratch fd cell; it holds a real fd number,
            // which in general will not be the same across record and
            // replay.
            self.write_val_mem(RemotePtr::<i32>::from_val(args.fdptr), &0i32);
        } else {
            args.syscallbuf_ptr = 0;
        }

        // Return the mapped buffer to the child.
        self.write_val_mem(child_args, &args);

        // The tracee doesn't need the addr in the result slot (it's in
        // the inout args), but stashing it there lets replay check the
        // segment maps at the same address.
        let mut r = self.regs();
        r.set_syscall_result(child_map_addr.as_usize());
        self.set_regs(&r);

        let locked = self.is_desched_sig_blocked() as u8;
        if let Some(hdr) = self.syscallbuf_hdr_mut() {
            hdr.locked = locked;
        }

        child_map_addr
    }

    /// Map the syscall buffer, shared between this process and the
    /// tracee. `map_hint` is the address where it must land in the tracee
    /// (asserted), or null for don't-care.
    fn init_syscall_buffer(&mut self, map_hint: RemotePtr<Void>) -> RemotePtr<Void> {
        use nix::sys::mman::{shm_open, shm_unlink};

        // Create the segment we'll share with the tracee.
        let nonce = SHMEM_NONCE.fetch_add(1, SeqCst);
        let shmem_name = syscallbuf_shmem_path(self.tid, nonce);
        let shmem_fd = match shm_open(
            shmem_name.as_str(),
            nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_EXCL | nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::from_bits_truncate(0o600),
        ) {
            Ok(fd) => fd,
            Err(e) => fatal!("Failed to create shmem segment {}: {}", shmem_name, e),
        };
        if unsafe { libc::ftruncate(shmem_fd, SYSCALLBUF_BUFFER_SIZE as i64) } != 0 {
            fatal!("Failed to resize shmem segment to {}", SYSCALLBUF_BUFFER_SIZE);
        }

        // Map the segment in our own address space.
        let map_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                SYSCALLBUF_BUFFER_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                shmem_fd,
                0,
            )
        };
        if map_addr == libc::MAP_FAILED {
            fatal!("Failed to mmap shmem region");
        }

        // Map it in the tracee, via its view of our fd.
        let proc_path = format!(
            "/proc/{}/fd/{}\0",
            unsafe { libc::getpid() },
            shmem_fd
        );
        let child_map_addr;
        let child_shmem_fd;
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            {
                let mut child_path = AutoRestoreMem::new(&mut remote, proc_path.as_bytes());
                let path_addr = child_path.get();
                child_shmem_fd = child_path.remote().syscall(
                    libc::SYS_open,
                    &[path_addr.as_usize(), libc::O_RDWR as usize, 0o600],
                ) as i32;
            }
            if child_shmem_fd < 0 {
                fatal!("Failed to open shmem fd in tracee: {}", child_shmem_fd);
            }
            child_map_addr = RemotePtr::<Void>::from_val(remote.syscall(
                libc::SYS_mmap,
                &[
                    map_hint.as_usize(),
                    SYSCALLBUF_BUFFER_SIZE,
                    (libc::PROT_READ | libc::PROT_WRITE) as usize,
                    libc::MAP_SHARED as usize,
                    child_shmem_fd as usize,
                    0,
                ],
            ) as usize);
            remote.syscall(libc::SYS_close, &[child_shmem_fd as usize]);
        }
        ed_assert!(
            self,
            map_hint.is_null() || child_map_addr == map_hint,
            "Tracee mapped syscallbuf at {} instead of hint {}",
            child_map_addr,
            map_hint
        );

        self.syscallbuf_child = RemotePtr::cast(child_map_addr);
        self.syscallbuf_local = map_addr as *mut SyscallbufHdr;
        self.num_syscallbuf_bytes = SYSCALLBUF_BUFFER_SIZE;
        // No records to begin with.
        if let Some(hdr) = self.syscallbuf_hdr_mut() {
            *hdr = SyscallbufHdr::default();
        }

        self.as_.borrow_mut().map(
            child_map_addr,
            SYSCALLBUF_BUFFER_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            0,
            "[syscallbuf]",
        );

        let _ = shm_unlink(shmem_name.as_str());
        unsafe { libc::close(shmem_fd) };

        child_map_addr
    }

    /// Share the desched-event fd that the tracee has already opened to
    /// this process, via the SCM_RIGHTS dance over a Unix socket. (As of
    /// old kernels the fd can't be grabbed through /proc/<tid>/fd.)
    fn init_desched_fd(&mut self, args: &RtcallInitBuffersParams, share_desched_fd: bool) {
        if !share_desched_fd {
            self.desched_fd_child = REPLAY_DESCHED_EVENT_FD;
            return;
        }

        // The sockaddr the tracee prepared uses the recorded tid.
        let sock_path = syscallbuf_socket_path(self.rec_tid);
        let _ = std::fs::remove_file(&sock_path);
        let listen_sock = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            Option::<nix::sys::socket::SockProtocol>::None,
        )
        .unwrap_or_else(|e| fatal!("Failed to create listen socket: {}", e));
        let addr = SockAddr::new_unix(sock_path.as_str())
            .unwrap_or_else(|e| fatal!("Bad socket path {}: {}", sock_path, e));
        if bind(listen_sock, &addr).is_err() {
            fatal!("Failed to bind listen socket {}", sock_path);
        }
        if listen(listen_sock, 1).is_err() {
            fatal!("Failed to mark listening for listen socket");
        }

        let tracee_fd;
        let tracee_fd_number;
        {
            let mut remote = AutoRemoteSyscalls::new(self);

            let child_sock = remote.syscall(
                libc::SYS_socket,
                &[libc::AF_UNIX as usize, libc::SOCK_STREAM as usize, 0],
            ) as i32;
            if child_sock < 0 {
                fatal!("Failed to create child socket: {}", child_sock);
            }

            // Initiate the tracee connect(), but don't wait for it to
            // finish: it can't until we accept.
            remote.syscall_dont_wait(
                libc::SYS_connect,
                &[
                    child_sock as usize,
                    args.sockaddr,
                    size_of::<libc::sockaddr_un>(),
                ],
            );
            let sock = accept(listen_sock)
                .unwrap_or_else(|e| fatal!("Failed to accept tracee connection: {}", e));
            let child_ret = remote.wait_syscall();
            if child_ret != 0 {
                fatal!("Failed to connect() in tracee: {}", child_ret);
            }
            // Socket name not needed anymore.
            let _ = std::fs::remove_file(&sock_path);

            // Have the tracee sendmsg() its desched fd; it may block until
            // our recvmsg, so again don't wait.
            remote.syscall_dont_wait(libc::SYS_sendmsg, &[child_sock as usize, args.msg, 0]);
            let (fd, remote_fdno) = recv_fd(sock);
            let sent = remote.wait_syscall();
            if sent <= 0 {
                fatal!("Failed to sendmsg() in tracee: {}", sent);
            }

            let _ = nix::unistd::close(listen_sock);
            let _ = nix::unistd::close(sock);
            remote.syscall(libc::SYS_close, &[child_sock as usize]);

            tracee_fd = fd;
            tracee_fd_number = remote_fdno;
        }

        self.desched_fd = ScopedFd::from_raw(tracee_fd);
        self.desched_fd_child = tracee_fd_number;
    }

    /// Destroy in the tracee the buffer(s) in `which`. The tracee must be
    /// in a state where remote syscalls can be executed.
    pub fn destroy_buffers(&mut self, which: DestroyBufferFlags) {
        let scratch_ptr = self.scratch_ptr;
        let scratch_size = self.scratch_size;
        let syscallbuf_child = self.syscallbuf_child;
        let num_syscallbuf_bytes = self.num_syscallbuf_bytes;
        let desched_fd_child = self.desched_fd_child;

        {
            let mut remote = AutoRemoteSyscalls::new(self);
            if which.contains(DestroyBufferFlags::DESTROY_SCRATCH) && !scratch_ptr.is_null() {
                remote.syscall(
                    libc::SYS_munmap,
                    &[scratch_ptr.as_usize(), scratch_size],
                );
            }
            if which.contains(DestroyBufferFlags::DESTROY_SYSCALLBUF)
                && !syscallbuf_child.is_null()
            {
                remote.syscall(
                    libc::SYS_munmap,
                    &[syscallbuf_child.as_usize(), num_syscallbuf_bytes],
                );
                if desched_fd_child >= 0 {
                    remote.syscall(libc::SYS_close, &[desched_fd_child as usize]);
                }
            }
        }

        if which.contains(DestroyBufferFlags::DESTROY_SCRATCH) && !scratch_ptr.is_null() {
            self.as_.borrow_mut().unmap(scratch_ptr, scratch_size);
            self.scratch_ptr = RemotePtr::null();
        }
        if which.contains(DestroyBufferFlags::DESTROY_SYSCALLBUF) && !syscallbuf_child.is_null() {
            self.as_
                .borrow_mut()
                .unmap(RemotePtr::cast(syscallbuf_child), num_syscallbuf_bytes);
            self.syscallbuf_child = RemotePtr::null();
        }
    }

    /// Destroy tracer-side state of the buffers (as opposed to remote,
    /// tracee-side state).
    fn destroy_local_buffers(&mut self) {
        self.desched_fd.close();
        if !self.syscallbuf_local.is_null() {
            unsafe {
                libc::munmap(
                    self.syscallbuf_local as *mut c_void,
                    self.num_syscallbuf_bytes,
                );
            }
            self.syscallbuf_local = std::ptr::null_mut();
        }
    }

    // ---------------------------------------------------------------
    // Signal dispositions
    // ---------------------------------------------------------------

    pub fn is_sig_blocked(&self, sig: i32) -> bool {
        self.blocked_sigs & sig_bit(sig) != 0
    }

    /// Return true iff `sig` is SIG_IGN, or it's SIG_DFL and the default
    /// disposition is "ignore".
    pub fn is_sig_ignored(&self, sig: i32) -> bool {
        self.sighandlers.borrow().get(sig).ignored(sig)
    }

    pub fn signal_disposition(&self, sig: i32) -> usize {
        self.sighandlers.borrow().get(sig).sa.k_sa_handler
    }

    /// Return true if a user sighandler will be invoked when `sig` is
    /// received.
    pub fn signal_has_user_handler(&self, sig: i32) -> bool {
        self.sighandlers.borrow().get(sig).is_user_handler()
    }

    pub fn signal_action(&self, sig: i32) -> KernelSigaction {
        self.sighandlers.borrow().get(sig).sa
    }

    /// Call this after `sig` is delivered to this task. Emulate
    /// sighandler updates induced by the delivery.
    pub fn signal_delivered(&mut self, sig: i32) {
        let mut table = self.sighandlers.borrow_mut();
        let h = table.get_mut(sig);
        if h.resethand {
            *h = Sighandler::default();
        }
    }

    /// Call this when SYS_rt_sigaction is finishing with `regs`.
    pub fn update_sigaction(&mut self, regs: &Registers) {
        let sig = regs.arg1_signed() as i32;
        let new_sigaction = RemotePtr::<KernelSigaction>::from_val(regs.arg2());
        if 0 == regs.syscall_result() && !new_sigaction.is_null() {
            // A new sighandler was installed; update our table.
            let sa: KernelSigaction = self.read_val_mem(new_sigaction);
            self.sighandlers
                .borrow_mut()
                .set(sig, Sighandler::from_action(sa));
        }
    }

    /// Call this when the tracee is about to complete a
    /// SYS_rt_sigprocmask syscall with `regs`.
    pub fn update_sigmask(&mut self, regs: &Registers) {
        let how = regs.arg1_signed() as i32;
        let setp = RemotePtr::<SigSet>::from_val(regs.arg2());

        if regs.syscall_failed() || setp.is_null() {
            return;
        }

        let locked = self
            .syscallbuf_hdr()
            .map_or(false, |hdr| hdr.locked != 0);
        ed_assert!(
            self,
            !locked || self.is_desched_sig_blocked(),
            "syscallbuf is locked but the desched signal isn't blocked"
        );

        let set: SigSet = self.read_val_mem(setp);

        // Update the blocked signals per `how`.
        match how {
            libc::SIG_BLOCK => self.blocked_sigs |= set,
            libc::SIG_UNBLOCK => self.blocked_sigs &= !set,
            libc::SIG_SETMASK => self.blocked_sigs = set,
            _ => fatal!("Unknown sigmask manipulator {}", how),
        }

        // In the syscallbuf, we rely on the desched signal being raised
        // when tracees are descheduled in blocked syscalls. But if
        // tracees block the signal, we don't get notified and deadlock.
        // So the buffer is locked while the desched signal is blocked,
        // which prevents the tracee from attempting a buffered call.
        let locked = self.is_desched_sig_blocked() as u8;
        if let Some(hdr) = self.syscallbuf_hdr_mut() {
            hdr.locked = locked;
        }
    }

    /// For tests and spawn: establish the blocked-signal mask without a
    /// tracee round trip.
    pub fn set_blocked_sigs(&mut self, blocked_sigs: SigSet) {
        self.blocked_sigs = blocked_sigs;
    }

    // ---------------------------------------------------------------
    // rbc accounting
    // ---------------------------------------------------------------

    /// Return the total number of rbcs ever executed by this task,
    /// harvesting the current counter value.
    pub fn rbc_count(&mut self) -> Rbc {
        let hpc_rbcs = self.hpc.read_rbc();
        if hpc_rbcs > 0 {
            self.rbcs += hpc_rbcs;
            self.hpc.reset(0);
        }
        self.rbcs
    }

    pub fn set_rbc_count(&mut self, count: Rbc) {
        self.rbcs = count;
    }

    /// Called after the first exec, when the session first enters a
    /// consistent state; counts accumulated before that are noise from
    /// our own setup.
    pub fn flush_inconsistent_state(&mut self) {
        self.rbcs = 0;
    }

    // ---------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------

    pub fn record_current_event(&mut self) {
        let ev = *self.ev();
        self.record_event(&ev);
    }

    /// Record `ev` with the current execution state so that it can be
    /// used or verified during replay.
    pub fn record_event(&mut self, ev: &Event) {
        self.maybe_flush_syscallbuf();

        let trace = self.trace.clone();
        let global_time = trace.borrow().time();
        let mut frame = TraceFrame {
            global_time,
            thread_time: self.thread_time,
            tid: self.tid,
            ev: ev.encode(),
            rbc: 0,
            recorded_regs: None,
            recorded_extra_regs: None,
        };
        self.thread_time += 1;

        if ev.has_exec_info() {
            self.rbcs += self.hpc.read_rbc();
            frame.rbc = self.rbcs;
            frame.recorded_regs = Some(self.regs());
            if ev.record_extra_regs() {
                frame.recorded_extra_regs = Some(self.extra_regs());
            }
        }

        if Flags::get().checksum {
            self.checksum_process_memory(global_time);
        }

        trace.borrow_mut().write_frame(frame);

        if ev.has_exec_info() {
            self.hpc.reset(Flags::get().max_rbc);
        }
    }

    /// Save data already read from the tracee to the trace.
    pub fn record_local(&mut self, addr: RemotePtr<Void>, data: &[u8]) {
        self.maybe_flush_syscallbuf();
        let ev = self.ev().encode();
        let trace = self.trace.clone();
        let global_time = trace.borrow().time();
        trace.borrow_mut().write_raw(RawData {
            addr,
            data: data.to_vec(),
            ev,
            global_time,
        });
    }

    /// Read `num_bytes` at `addr` from the tracee and save them to the
    /// trace.
    pub fn record_remote(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        // We shouldn't be recording a scratch address.
        ed_assert!(self, addr.is_null() || addr != self.scratch_ptr);

        self.maybe_flush_syscallbuf();

        let mut data = Vec::new();
        if !addr.is_null() && num_bytes > 0 {
            data.resize(num_bytes, 0u8);
            self.read_bytes_helper(addr, &mut data);
        }
        let ev = self.ev().encode();
        let trace = self.trace.clone();
        let global_time = trace.borrow().time();
        trace.borrow_mut().write_raw(RawData {
            addr,
            data,
            ev,
            global_time,
        });
    }

    /// Record the C string at `str_addr`, including its NUL byte.
    pub fn record_remote_str(&mut self, str_addr: RemotePtr<Void>) {
        self.maybe_flush_syscallbuf();

        let s = self.read_c_str(str_addr);
        let mut data = s.into_bytes();
        data.push(0);
        let ev = self.ev().encode();
        let trace = self.trace.clone();
        let global_time = trace.borrow().time();
        trace.borrow_mut().write_raw(RawData {
            addr: str_addr,
            data,
            ev,
            global_time,
        });
    }

    /// Sum the bytes of every readable private mapping, for hunting
    /// replay divergence.
    fn checksum_process_memory(&mut self, global_time: u64) {
        let ranges: Vec<(RemotePtr<Void>, usize)> = {
            let vm = self.as_.borrow();
            vm.mappings()
                .filter(|m| m.prot & libc::PROT_READ != 0)
                .map(|m| (m.range.start, m.range.num_bytes()))
                .collect()
        };
        let mut checksum: u64 = 0;
        for (start, len) in ranges {
            let mut buf = vec![0u8; len];
            if let Ok(nread) = self.read_bytes_fallible(start, &mut buf) {
                for &b in &buf[..nread] {
                    checksum = checksum.wrapping_mul(31).wrapping_add(b as u64);
                }
            }
        }
        log!(
            LogDebug,
            "memory checksum at time {} is {:#x}",
            global_time,
            checksum
        );
    }

    // ---------------------------------------------------------------
    // VM cache maintenance
    // ---------------------------------------------------------------

    /// If `syscallno` at `state` changes our VM mapping, update the cache
    /// for the change. The exception is mmap() calls: they're complicated
    /// enough to be handled separately by the syscall processors.
    pub fn maybe_update_vm(&mut self, syscallno: i64, state: SyscallState) {
        let r = self.regs();
        if state != SyscallState::ExitingSyscall
            || (r.syscall_failed() && syscallno != libc::SYS_mprotect)
        {
            return;
        }
        match syscallno {
            libc::SYS_brk => {
                let addr = RemotePtr::from_val(r.arg1());
                if addr.is_null() {
                    // A brk() update of NULL is observed with libc,
                    // apparently its means of finding out the initial brk.
                    return;
                }
                self.as_.borrow_mut().brk(addr);
            }
            libc::SYS_mmap => {
                log!(LogDebug, "(mmap will receive / has received direct processing)");
            }
            libc::SYS_mprotect => {
                let addr = RemotePtr::from_val(r.arg1());
                let num_bytes = r.arg2();
                let prot = r.arg3_signed() as i32;
                self.as_.borrow_mut().protect(addr, num_bytes, prot);
            }
            libc::SYS_mremap => {
                if r.syscall_failed() && r.syscall_result_signed() != -libc::ENOMEM as i64 {
                    return;
                }
                let old_addr = RemotePtr::from_val(r.arg1());
                let old_num_bytes = r.arg2();
                let new_addr = RemotePtr::from_val(r.syscall_result());
                let new_num_bytes = r.arg3();
                self.as_
                    .borrow_mut()
                    .remap(old_addr, old_num_bytes, new_addr, new_num_bytes);
            }
            libc::SYS_munmap => {
                let addr = RemotePtr::from_val(r.arg1());
                let num_bytes = r.arg2();
                self.as_.borrow_mut().unmap(addr, num_bytes);
            }
            _ => (),
        }
    }

    // ---------------------------------------------------------------
    // exec
    // ---------------------------------------------------------------

    /// Call this when this task has entered an execve() call.
    pub fn pre_exec(&mut self) {
        let path_addr = RemotePtr::from_val(self.regs().arg1());
        let execve_file = self.read_c_str(path_addr);
        self.execve_file = resolve_exe_path(&execve_file, self.real_tgid());
    }

    /// Call this after an execve() syscall finishes. Emulate the resource
    /// updates induced by the exec.
    pub fn post_exec(&mut self) {
        let fresh_handlers = self.sighandlers.borrow().clone_table();
        self.sighandlers = fresh_handlers;
        self.sighandlers.borrow_mut().reset_user_handlers();

        self.as_.borrow_mut().erase_task(self.tid);
        debug_assert!(!self.execve_file.is_empty());
        let new_as = AddressSpace::new(&self.execve_file);
        new_as.borrow_mut().insert_task(self.tid);
        self.as_ = new_as;
        self.prname = prname_from_exe_image(&self.execve_file);

        self.registers_known = false;
        self.extra_registers_known = false;
        self.thread_area = None;
        self.syscallbuf_child = RemotePtr::null();
        self.syscallbuf_local = std::ptr::null_mut();
        self.num_syscallbuf_bytes = 0;
        self.traced_syscall_ip = RemotePtr::null();
        self.untraced_syscall_ip = RemotePtr::null();
    }

    /// Call this after the tracee successfully makes a prctl(PR_SET_NAME)
    /// call.
    pub fn update_prname(&mut self, child_addr: RemotePtr<Void>) {
        let mut name = [0u8; 16];
        self.read_bytes_helper(child_addr, &mut name);
        name[15] = 0;
        let len = name.iter().position(|&b| b == 0).unwrap();
        self.prname = String::from_utf8_lossy(&name[..len]).into_owned();
    }

    // ---------------------------------------------------------------
    // Task-tracked tracee resources
    // ---------------------------------------------------------------

    /// Update the futex robust-list head pointer.
    pub fn set_robust_list(&mut self, list: RemotePtr<Void>, len: usize) {
        self.robust_futex_list = list;
        self.robust_futex_list_len = len;
    }

    pub fn robust_list(&self) -> RemotePtr<Void> {
        self.robust_futex_list
    }

    pub fn robust_list_len(&self) -> usize {
        self.robust_futex_list_len
    }

    /// Update the thread area from the user_desc the tracee passed to
    /// set_thread_area() or clone().
    pub fn set_thread_area(&mut self, tls: RemotePtr<UserDesc>) {
        let desc: UserDesc = self.read_val_mem(tls);
        self.thread_area = Some(desc);
    }

    pub fn tls(&self) -> Option<&UserDesc> {
        self.thread_area.as_ref()
    }

    /// Update the clear-tid futex to `tid_addr`.
    pub fn set_tid_addr(&mut self, tid_addr: RemotePtr<i32>) {
        log!(LogDebug, "updating cleartid futex to {}", tid_addr);
        self.tid_futex = tid_addr;
    }

    pub fn tid_addr(&self) -> RemotePtr<i32> {
        self.tid_futex
    }

    /// Wait for the futex in this address space to hold `val`.
    ///
    /// WARNING: this implementation semi-busy-waits for the value change.
    /// Use only in contexts where the futex will change "soon".
    pub fn futex_wait(&mut self, futex: RemotePtr<i32>, val: i32) {
        loop {
            let cur: i32 = self.read_val_mem(futex);
            if cur == val {
                break;
            }
            // Try to give our scheduling slot to the kernel thread that's
            // going to write the futex.
            unsafe { libc::sched_yield() };
        }
    }

    // ---------------------------------------------------------------
    // Clone, spawn, death
    // ---------------------------------------------------------------

    /// Return a new Task cloned from this one; `flags` are a set of
    /// CloneFlags that determine which resources are shared or copied.
    /// `new_tid` is the tid the kernel assigned; `new_rec_tid` is only
    /// relevant to replay.
    pub fn clone_task(
        &mut self,
        flags: CloneFlags,
        stack: RemotePtr<Void>,
        tls: RemotePtr<UserDesc>,
        cleartid_addr: RemotePtr<i32>,
        new_tid: pid_t,
        new_rec_tid: Option<pid_t>,
    ) -> Task {
        let tg = if flags.contains(CloneFlags::CLONE_SHARE_TASK_GROUP) {
            self.tg.clone()
        } else {
            TaskGroup::new(new_rec_tid.unwrap_or(new_tid), new_tid)
        };
        let vm = if flags.contains(CloneFlags::CLONE_SHARE_VM) {
            self.as_.clone()
        } else {
            self.as_.borrow().clone_space()
        };
        let sighandlers = if flags.contains(CloneFlags::CLONE_SHARE_SIGHANDLERS) {
            self.sighandlers.clone()
        } else {
            self.sighandlers.borrow().clone_table()
        };

        let mut t = Task::new(
            new_tid,
            new_rec_tid,
            self.priority,
            self.session_kind,
            self.trace.clone(),
            tg,
            vm,
            sighandlers,
        );

        t.syscallbuf_lib_start = self.syscallbuf_lib_start;
        t.syscallbuf_lib_end = self.syscallbuf_lib_end;
        t.blocked_sigs = self.blocked_sigs;
        // Clone children, both thread and fork, inherit the parent
        // prname.
        t.prname = self.prname.clone();
        if flags.contains(CloneFlags::CLONE_CLEARTID) {
            log!(LogDebug, "cleartid futex is {}", cleartid_addr);
            debug_assert!(!cleartid_addr.is_null());
            t.tid_futex = cleartid_addr;
        } else {
            log!(LogDebug, "(clone child not enabling CLEARTID)");
        }
        if !stack.is_null() {
            t.top_of_stack = stack;
            let stack_page = RemotePtr::from_val(stack.as_usize() - page_size());
            if let Some(m) = self.as_.borrow().mapping_of(stack_page) {
                log!(
                    LogDebug,
                    "mapping stack for {} at {:#x}",
                    new_tid,
                    m.range.start.as_usize()
                );
            }
            let label = format!("[stack:{}]", new_tid);
            t.as_.borrow_mut().map(
                stack_page,
                page_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_GROWSDOWN,
                0,
                &label,
            );
        }

        t.tg.borrow_mut().insert_task(t.tid);
        t.as_.borrow_mut().insert_task(t.tid);

        // wait() before trying anything that might need ptrace to access
        // memory.
        t.wait();
        t.open_mem_fd_if_needed();
        if flags.contains(CloneFlags::CLONE_SET_TLS) {
            t.set_thread_area(tls);
        }

        t
    }

    /// Translate kernel clone(2) flag bits into our resource-sharing
    /// flags.
    pub fn clone_flags_from_kernel(kernel_flags: usize) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if kernel_flags & libc::CLONE_SIGHAND as usize != 0 {
            flags |= CloneFlags::CLONE_SHARE_SIGHANDLERS;
        }
        if kernel_flags & libc::CLONE_THREAD as usize != 0 {
            flags |= CloneFlags::CLONE_SHARE_TASK_GROUP;
        }
        if kernel_flags & libc::CLONE_VM as usize != 0 {
            flags |= CloneFlags::CLONE_SHARE_VM;
        }
        if kernel_flags & libc::CLONE_CHILD_CLEARTID as usize != 0 {
            flags |= CloneFlags::CLONE_CLEARTID;
        }
        if kernel_flags & libc::CLONE_SETTLS as usize != 0 {
            flags |= CloneFlags::CLONE_SET_TLS;
        }
        flags
    }

    /// Call this when performing a clone syscall in this task. Returns
    /// true if the call completed, false if it was interrupted and needs
    /// to be resumed.
    pub fn clone_syscall_is_complete(&mut self) -> bool {
        let event = self.ptrace_event();
        if event == libc::PTRACE_EVENT_CLONE as u32 || event == libc::PTRACE_EVENT_FORK as u32 {
            return true;
        }
        ed_assert!(
            self,
            event == 0,
            "Unexpected ptrace event {}",
            crate::kernel_metadata::ptrace_event_name(event)
        );

        // EAGAIN can happen here when "too many processes are already
        // running"; ENOSYS has also been observed.
        let result = self.regs().syscall_result_signed();
        ed_assert!(
            self,
            syscall_may_restart(result)
                || -libc::ENOSYS as i64 == result
                || -libc::EAGAIN as i64 == result,
            "Unexpected task status {} (syscall result {})",
            self.status(),
            result
        );
        false
    }

    /// Fork and exec a task to run `exe` with `argv`/`envp`. The child
    /// configures itself (no ASLR, rdtsc trapping, parent-death signal),
    /// SIGSTOPs itself, and execs; we seize it with the full ptrace
    /// option set and run it to the known SIGSTOP starting point.
    pub fn spawn(
        kind: SessionKind,
        trace: TraceWriterSharedPtr,
        exe: &str,
        argv: &[String],
        envp: &[String],
        rec_tid: Option<pid_t>,
    ) -> Task {
        let exe_c = CString::new(exe).unwrap();
        let argv_c: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()).unwrap())
            .collect();
        let envp_c: Vec<CString> = envp
            .iter()
            .map(|e| CString::new(e.as_str()).unwrap())
            .collect();

        let tid = unsafe { libc::fork() };
        if 0 == tid {
            set_up_process();
            // The preceding code must run before sending SIGSTOP: after
            // SIGSTOP, replay emulates almost all syscalls, but we need
            // the above to run "for real".

            // Signal to the tracer that we're configured.
            unsafe {
                libc::kill(libc::getpid(), libc::SIGSTOP);
            }

            // Do a small amount of dummy work to retire some conditional
            // branches, so the tracer can check at the first trap that the
            // rbc counter seems to be working.
            let start = unsafe { libc::rand() } % 5;
            let num_its = start + 5;
            let mut sum: i32 = 0;
            for i in start..num_its {
                sum += i;
            }
            unsafe {
                libc::syscall(
                    libc::SYS_write,
                    -1i64,
                    &sum as *const i32,
                    size_of::<i32>(),
                );
            }

            let mut argv_ptrs: Vec<*const libc::c_char> =
                argv_c.iter().map(|a| a.as_ptr()).collect();
            argv_ptrs.push(std::ptr::null());
            let mut envp_ptrs: Vec<*const libc::c_char> =
                envp_c.iter().map(|e| e.as_ptr()).collect();
            envp_ptrs.push(std::ptr::null());
            unsafe {
                libc::execvpe(exe_c.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                // Not reached on success.
                libc::_exit(126);
            }
        }
        if tid < 0 {
            fatal!("Failed to fork tracee for {}", exe);
        }

        unsafe {
            libc::signal(
                libc::SIGALRM,
                handle_runaway as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }

        let tg = TaskGroup::new(rec_tid.unwrap_or(tid), tid);
        let vm = AddressSpace::new(exe);
        // The very first task we fork inherits our own signal
        // dispositions; new tasks will transitively inherit from it.
        let sighandlers = Sighandlers::new();
        sighandlers.borrow_mut().init_from_current_process();

        let mut t = Task::new(tid, rec_tid, 0, kind, trace, tg, vm, sighandlers);
        // Don't use the POSIX wrapper; it doesn't necessarily read the
        // entire sigset tracked by the kernel.
        let mut blocked: SigSet = 0;
        if unsafe {
            libc::syscall(
                libc::SYS_rt_sigprocmask,
                libc::SIG_BLOCK,
                0usize,
                &mut blocked as *mut SigSet,
                size_of::<SigSet>(),
            )
        } != 0
        {
            fatal!("Failed to read blocked signals");
        }
        t.set_blocked_sigs(blocked);
        t.tg.borrow_mut().insert_task(tid);
        t.as_.borrow_mut().insert_task(tid);
        t.execve_file = exe.to_owned();
        t.prname = prname_from_exe_image(exe);

        // Sync with the child process.
        let mut options: usize = (libc::PTRACE_O_TRACESYSGOOD
            | libc::PTRACE_O_TRACEFORK
            | libc::PTRACE_O_TRACEVFORK
            | libc::PTRACE_O_TRACECLONE
            | libc::PTRACE_O_TRACEEXEC
            | libc::PTRACE_O_TRACEVFORKDONE
            | libc::PTRACE_O_TRACEEXIT
            | libc::PTRACE_O_TRACESECCOMP
            | libc::PTRACE_O_EXITKILL) as usize;
        unsafe { Errno::clear() };
        let mut ret = t.fallible_ptrace(libc::PTRACE_SEIZE, 0, options as *mut c_void);
        if ret < 0 && errno() == libc::EINVAL {
            // PTRACE_O_EXITKILL appeared in kernel 3.8; we only need it
            // for more robust cleanup, so tolerate not having it.
            options &= !(libc::PTRACE_O_EXITKILL as usize);
            unsafe { Errno::clear() };
            ret = t.fallible_ptrace(libc::PTRACE_SEIZE, 0, options as *mut c_void);
        }
        ed_assert!(&t, ret == 0, "PTRACE_SEIZE failed for tid {}", t.tid);

        // PTRACE_SEIZE is fundamentally racy by design. We depend on
        // stopping the tracee at a known location, so keep running it
        // until it reaches the known-safe SIGSTOP.
        loop {
            t.wait();
            if t.stop_sig() == libc::SIGSTOP {
                break;
            }
            t.cont_nonblocking(0);
        }
        t.force_status(WaitStatus::default());
        t.open_mem_fd();
        t
    }

    /// Mark the members of this task's group as "unstable": even though a
    /// task may look runnable, it actually might not be, and the kernel
    /// must be left to harvest them in its own order. Needed for mass
    /// task death at exit_group() and core-dumping signals; blocking on
    /// any single dying member would (usually) deadlock.
    pub fn destabilize_task_group(&self, session: &crate::session::Session) {
        if let Event::SignalDelivery(s) = self.ev() {
            log!(
                LogWarn,
                "task {} (process {}) dying from fatal signal {}",
                self.rec_tid,
                self.tgid(),
                signal_name(s.sig())
            );
        }
        session.destabilize_task_group(&self.tg.borrow(), self);
    }

    /// Destroy the OS task backing this by sending it SIGKILL and
    /// ensuring it was delivered. After this, the only meaningful thing
    /// left is dropping the Task.
    pub fn kill(&mut self) {
        log!(LogDebug, "sending SIGKILL to {} ...", self.tid);
        sys_tgkill(self.real_tgid(), self.tid, libc::SIGKILL);

        if !self.unstable.get() {
            self.wait();
            if let Some(sig) = self.wait_status.fatal_sig() {
                debug_assert_eq!(libc::SIGKILL, sig);
                // The task is already dead and reaped; skip any
                // waitpid()'ing during cleanup.
                self.unstable.set(true);
            }
        }

        // Don't attempt to synchronize on the cleartid futex. We wouldn't
        // be able to reliably read it, and it's pointless anyway.
        self.tid_futex = RemotePtr::null();
    }

    /// Tear down this task: counters, local buffer mappings, ptrace
    /// attachment, and the zombie. The registries (session, group, vm)
    /// drop their membership first so futex logic sees the right
    /// sibling count.
    pub fn destroy(&mut self) {
        log!(
            LogDebug,
            "task {} (rec:{}) is dying ...",
            self.tid,
            self.rec_tid
        );
        if self.ev().event_type() != EventType::EvSentinel && self.pending_events.len() > 2 {
            log!(
                LogWarn,
                "{} still has pending events. From top down:",
                self.tid
            );
            self.log_pending_events();
        }

        self.tg.borrow_mut().erase_task(self.tid);
        self.as_.borrow_mut().erase_task(self.tid);

        self.hpc.destroy();
        self.destroy_local_buffers();
        self.detach_and_reap();

        log!(LogDebug, "  dead");
    }

    /// Detach from ptrace and wait for the zombie. If the task group is
    /// destabilized, skip reaping and let the kernel harvest; if a
    /// cleartid futex is set and siblings still share the address space,
    /// wait for the kernel to clear it.
    fn detach_and_reap(&mut self) {
        self.fallible_ptrace(libc::PTRACE_DETACH, 0, std::ptr::null_mut());
        if self.unstable.get() {
            // Unstable exits may result in the kernel *not* clearing the
            // futex, for example on fatal signals. Blocking on either the
            // reap or the futex could deadlock.
            log!(
                LogWarn,
                "{} is unstable; not blocking on its termination",
                self.tid
            );
            return;
        }

        log!(LogDebug, "Joining with exiting {} ...", self.tid);
        loop {
            let mut raw_status: i32 = 0;
            let err = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::__WALL) };
            if -1 == err && errno() == libc::ECHILD {
                log!(LogDebug, " ... ECHILD");
                break;
            } else if -1 == err {
                debug_assert_eq!(libc::EINTR, errno());
            }
            if err == self.tid {
                let status = WaitStatus::new(raw_status);
                self.wait_status = status;
                if status.exit_code().is_some() || status.fatal_sig().is_some() {
                    log!(LogDebug, " ... exited with status {}", status);
                    break;
                }
                debug_assert_eq!(
                    Some(libc::PTRACE_EVENT_EXIT as u32),
                    status.ptrace_event()
                );
            }
        }

        let tid_futex = self.tid_futex;
        if !tid_futex.is_null() && !self.as_.borrow().task_set().is_empty() {
            // clone()'d tasks can have a pid_t* ctid argument that's
            // written with the new task's pid. That pointer is also used
            // as a futex: when the task dies, the ctid value is cleared
            // and a FUTEX_WAKE is done on the address, which is how
            // pthread_join() works.
            log!(
                LogDebug,
                "  waiting for tid futex {} to be cleared ...",
                tid_futex
            );
            self.futex_wait(tid_futex, 0);
        } else if !tid_futex.is_null() {
            // There are no other live tasks in this address space, which
            // means the address space died along with our exit, so the
            // futex is unreadable.
            log!(LogDebug, "  (can't futex_wait last task in vm)");
        }
    }

    // ---------------------------------------------------------------
    // ptrace plumbing
    // ---------------------------------------------------------------

    /// Make `request` with `addr` and `data`, returning the raw ptrace
    /// return value.
    pub fn fallible_ptrace(&self, request: u32, addr: usize, data: *mut c_void) -> i64 {
        unsafe { libc::ptrace(request, self.tid, addr, data) }
    }

    /// Like fallible_ptrace(), but either the request succeeds or this
    /// doesn't return.
    pub fn xptrace(&self, request: u32, addr: usize, data: *mut c_void) {
        unsafe { Errno::clear() };
        let ret = self.fallible_ptrace(request, addr, data);
        ed_assert!(
            self,
            ret == 0,
            "ptrace({}, {}, addr={:#x}, data={:?}) failed",
            ptrace_req_name(request),
            self.tid,
            addr,
            data
        );
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        log!(LogDebug, "task {} dropped", self.tid);
    }
}

/// Block until receiving an fd the other side of `sock` sent us, then
/// return the fd plus the fd number it has on the remote side (which the
/// sender transmits as the message body).
fn recv_fd(sock: RawFd) -> (RawFd, i32) {
    let mut buf = [0u8; 4];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(RawFd);
    let msg = match recvmsg(sock, &iov, Some(&mut cmsgspace), MsgFlags::empty()) {
        Ok(msg) => msg,
        Err(e) => fatal!("Failed to receive fd: {}", e),
    };
    let mut fd = -1;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            debug_assert_eq!(1, fds.len());
            fd = fds[0];
        }
    }
    if fd < 0 {
        fatal!("Failed to receive fd over socket");
    }
    let remote_fdno = i32::from_ne_bytes(buf);
    (fd, remote_fdno)
}

/// Prepare this process (pre-exec, in the fork child) for being recorded
/// or replayed: no address-space randomization, rdtsc trapping so the
/// timestamp counter becomes recordable, and a parent-death signal so
/// tracer death can't leak runaway tracees.
fn set_up_process() {
    unsafe {
        let orig_pers = libc::personality(0xffffffff);
        if 0 > orig_pers {
            fatal!("error getting personality");
        }
        if 0 > libc::personality(
            orig_pers as libc::c_ulong
                | libc::ADDR_NO_RANDOMIZE as libc::c_ulong
                | libc::ADDR_COMPAT_LAYOUT as libc::c_ulong,
        ) {
            fatal!("error disabling randomization");
        }
        if 0 > libc::prctl(libc::PR_SET_TSC, libc::PR_TSC_SIGSEGV, 0, 0, 0) {
            fatal!("error setting up prctl");
        }
        if 0 > libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) {
            fatal!("Couldn't set parent-death signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf_counters::{is_perf_supported, pmu_is_recognized};
    use crate::session::SessionKind;
    use crate::sighandlers::Sighandlers;
    use crate::task_group::TaskGroup;
    use crate::trace_stream::TraceWriter;

    fn make_task() -> Task {
        let tg = TaskGroup::new(1000, 1000);
        let vm = AddressSpace::new("/bin/true");
        let sighandlers = Sighandlers::new();
        Task::new(
            1000,
            None,
            0,
            SessionKind::Recording,
            TraceWriter::new(),
            tg,
            vm,
            sighandlers,
        )
    }

    fn guard() -> bool {
        // Constructing a Task encodes counter attributes, which requires
        // a recognized PMU.
        pmu_is_recognized() && is_perf_supported()
    }

    #[test]
    fn event_stack_pops_assert_type() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        assert_eq!(EventType::EvSentinel, t.ev().event_type());
        t.push_event(Event::Noop);
        t.push_event(Event::SyscallbufFlush);
        t.pop_event(EventType::EvSyscallbufFlush);
        t.pop_noop();
        assert_eq!(EventType::EvSentinel, t.ev().event_type());
    }

    #[test]
    #[should_panic]
    fn event_stack_wrong_pop_panics() {
        if !guard() {
            panic!("skipping (no PMU), still exercising should_panic");
        }
        let mut t = make_task();
        t.push_event(Event::Noop);
        t.pop_desched();
    }

    #[test]
    fn pending_sig_normalizes_syscall_stops() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        t.force_status(WaitStatus::new((((libc::SIGTRAP | 0x80) << 8) | 0x7f) as i32));
        assert_eq!(0, t.pending_sig());
        t.force_status(WaitStatus::for_stop_sig(libc::SIGSEGV));
        assert_eq!(libc::SIGSEGV, t.pending_sig());
        t.force_status(WaitStatus::default());
        assert_eq!(0, t.pending_sig());
    }

    #[test]
    fn blocked_sigs_tracking() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        assert!(!t.is_desched_sig_blocked());
        t.set_blocked_sigs(sig_bit(SYSCALLBUF_DESCHED_SIGNAL));
        assert!(t.is_desched_sig_blocked());
        assert!(!t.is_sig_blocked(libc::SIGUSR1));
    }

    #[test]
    fn clone_flag_translation() {
        let flags = Task::clone_flags_from_kernel(
            (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SETTLS) as usize,
        );
        assert!(flags.contains(CloneFlags::CLONE_SHARE_VM));
        assert!(flags.contains(CloneFlags::CLONE_SHARE_TASK_GROUP));
        assert!(flags.contains(CloneFlags::CLONE_SET_TLS));
        assert!(!flags.contains(CloneFlags::CLONE_SHARE_SIGHANDLERS));
        assert!(!flags.contains(CloneFlags::CLONE_CLEARTID));
    }

    #[test]
    fn stash_invariant_holds() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        assert!(!t.has_stashed_sig());
        // pop_stash restores the wait status saved at stash time.
        t.force_status(WaitStatus::for_stop_sig(TIME_SLICE_SIGNAL));
        t.stashed_wait_status = t.status();
        t.stashed_si = synthesize_poll_in_siginfo(TIME_SLICE_SIGNAL, 7);
        assert!(t.has_stashed_sig());
        t.force_status(WaitStatus::default());
        let si = t.pop_stash_sig();
        assert!(!t.has_stashed_sig());
        assert_eq!(TIME_SLICE_SIGNAL, si.si_signo);
        assert_eq!(WaitStatus::for_stop_sig(TIME_SLICE_SIGNAL), t.status());
    }

    #[test]
    fn syscallbuf_ip_checks() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        t.syscallbuf_lib_start = RemotePtr::from_val(0x70000000);
        t.syscallbuf_lib_end = RemotePtr::from_val(0x70010000);
        t.traced_syscall_ip = RemotePtr::from_val(0x70000100);
        t.untraced_syscall_ip = RemotePtr::from_val(0x70000200);

        let mut r = Registers::new();
        r.set_ip(RemotePtr::from_val(0x70000100));
        t.registers = r;
        t.registers_known = true;
        assert!(t.is_traced_syscall());
        assert!(t.is_in_syscallbuf());
        assert!(!t.is_untraced_syscall());

        r.set_ip(RemotePtr::from_val(0x700000fe));
        t.registers = r;
        assert!(t.is_entering_traced_syscall());

        r.set_ip(RemotePtr::from_val(0x80000000));
        t.registers = r;
        assert!(!t.is_in_syscallbuf());
    }

    #[test]
    fn desched_ioctl_detection() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        t.desched_fd_child = 42;
        let mut r = Registers::new();
        r.set_original_syscallno(libc::SYS_ioctl);
        r.set_arg1(42);
        r.set_arg2(perf_event_open_sys::bindings::ENABLE as usize);
        t.registers = r;
        t.registers_known = true;
        assert!(t.is_desched_event_syscall());
        assert!(t.is_arm_desched_event_syscall());
        assert!(!t.is_disarm_desched_event_syscall());

        r.set_arg2(perf_event_open_sys::bindings::DISABLE as usize);
        t.registers = r;
        assert!(t.is_disarm_desched_event_syscall());

        r.set_arg1(7);
        t.registers = r;
        assert!(!t.is_desched_event_syscall());
    }

    #[test]
    fn record_event_writes_frames_in_order() {
        if !guard() {
            return;
        }
        let mut t = make_task();
        t.record_event(&Event::SyscallbufFlush);
        t.record_event(&Event::SyscallbufFlush);
        let trace = t.trace_writer();
        let trace = trace.borrow();
        assert_eq!(2, trace.frames().len());
        assert_eq!(1, trace.frames()[0].global_time);
        assert_eq!(2, trace.frames()[1].global_time);
        // Non-exec-info events don't touch counters or registers.
        assert!(trace.frames()[0].recorded_regs.is_none());
    }
}
