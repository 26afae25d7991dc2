use crate::kernel_abi::SYSCALL_INSN;
use crate::kernel_metadata::syscall_name;
use crate::log::LogLevel::LogDebug;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;
use crate::util::word_size;
use std::ffi::CStr;

/// Inject syscalls into a stopped tracee.
///
/// On construction this saves the tracee's registers and the instruction
/// bytes at $ip, then plants a `syscall` instruction there. Each
/// `syscall()` drives the tracee through the planted instruction's
/// entry and exit stops and returns the result register. Dropping this
/// restores the saved bytes and registers, so from the tracee's point of
/// view nothing happened.
pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut Task,
    initial_regs: Registers,
    initial_ip: RemotePtr<Void>,
    replaced_bytes: [u8; 2],
    /// Set while a DontWait syscall is outstanding; the next wait_syscall()
    /// completes it.
    pending_syscallno: Option<i64>,
}

impl<'a> AutoRemoteSyscalls<'a> {
    pub fn new(t: &'a mut Task) -> AutoRemoteSyscalls<'a> {
        let initial_regs = t.regs();
        let initial_ip = initial_regs.ip();
        let mut replaced_bytes = [0u8; 2];
        t.read_bytes_helper(initial_ip, &mut replaced_bytes);
        t.write_bytes_helper(initial_ip, &SYSCALL_INSN, None);
        AutoRemoteSyscalls {
            t,
            initial_regs,
            initial_ip,
            replaced_bytes,
            pending_syscallno: None,
        }
    }

    pub fn task(&mut self) -> &mut Task {
        self.t
    }

    /// The registers the tracee had before we started fiddling; also what
    /// will be restored on drop. AutoRestoreMem adjusts the saved $sp here
    /// so nested syscalls see the scratch region as allocated.
    pub fn regs(&self) -> &Registers {
        &self.initial_regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.initial_regs
    }

    /// Run `no` with the given arguments to completion and return its
    /// result register.
    pub fn syscall(&mut self, no: i64, args: &[usize]) -> i64 {
        self.start_syscall(no, args);
        self.wait_syscall()
    }

    /// Enter `no` but don't wait for it to complete: the tracee is left
    /// running inside the syscall. Use when completion depends on an
    /// action of ours (accept(2)ing a connect, recvmsg(2)ing a sendmsg)
    /// and waiting first would deadlock.
    pub fn syscall_dont_wait(&mut self, no: i64, args: &[usize]) {
        self.start_syscall(no, args);
        self.t.cont_syscall_nonblocking(0);
        self.pending_syscallno = Some(no);
    }

    /// Block until the tracee's current remote syscall finishes, and
    /// return its result.
    pub fn wait_syscall(&mut self) -> i64 {
        let no = self.pending_syscallno.take();
        let waited = if no.is_some() {
            self.t.wait()
        } else {
            // Entered via start_syscall; run from the entry stop to the
            // exit stop.
            self.t.cont_syscall(0)
        };
        ed_assert!(self.t, waited);
        ed_assert!(
            self.t,
            self.t.status().is_syscall(),
            "Unexpected stop {} during remote syscall",
            self.t.status()
        );
        let result = self.t.regs().syscall_result_signed();
        log!(LogDebug, "  remote syscall returned {}", result);
        result
    }

    fn start_syscall(&mut self, no: i64, args: &[usize]) {
        debug_assert!(self.pending_syscallno.is_none());
        debug_assert!(args.len() <= 6);
        let mut callregs = self.initial_regs;
        callregs.set_ip(self.initial_ip);
        callregs.set_syscallno(no);
        for (i, arg) in args.iter().enumerate() {
            match i {
                0 => callregs.set_arg1(*arg),
                1 => callregs.set_arg2(*arg),
                2 => callregs.set_arg3(*arg),
                3 => callregs.set_arg4(*arg),
                4 => callregs.set_arg5(*arg),
                5 => callregs.set_arg6(*arg),
                _ => unreachable!(),
            }
        }
        self.t.set_regs(&callregs);

        log!(LogDebug, "remote {} in {}", syscall_name(no), self.t.tid);
        // Advance to the syscall-entry trap of the planted instruction.
        let entered = self.t.cont_syscall(0);
        ed_assert!(self.t, entered);
        let entering_syscallno = self.t.regs().original_syscallno();
        ed_assert!(
            self.t,
            entering_syscallno == no,
            "Should be entering {}, but instead at {}",
            syscall_name(no),
            syscall_name(entering_syscallno)
        );
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        debug_assert!(self.pending_syscallno.is_none());
        let initial_ip = self.initial_ip;
        let replaced_bytes = self.replaced_bytes;
        self.t.write_bytes_helper(initial_ip, &replaced_bytes, None);
        let initial_regs = self.initial_regs;
        self.t.set_regs(&initial_regs);
    }
}

/// A temporary byte buffer pushed onto the tracee stack for the duration
/// of some remote syscalls; the overwritten stack bytes are restored on
/// drop.
pub struct AutoRestoreMem<'a, 'b> {
    remote: &'a mut AutoRemoteSyscalls<'b>,
    addr: RemotePtr<Void>,
    saved_data: Vec<u8>,
    saved_sp: RemotePtr<Void>,
}

impl<'a, 'b> AutoRestoreMem<'a, 'b> {
    pub fn new(remote: &'a mut AutoRemoteSyscalls<'b>, data: &[u8]) -> AutoRestoreMem<'a, 'b> {
        let saved_sp = remote.regs().sp();
        // Round up so the new $sp stays word aligned.
        let len = (data.len() + word_size() - 1) & !(word_size() - 1);
        let addr = saved_sp - len;

        let mut saved_data = vec![0u8; len];
        remote.task().read_bytes_helper(addr, &mut saved_data);
        remote.task().write_bytes_helper(addr, data, None);
        remote.regs_mut().set_sp(addr);

        AutoRestoreMem {
            remote,
            addr,
            saved_data,
            saved_sp,
        }
    }

    pub fn push_cstr(remote: &'a mut AutoRemoteSyscalls<'b>, s: &CStr) -> AutoRestoreMem<'a, 'b> {
        Self::new(remote, s.to_bytes_with_nul())
    }

    /// Address of the tracee-side copy of the data.
    pub fn get(&self) -> RemotePtr<Void> {
        self.addr
    }

    pub fn remote(&mut self) -> &mut AutoRemoteSyscalls<'b> {
        self.remote
    }
}

impl<'a, 'b> Drop for AutoRestoreMem<'a, 'b> {
    fn drop(&mut self) {
        let addr = self.addr;
        let saved = std::mem::replace(&mut self.saved_data, Vec::new());
        self.remote.task().write_bytes_helper(addr, &saved, None);
        let saved_sp = self.saved_sp;
        self.remote.regs_mut().set_sp(saved_sp);
    }
}
