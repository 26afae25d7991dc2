use crate::gdb_register::*;
use crate::kernel_abi::BREAKPOINT_INSN_LEN;
use crate::remote_ptr::{RemotePtr, Void};
use libc::user_regs_struct;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result};
use std::mem::size_of;
use std::ptr::addr_of;

/// Where a debugger-visible register lives inside user_regs_struct, and how
/// many bytes of it the wire format carries.
#[derive(Copy, Clone)]
pub struct RegisterValue {
    pub offset: usize,
    pub nbytes: usize,
}

macro_rules! regs_offset {
    ($field:ident) => {{
        let base = std::mem::MaybeUninit::<user_regs_struct>::uninit();
        let base_ptr = base.as_ptr();
        unsafe { addr_of!((*base_ptr).$field) as usize - base_ptr as usize }
    }};
}

fn x64regs() -> HashMap<GdbRegister, RegisterValue> {
    let mut table = HashMap::new();
    let mut rv = |dreg: GdbRegister, offset: usize, nbytes: usize| {
        table.insert(dreg, RegisterValue { offset, nbytes });
    };

    rv(DREG_RAX, regs_offset!(rax), 8);
    rv(DREG_RBX, regs_offset!(rbx), 8);
    rv(DREG_RCX, regs_offset!(rcx), 8);
    rv(DREG_RDX, regs_offset!(rdx), 8);
    rv(DREG_RSI, regs_offset!(rsi), 8);
    rv(DREG_RDI, regs_offset!(rdi), 8);
    rv(DREG_RBP, regs_offset!(rbp), 8);
    rv(DREG_RSP, regs_offset!(rsp), 8);
    rv(DREG_R8, regs_offset!(r8), 8);
    rv(DREG_R9, regs_offset!(r9), 8);
    rv(DREG_R10, regs_offset!(r10), 8);
    rv(DREG_R11, regs_offset!(r11), 8);
    rv(DREG_R12, regs_offset!(r12), 8);
    rv(DREG_R13, regs_offset!(r13), 8);
    rv(DREG_R14, regs_offset!(r14), 8);
    rv(DREG_R15, regs_offset!(r15), 8);
    rv(DREG_RIP, regs_offset!(rip), 8);
    // The segment and flag registers are 4 bytes on the wire even though
    // the kernel stores them in 8-byte slots.
    rv(DREG_EFLAGS, regs_offset!(eflags), 4);
    rv(DREG_CS, regs_offset!(cs), 4);
    rv(DREG_SS, regs_offset!(ss), 4);
    rv(DREG_DS, regs_offset!(ds), 4);
    rv(DREG_ES, regs_offset!(es), 4);
    rv(DREG_FS, regs_offset!(fs), 4);
    rv(DREG_GS, regs_offset!(gs), 4);
    rv(DREG_ORIG_RAX, regs_offset!(orig_rax), 8);
    rv(DREG_FS_BASE, regs_offset!(fs_base), 8);
    rv(DREG_GS_BASE, regs_offset!(gs_base), 8);

    table
}

lazy_static! {
    static ref REGISTERS_X64: HashMap<GdbRegister, RegisterValue> = x64regs();
}

const X64_TF_FLAG: u64 = 1 << 8;

/// The general-purpose register file, cached tracer-side. Instances are
/// snapshots; pushing one back to the kernel goes through
/// Task::set_regs().
#[derive(Copy, Clone)]
pub struct Registers {
    u: user_regs_struct,
}

impl Registers {
    pub fn new() -> Registers {
        Registers {
            u: unsafe { std::mem::zeroed() },
        }
    }

    pub fn from_ptrace(ptrace_regs: user_regs_struct) -> Registers {
        Registers { u: ptrace_regs }
    }

    pub fn ptrace_regs(&self) -> &user_regs_struct {
        &self.u
    }

    pub fn ip(&self) -> RemotePtr<Void> {
        RemotePtr::from_val(self.u.rip as usize)
    }

    pub fn set_ip(&mut self, addr: RemotePtr<Void>) {
        self.u.rip = addr.as_usize() as u64;
    }

    /// Move $ip back over a breakpoint instruction it just executed.
    pub fn undo_breakpoint(&mut self) {
        self.u.rip -= BREAKPOINT_INSN_LEN as u64;
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::from_val(self.u.rsp as usize)
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        self.u.rsp = addr.as_usize() as u64;
    }

    /// The syscall number in a syscall-entry register snapshot.
    pub fn syscallno(&self) -> i64 {
        self.u.rax as i64
    }

    pub fn set_syscallno(&mut self, no: i64) {
        self.u.rax = no as u64;
    }

    /// The syscall number the kernel saved when entering the syscall; valid
    /// at both entry and exit stops.
    pub fn original_syscallno(&self) -> i64 {
        self.u.orig_rax as i64
    }

    pub fn set_original_syscallno(&mut self, no: i64) {
        self.u.orig_rax = no as u64;
    }

    pub fn syscall_result(&self) -> usize {
        self.u.rax as usize
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.u.rax as i64
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        self.u.rax = result as u64;
    }

    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        -4096 < result && result < 0
    }

    pub fn arg1(&self) -> usize {
        self.u.rdi as usize
    }
    pub fn arg1_signed(&self) -> i64 {
        self.u.rdi as i64
    }
    pub fn set_arg1(&mut self, value: usize) {
        self.u.rdi = value as u64;
    }

    pub fn arg2(&self) -> usize {
        self.u.rsi as usize
    }
    pub fn arg2_signed(&self) -> i64 {
        self.u.rsi as i64
    }
    pub fn set_arg2(&mut self, value: usize) {
        self.u.rsi = value as u64;
    }

    pub fn arg3(&self) -> usize {
        self.u.rdx as usize
    }
    pub fn arg3_signed(&self) -> i64 {
        self.u.rdx as i64
    }
    pub fn set_arg3(&mut self, value: usize) {
        self.u.rdx = value as u64;
    }

    pub fn arg4(&self) -> usize {
        self.u.r10 as usize
    }
    pub fn set_arg4(&mut self, value: usize) {
        self.u.r10 = value as u64;
    }

    pub fn arg5(&self) -> usize {
        self.u.r8 as usize
    }
    pub fn set_arg5(&mut self, value: usize) {
        self.u.r8 = value as u64;
    }

    pub fn arg6(&self) -> usize {
        self.u.r9 as usize
    }
    pub fn set_arg6(&mut self, value: usize) {
        self.u.r9 = value as u64;
    }

    /// True when all six argument registers match; used to recognize a
    /// restarted syscall as the one that was interrupted.
    pub fn syscall_args_eq(&self, other: &Registers) -> bool {
        self.arg1() == other.arg1()
            && self.arg2() == other.arg2()
            && self.arg3() == other.arg3()
            && self.arg4() == other.arg4()
            && self.arg5() == other.arg5()
            && self.arg6() == other.arg6()
    }

    pub fn singlestep_flag(&self) -> bool {
        self.u.eflags & X64_TF_FLAG != 0
    }

    /// Attempt to read `regno` into `buf`; returns the number of bytes
    /// written to buf, or None if this view doesn't hold that register.
    pub fn read_register(&self, buf: &mut [u8], regno: GdbRegister) -> Option<usize> {
        let rv = REGISTERS_X64.get(&regno)?;
        debug_assert!(rv.offset + rv.nbytes <= size_of::<user_regs_struct>());
        let bytes = self.as_bytes();
        buf[0..rv.nbytes].copy_from_slice(&bytes[rv.offset..rv.offset + rv.nbytes]);
        Some(rv.nbytes)
    }

    pub fn write_register(&mut self, value: &[u8], regno: GdbRegister) -> bool {
        match REGISTERS_X64.get(&regno) {
            Some(rv) => {
                debug_assert!(value.len() <= rv.nbytes);
                let offset = rv.offset;
                let bytes = self.as_bytes_mut();
                // Clear the slot first so short wire values zero-extend.
                for b in bytes[offset..offset + rv.nbytes].iter_mut() {
                    *b = 0;
                }
                bytes[offset..offset + value.len()].copy_from_slice(value);
                true
            }
            None => false,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                &self.u as *const user_regs_struct as *const u8,
                size_of::<user_regs_struct>(),
            )
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.u as *mut user_regs_struct as *mut u8,
                size_of::<user_regs_struct>(),
            )
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{{ ip:{:#x} sp:{:#x} rax:{:#x} orig_rax:{:#x} }}",
            self.u.rip, self.u.rsp, self.u.rax, self.u.orig_rax
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn read_write_round_trip() {
        let mut r = Registers::new();
        let value: u64 = 0x1122334455667788;
        assert!(r.write_register(&value.to_le_bytes(), DREG_RBX));

        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let nbytes = r.read_register(&mut buf, DREG_RBX).unwrap();
        assert_eq!(8, nbytes);
        assert_eq!(value.to_le_bytes(), buf[0..8]);
    }

    #[test]
    fn named_accessors_view_same_storage() {
        let mut r = Registers::new();
        r.set_arg1(0xdead);
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let nbytes = r.read_register(&mut buf, DREG_RDI).unwrap();
        assert_eq!(8, nbytes);
        assert_eq!(0xdeadu64.to_le_bytes(), buf[0..8]);
    }

    #[test]
    fn segment_registers_are_narrow() {
        let r = Registers::new();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!(Some(4), r.read_register(&mut buf, DREG_CS));
        assert_eq!(Some(8), r.read_register(&mut buf, DREG_ORIG_RAX));
    }

    #[test]
    fn fxsave_registers_not_in_this_view() {
        let r = Registers::new();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!(None, r.read_register(&mut buf, DREG_XMM3));
        assert_eq!(None, r.read_register(&mut buf, DREG_ST0));
    }

    #[test]
    fn undo_breakpoint_moves_ip_back_by_insn_len() {
        let mut r = Registers::new();
        r.set_ip(RemotePtr::from_val(0x1000));
        r.undo_breakpoint();
        assert_eq!(0xfff, r.ip().as_usize());
    }

    #[test]
    fn all_core_registers_have_table_entries() {
        let r = Registers::new();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        for regno in 0..24u32 {
            let dreg = GdbRegister::try_from(regno).unwrap();
            assert!(
                r.read_register(&mut buf, dreg).is_some(),
                "missing table entry for register {}",
                regno
            );
        }
    }
}
