use crate::log::LogLevel::LogDebug;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::util::{ceil_page_size, floor_page_size, page_size};
use libc::pid_t;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub type AddressSpaceSharedPtr = Rc<RefCell<AddressSpace>>;

/// A half-open range of tracee addresses.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct MemoryRange {
    pub start: RemotePtr<Void>,
    pub end: RemotePtr<Void>,
}

impl MemoryRange {
    pub fn new(start: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        MemoryRange {
            start,
            end: start + num_bytes,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: RemotePtr<Void>) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One cached segment of the tracee's /proc/<pid>/maps.
#[derive(Clone, Debug)]
pub struct Mapping {
    pub range: MemoryRange,
    pub prot: i32,
    pub flags: i32,
    pub offset: u64,
    /// What backs this mapping, for logging: a file path, "[stack:tid]",
    /// the syscall buffer, etc.
    pub label: String,
}

/// Distinguishes breakpoints the debugger asked for from the ones the
/// controller plants on its own behalf (e.g. finish_emulated_syscall).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TrapType {
    BkptInternal,
    BkptUser,
}

/// Saved state of one planted software breakpoint.
#[derive(Copy, Clone)]
pub struct Breakpoint {
    pub overwritten_data: u8,
    pub internal_count: u32,
    pub user_count: u32,
}

impl Breakpoint {
    fn new(overwritten_data: u8) -> Breakpoint {
        Breakpoint {
            overwritten_data,
            internal_count: 0,
            user_count: 0,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.internal_count + self.user_count
    }

    pub fn bump(&mut self, which: TrapType) {
        match which {
            TrapType::BkptInternal => self.internal_count += 1,
            TrapType::BkptUser => self.user_count += 1,
        }
    }

    /// Returns true when the breakpoint should be removed from the tracee.
    pub fn unbump(&mut self, which: TrapType) -> bool {
        match which {
            TrapType::BkptInternal => {
                debug_assert!(self.internal_count > 0);
                self.internal_count -= 1;
            }
            TrapType::BkptUser => {
                debug_assert!(self.user_count > 0);
                self.user_count -= 1;
            }
        }
        self.refcount() == 0
    }
}

/// A cache of one address space: the mapping table, the persistent
/// mem fd, planted breakpoints, and the ids of the member tasks. Tasks
/// refer to this through a shared handle; this refers back to tasks only
/// by tid, never by pointer.
pub struct AddressSpace {
    /// The exe path this space was created by exec()ing.
    exe_image: String,
    mem_fd: ScopedFd,
    mappings: BTreeMap<MemoryRange, Mapping>,
    breakpoints: HashMap<RemotePtr<Void>, Breakpoint>,
    task_set: HashSet<pid_t>,
    /// Current brk(2) end, once observed.
    brk_end: RemotePtr<Void>,
}

impl AddressSpace {
    pub fn new(exe_image: &str) -> AddressSpaceSharedPtr {
        log!(LogDebug, "creating address space for {}", exe_image);
        Rc::new(RefCell::new(AddressSpace {
            exe_image: exe_image.to_owned(),
            mem_fd: ScopedFd::new(),
            mappings: BTreeMap::new(),
            breakpoints: HashMap::new(),
            task_set: HashSet::new(),
            brk_end: RemotePtr::null(),
        }))
    }

    /// Fork-style copy: same mappings, no mem fd (the new process gets its
    /// own), no breakpoints carried over.
    pub fn clone_space(&self) -> AddressSpaceSharedPtr {
        Rc::new(RefCell::new(AddressSpace {
            exe_image: self.exe_image.clone(),
            mem_fd: ScopedFd::new(),
            mappings: self.mappings.clone(),
            breakpoints: HashMap::new(),
            task_set: HashSet::new(),
            brk_end: self.brk_end,
        }))
    }

    pub fn exe_image(&self) -> &str {
        &self.exe_image
    }

    pub fn mem_fd_raw(&self) -> RawFd {
        self.mem_fd.as_raw()
    }

    pub fn mem_fd_is_open(&self) -> bool {
        self.mem_fd.is_open()
    }

    pub fn set_mem_fd(&mut self, fd: ScopedFd) {
        self.mem_fd = fd;
    }

    pub fn insert_task(&mut self, tid: pid_t) {
        self.task_set.insert(tid);
    }

    pub fn erase_task(&mut self, tid: pid_t) {
        self.task_set.remove(&tid);
    }

    pub fn task_set(&self) -> &HashSet<pid_t> {
        &self.task_set
    }

    pub fn map(&mut self, addr: RemotePtr<Void>, num_bytes: usize, prot: i32, flags: i32, offset: u64, label: &str) {
        let num_bytes = ceil_page_size(num_bytes);
        if num_bytes == 0 {
            return;
        }
        let range = MemoryRange::new(addr, num_bytes);
        log!(LogDebug, "mapping {:#x}-{:#x} ({})", range.start.as_usize(), range.end.as_usize(), label);
        self.unmap_range(&range);
        self.mappings.insert(
            range,
            Mapping {
                range,
                prot,
                flags,
                offset,
                label: label.to_owned(),
            },
        );
    }

    pub fn unmap(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        let range = MemoryRange::new(addr, ceil_page_size(num_bytes));
        self.unmap_range(&range);
    }

    fn unmap_range(&mut self, range: &MemoryRange) {
        // Split any overlapping mapping at the edges of the hole.
        let overlapping: Vec<MemoryRange> = self
            .mappings
            .keys()
            .filter(|k| k.intersects(range))
            .cloned()
            .collect();
        for key in overlapping {
            let m = self.mappings.remove(&key).unwrap();
            if m.range.start < range.start {
                let left = MemoryRange {
                    start: m.range.start,
                    end: range.start,
                };
                self.mappings.insert(
                    left,
                    Mapping {
                        range: left,
                        ..m.clone()
                    },
                );
            }
            if range.end < m.range.end {
                let right = MemoryRange {
                    start: range.end,
                    end: m.range.end,
                };
                let offset_delta = (range.end - m.range.start) as u64;
                self.mappings.insert(
                    right,
                    Mapping {
                        range: right,
                        offset: m.offset + offset_delta,
                        ..m.clone()
                    },
                );
            }
        }
    }

    pub fn protect(&mut self, addr: RemotePtr<Void>, num_bytes: usize, prot: i32) {
        let range = MemoryRange::new(addr, ceil_page_size(num_bytes));
        let affected: Vec<MemoryRange> = self
            .mappings
            .keys()
            .filter(|k| k.intersects(&range))
            .cloned()
            .collect();
        for key in affected {
            // For simplicity, re-protect whole cached segments; the cache
            // only needs to be as precise as the questions we ask of it.
            if let Some(m) = self.mappings.get_mut(&key) {
                m.prot = prot;
            }
        }
    }

    pub fn remap(
        &mut self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        let (prot, flags, offset, label) = match self.mapping_of(old_addr) {
            Some(m) => (m.prot, m.flags, m.offset, m.label.clone()),
            None => (
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE,
                0,
                "(remapped)".to_owned(),
            ),
        };
        self.unmap(old_addr, old_num_bytes);
        self.map(new_addr, new_num_bytes, prot, flags, offset, &label);
    }

    pub fn brk(&mut self, addr: RemotePtr<Void>) {
        if self.brk_end.is_null() || addr > self.brk_end {
            let start = if self.brk_end.is_null() {
                floor_page_size(addr.as_usize()).into()
            } else {
                self.brk_end
            };
            let num_bytes = ceil_page_size(addr.as_usize()) - start.as_usize();
            if num_bytes > 0 {
                self.map(
                    start,
                    num_bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    0,
                    "[heap]",
                );
            }
        } else if addr < self.brk_end {
            let start = ceil_page_size(addr.as_usize());
            let end = ceil_page_size(self.brk_end.as_usize());
            if start < end {
                self.unmap(start.into(), end - start);
            }
        }
        self.brk_end = addr;
    }

    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<&Mapping> {
        let probe = MemoryRange::new(addr, 1);
        // The candidate is the last mapping starting at or before addr.
        self.mappings
            .range(..=probe)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.range.contains(addr))
            .or_else(|| {
                // A mapping starting within the same page can still contain
                // addr if probe ordering put it after; scan neighbors.
                self.mappings
                    .values()
                    .find(|m| m.range.contains(addr))
            })
    }

    pub fn is_mapped(&self, addr: RemotePtr<Void>) -> bool {
        self.mapping_of(addr).is_some()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    /// Breakpoint bookkeeping; the byte-level plant/restore I/O is done by
    /// the Task that owns the stop, which then updates this table.
    pub fn breakpoint_at(&self, addr: RemotePtr<Void>) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn note_breakpoint_set(&mut self, addr: RemotePtr<Void>, which: TrapType, overwritten_data: u8) {
        let bp = self
            .breakpoints
            .entry(addr)
            .or_insert_with(|| Breakpoint::new(overwritten_data));
        bp.bump(which);
    }

    /// Drop one reference; returns the original byte when the last
    /// reference went away and the tracee text must be restored.
    pub fn note_breakpoint_removed(&mut self, addr: RemotePtr<Void>, which: TrapType) -> Option<u8> {
        let bp = self.breakpoints.get_mut(&addr)?;
        if bp.unbump(which) {
            let data = bp.overwritten_data;
            self.breakpoints.remove(&addr);
            Some(data)
        } else {
            None
        }
    }

    pub fn destroy_all_breakpoints(&mut self) -> Vec<(RemotePtr<Void>, u8)> {
        let out = self
            .breakpoints
            .iter()
            .map(|(addr, bp)| (*addr, bp.overwritten_data))
            .collect();
        self.breakpoints.clear();
        out
    }
}

pub fn page_aligned(addr: RemotePtr<Void>) -> bool {
    addr.as_usize() % page_size() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpaceSharedPtr {
        AddressSpace::new("/bin/true")
    }

    #[test]
    fn map_and_find() {
        let vm = space();
        let mut vm = vm.borrow_mut();
        vm.map(
            RemotePtr::from_val(0x1000),
            0x2000,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            0,
            "r",
        );
        assert!(vm.is_mapped(RemotePtr::from_val(0x1000)));
        assert!(vm.is_mapped(RemotePtr::from_val(0x2fff)));
        assert!(!vm.is_mapped(RemotePtr::from_val(0x3000)));
    }

    #[test]
    fn unmap_hole_splits() {
        let vm = space();
        let mut vm = vm.borrow_mut();
        vm.map(
            RemotePtr::from_val(0x1000),
            0x3000,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            0,
            "r",
        );
        vm.unmap(RemotePtr::from_val(0x2000), 0x1000);
        assert!(vm.is_mapped(RemotePtr::from_val(0x1000)));
        assert!(!vm.is_mapped(RemotePtr::from_val(0x2000)));
        assert!(vm.is_mapped(RemotePtr::from_val(0x3000)));
        // The tail fragment keeps its file-offset displacement.
        let tail = vm.mapping_of(RemotePtr::from_val(0x3000)).unwrap();
        assert_eq!(0x2000, tail.offset as usize);
    }

    #[test]
    fn brk_grows_and_shrinks() {
        let vm = space();
        let mut vm = vm.borrow_mut();
        vm.brk(RemotePtr::from_val(0x100000));
        vm.brk(RemotePtr::from_val(0x103000));
        assert!(vm.is_mapped(RemotePtr::from_val(0x101000)));
        vm.brk(RemotePtr::from_val(0x100000));
        assert!(!vm.is_mapped(RemotePtr::from_val(0x101000)));
    }

    #[test]
    fn breakpoint_refcounts() {
        let vm = space();
        let mut vm = vm.borrow_mut();
        let addr = RemotePtr::from_val(0x4000);
        vm.note_breakpoint_set(addr, TrapType::BkptInternal, 0x90);
        vm.note_breakpoint_set(addr, TrapType::BkptUser, 0x90);
        assert_eq!(None, vm.note_breakpoint_removed(addr, TrapType::BkptUser));
        assert_eq!(
            Some(0x90),
            vm.note_breakpoint_removed(addr, TrapType::BkptInternal)
        );
        assert!(vm.breakpoint_at(addr).is_none());
    }

    #[test]
    fn task_set_is_by_tid() {
        let vm = space();
        let mut vm = vm.borrow_mut();
        vm.insert_task(10);
        vm.insert_task(11);
        vm.erase_task(10);
        assert_eq!(1, vm.task_set().len());
        assert!(vm.task_set().contains(&11));
    }
}
