use crate::perf_counters::TIME_SLICE_SIGNAL;
use crate::syscallbuf::SYSCALLBUF_DESCHED_SIGNAL;
use std::mem::size_of;

pub fn page_size() -> usize {
    4096
}

pub fn floor_page_size(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

pub fn ceil_page_size(addr: usize) -> usize {
    (addr + page_size() - 1) & !(page_size() - 1)
}

pub fn word_size() -> usize {
    size_of::<usize>()
}

/// Signals whose delivery during replay carries no information: they are
/// generated by our own machinery, not by the recorded program.
pub fn is_ignored_replay_signal(sig: i32) -> bool {
    matches!(sig, s if s == TIME_SLICE_SIGNAL || s == SYSCALLBUF_DESCHED_SIGNAL || s == libc::SIGCHLD)
}

/// Resolve the path a tracee passed to execve the way the kernel will:
/// relative paths against the tracee's cwd, then symlinks flattened.
pub fn resolve_exe_path(execve_file: &str, real_tgid: libc::pid_t) -> String {
    let absolute = if execve_file.starts_with('/') {
        execve_file.to_owned()
    } else {
        format!("/proc/{}/cwd/{}", real_tgid, execve_file)
    };
    match std::fs::canonicalize(&absolute) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => absolute,
    }
}

/// View a POD value as its bytes.
///
/// # Safety
/// T must be plain old data.
pub unsafe fn value_bytes<T>(v: &T) -> &[u8] {
    std::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>())
}

/// View a POD value as writable bytes.
///
/// # Safety
/// T must be plain old data; every bit pattern must be a valid T.
pub unsafe fn value_bytes_mut<T>(v: &mut T) -> &mut [u8] {
    std::slice::from_raw_parts_mut(v as *mut T as *mut u8, size_of::<T>())
}

/// prname is what /proc/tid/comm reports: basename, truncated to 15
/// bytes.
pub fn prname_from_exe_image(e: &str) -> String {
    let basename = match e.rfind('/') {
        Some(last_slash) => &e[last_slash + 1..],
        None => e,
    };
    basename.chars().take(15).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arithmetic() {
        assert_eq!(0x1000, floor_page_size(0x1fff));
        assert_eq!(0x2000, ceil_page_size(0x1001));
        assert_eq!(0x1000, ceil_page_size(0x1000));
        assert_eq!(0, floor_page_size(0xfff));
    }

    #[test]
    fn prname_truncation() {
        assert_eq!("true", prname_from_exe_image("/bin/true"));
        assert_eq!(
            "aaaaaaaaaaaaaaa",
            prname_from_exe_image("/bin/aaaaaaaaaaaaaaaaaaaa")
        );
        assert_eq!("relative", prname_from_exe_image("relative"));
    }

    #[test]
    fn replay_ignored_signals() {
        assert!(is_ignored_replay_signal(TIME_SLICE_SIGNAL));
        assert!(is_ignored_replay_signal(libc::SIGCHLD));
        assert!(!is_ignored_replay_signal(libc::SIGSEGV));
    }
}
