//! Human-readable names for the kernel constants that show up in logs and
//! assertion messages.

pub fn signal_name(sig: i32) -> String {
    // strsignal() would be nice to use here, but it provides TMI.
    if 32 <= sig && sig <= 64 {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: u32) -> String {
    match event as i32 {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        // Common because assertions pass ptrace_event_name(0) around.
        0 => "PTRACE_EVENT(0)".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn ptrace_req_name(request: u32) -> String {
    use crate::kernel_abi::{PTRACE_SYSEMU, PTRACE_SYSEMU_SINGLESTEP};
    match request {
        libc::PTRACE_TRACEME => "PTRACE_TRACEME".into(),
        libc::PTRACE_PEEKTEXT => "PTRACE_PEEKTEXT".into(),
        libc::PTRACE_PEEKDATA => "PTRACE_PEEKDATA".into(),
        libc::PTRACE_PEEKUSER => "PTRACE_PEEKUSER".into(),
        libc::PTRACE_POKETEXT => "PTRACE_POKETEXT".into(),
        libc::PTRACE_POKEDATA => "PTRACE_POKEDATA".into(),
        libc::PTRACE_POKEUSER => "PTRACE_POKEUSER".into(),
        libc::PTRACE_CONT => "PTRACE_CONT".into(),
        libc::PTRACE_KILL => "PTRACE_KILL".into(),
        libc::PTRACE_SINGLESTEP => "PTRACE_SINGLESTEP".into(),
        libc::PTRACE_GETREGS => "PTRACE_GETREGS".into(),
        libc::PTRACE_SETREGS => "PTRACE_SETREGS".into(),
        libc::PTRACE_ATTACH => "PTRACE_ATTACH".into(),
        libc::PTRACE_DETACH => "PTRACE_DETACH".into(),
        libc::PTRACE_SYSCALL => "PTRACE_SYSCALL".into(),
        libc::PTRACE_SETOPTIONS => "PTRACE_SETOPTIONS".into(),
        libc::PTRACE_GETEVENTMSG => "PTRACE_GETEVENTMSG".into(),
        libc::PTRACE_GETSIGINFO => "PTRACE_GETSIGINFO".into(),
        libc::PTRACE_SETSIGINFO => "PTRACE_SETSIGINFO".into(),
        libc::PTRACE_GETREGSET => "PTRACE_GETREGSET".into(),
        libc::PTRACE_SETREGSET => "PTRACE_SETREGSET".into(),
        libc::PTRACE_SEIZE => "PTRACE_SEIZE".into(),
        libc::PTRACE_INTERRUPT => "PTRACE_INTERRUPT".into(),
        PTRACE_SYSEMU => "PTRACE_SYSEMU".into(),
        PTRACE_SYSEMU_SINGLESTEP => "PTRACE_SYSEMU_SINGLESTEP".into(),
        _ => format!("PTRACE_REQUEST({})", request),
    }
}

/// Names for the syscalls the core itself inspects; everything else is
/// rendered numerically.
pub fn syscall_name(syscall: i64) -> String {
    match syscall {
        libc::SYS_brk => "brk".into(),
        libc::SYS_mmap => "mmap".into(),
        libc::SYS_mprotect => "mprotect".into(),
        libc::SYS_mremap => "mremap".into(),
        libc::SYS_munmap => "munmap".into(),
        libc::SYS_ioctl => "ioctl".into(),
        libc::SYS_execve => "execve".into(),
        libc::SYS_exit => "exit".into(),
        libc::SYS_exit_group => "exit_group".into(),
        libc::SYS_clone => "clone".into(),
        libc::SYS_fork => "fork".into(),
        libc::SYS_vfork => "vfork".into(),
        libc::SYS_rt_sigaction => "rt_sigaction".into(),
        libc::SYS_rt_sigprocmask => "rt_sigprocmask".into(),
        libc::SYS_rt_sigreturn => "rt_sigreturn".into(),
        libc::SYS_restart_syscall => "restart_syscall".into(),
        libc::SYS_socket => "socket".into(),
        libc::SYS_connect => "connect".into(),
        libc::SYS_sendmsg => "sendmsg".into(),
        libc::SYS_open => "open".into(),
        libc::SYS_openat => "openat".into(),
        libc::SYS_close => "close".into(),
        libc::SYS_prctl => "prctl".into(),
        libc::SYS_set_tid_address => "set_tid_address".into(),
        libc::SYS_set_robust_list => "set_robust_list".into(),
        libc::SYS_set_thread_area => "set_thread_area".into(),
        libc::SYS_tgkill => "tgkill".into(),
        _ => format!("syscall({})", syscall),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::ENXIO => "ENXIO".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::ENOSYS => "ENOSYS".into(),
        libc::EADDRINUSE => "EADDRINUSE".into(),
        libc::ECHILD => "ECHILD".into(),
        _ => format!("errno({})", err),
    }
}

/// What the kernel does with a signal when the disposition is SIG_DFL.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SignalAction {
    DumpCore,
    Terminate,
    Continue,
    Stop,
    Ignore,
}

pub fn default_action(sig: i32) -> SignalAction {
    use SignalAction::*;
    if 32 <= sig && sig <= 64 {
        return Terminate;
    }
    match sig {
        libc::SIGHUP => Terminate,
        libc::SIGINT => Terminate,
        libc::SIGQUIT => DumpCore,
        libc::SIGILL => DumpCore,
        libc::SIGABRT => DumpCore,
        libc::SIGFPE => DumpCore,
        libc::SIGKILL => Terminate,
        libc::SIGSEGV => DumpCore,
        libc::SIGPIPE => Terminate,
        libc::SIGALRM => Terminate,
        libc::SIGTERM => Terminate,
        libc::SIGUSR1 => Terminate,
        libc::SIGUSR2 => Terminate,
        libc::SIGCHLD => Ignore,
        libc::SIGCONT => Continue,
        libc::SIGSTOP => Stop,
        libc::SIGTSTP => Stop,
        libc::SIGTTIN => Stop,
        libc::SIGTTOU => Stop,
        libc::SIGBUS => DumpCore,
        libc::SIGPROF => Terminate,
        libc::SIGSYS => DumpCore,
        libc::SIGTRAP => DumpCore,
        libc::SIGURG => Ignore,
        libc::SIGVTALRM => Terminate,
        libc::SIGXCPU => DumpCore,
        libc::SIGXFSZ => DumpCore,
        libc::SIGIO => Terminate,
        libc::SIGSTKFLT => Terminate,
        libc::SIGWINCH => Ignore,
        libc::SIGPWR => Terminate,
        _ => Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!("SIGSEGV", signal_name(libc::SIGSEGV));
        assert_eq!("SIGRT40", signal_name(40));
        assert_eq!("signal(0)", signal_name(0));
    }

    #[test]
    fn default_actions() {
        assert_eq!(SignalAction::Ignore, default_action(libc::SIGCHLD));
        assert_eq!(SignalAction::Ignore, default_action(libc::SIGWINCH));
        assert_eq!(SignalAction::DumpCore, default_action(libc::SIGSEGV));
        assert_eq!(SignalAction::Stop, default_action(libc::SIGSTOP));
        assert_eq!(SignalAction::Terminate, default_action(34));
    }
}
