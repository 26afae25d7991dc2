use crate::kernel_abi::{KernelSigaction, SIG_DFL, SIG_IGN};
use crate::kernel_metadata::{default_action, SignalAction};
use nix::errno::errno;
use std::cell::RefCell;
use std::rc::Rc;

pub type SighandlersSharedPtr = Rc<RefCell<Sighandlers>>;

const NSIG: usize = 65;

/// The disposition of one signal, plus the metadata the controller needs
/// when emulating delivery.
#[derive(Copy, Clone, Default)]
pub struct Sighandler {
    pub sa: KernelSigaction,
    pub resethand: bool,
}

impl Sighandler {
    pub fn from_action(sa: KernelSigaction) -> Sighandler {
        Sighandler {
            sa,
            resethand: sa.sa_flags & libc::SA_RESETHAND as usize != 0,
        }
    }

    pub fn ignored(&self, sig: i32) -> bool {
        SIG_IGN == self.sa.k_sa_handler
            || (SIG_DFL == self.sa.k_sa_handler && SignalAction::Ignore == default_action(sig))
    }

    pub fn is_default(&self) -> bool {
        SIG_DFL == self.sa.k_sa_handler && !self.resethand
    }

    pub fn is_user_handler(&self) -> bool {
        // Any handler that's a real address, as opposed to the SIG_DFL/
        // SIG_IGN sentinels.
        self.sa.k_sa_handler & !SIG_IGN != 0
    }
}

/// Table of signal dispositions for a set of tasks. Clone siblings share
/// one table through the Rc handle; forks take a byte-copy; exec strips
/// user handlers from a fresh copy.
pub struct Sighandlers {
    handlers: [Sighandler; NSIG],
}

impl Sighandlers {
    pub fn new() -> SighandlersSharedPtr {
        Rc::new(RefCell::new(Sighandlers {
            handlers: [Sighandler::default(); NSIG],
        }))
    }

    /// Copy this process's own dispositions into the table; the first
    /// spawned tracee inherits exactly these.
    pub fn init_from_current_process(&mut self) {
        for sig in 1..NSIG as i32 {
            let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
            if -1 == unsafe { libc::sigaction(sig, std::ptr::null(), &mut act) } {
                // EINVAL means we're querying an unused signal number.
                debug_assert_eq!(libc::EINVAL, errno());
                continue;
            }
            // libc's sigset_t is an opaque 128-byte blob; the kernel only
            // uses the first word.
            let mask =
                unsafe { *(&act.sa_mask as *const libc::sigset_t as *const u64) };
            let ka = KernelSigaction {
                k_sa_handler: act.sa_sigaction,
                sa_flags: act.sa_flags as usize,
                sa_restorer: 0,
                sa_mask: mask,
            };
            self.handlers[sig as usize] = Sighandler::from_action(ka);
        }
    }

    /// Independent deep copy, for fork children and exec.
    pub fn clone_table(&self) -> SighandlersSharedPtr {
        Rc::new(RefCell::new(Sighandlers {
            handlers: self.handlers,
        }))
    }

    pub fn get(&self, sig: i32) -> &Sighandler {
        assert_valid(sig);
        &self.handlers[sig as usize]
    }

    pub fn get_mut(&mut self, sig: i32) -> &mut Sighandler {
        assert_valid(sig);
        &mut self.handlers[sig as usize]
    }

    pub fn set(&mut self, sig: i32, h: Sighandler) {
        assert_valid(sig);
        self.handlers[sig as usize] = h;
    }

    /// For each signal with a user handler, reset the disposition to
    /// SIG_DFL and clear the resethand flag. SIG_IGN signals are not
    /// modified.
    ///
    /// (After an exec() copies the original table, this is the operation
    /// required by POSIX to initialize the copy.)
    pub fn reset_user_handlers(&mut self) {
        for h in self.handlers.iter_mut() {
            if h.is_user_handler() {
                *h = Sighandler::default();
            }
        }
    }
}

fn assert_valid(sig: i32) {
    assert!(0 < sig && (sig as usize) < NSIG, "invalid signal {}", sig);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_handler() -> Sighandler {
        Sighandler::from_action(KernelSigaction {
            k_sa_handler: 0xdeadbeef,
            sa_flags: 0,
            sa_restorer: 0,
            sa_mask: 0,
        })
    }

    #[test]
    fn default_is_default() {
        let h = Sighandler::default();
        assert!(h.is_default());
        assert!(!h.is_user_handler());
        assert!(h.ignored(libc::SIGCHLD));
        assert!(!h.ignored(libc::SIGSEGV));
    }

    #[test]
    fn sig_ign_is_ignored_not_user() {
        let h = Sighandler::from_action(KernelSigaction {
            k_sa_handler: SIG_IGN,
            sa_flags: 0,
            sa_restorer: 0,
            sa_mask: 0,
        });
        assert!(h.ignored(libc::SIGUSR1));
        assert!(!h.is_user_handler());
        assert!(!h.is_default());
    }

    #[test]
    fn reset_user_handlers_leaves_ignore_alone() {
        let table = Sighandlers::new();
        {
            let mut t = table.borrow_mut();
            t.set(libc::SIGUSR1, user_handler());
            t.set(
                libc::SIGUSR2,
                Sighandler::from_action(KernelSigaction {
                    k_sa_handler: SIG_IGN,
                    sa_flags: 0,
                    sa_restorer: 0,
                    sa_mask: 0,
                }),
            );
            t.reset_user_handlers();
        }
        let t = table.borrow();
        assert!(t.get(libc::SIGUSR1).is_default());
        assert!(t.get(libc::SIGUSR2).ignored(libc::SIGUSR2));
    }

    #[test]
    fn resethand_detected_from_flags() {
        let h = Sighandler::from_action(KernelSigaction {
            k_sa_handler: 0x1234,
            sa_flags: libc::SA_RESETHAND as usize,
            sa_restorer: 0,
            sa_mask: 0,
        });
        assert!(h.resethand);
        assert!(!h.is_default());
    }

    #[test]
    fn clone_table_is_independent() {
        let table = Sighandlers::new();
        table.borrow_mut().set(libc::SIGUSR1, user_handler());
        let copy = table.borrow().clone_table();
        copy.borrow_mut().reset_user_handlers();
        assert!(table.borrow().get(libc::SIGUSR1).is_user_handler());
        assert!(copy.borrow().get(libc::SIGUSR1).is_default());
    }

    #[test]
    fn init_from_current_process_mostly_default() {
        let table = Sighandlers::new();
        table.borrow_mut().init_from_current_process();
        // The test harness doesn't install a SIGSTKFLT handler.
        assert!(!table.borrow().get(libc::SIGSTKFLT).is_user_handler());
    }
}
