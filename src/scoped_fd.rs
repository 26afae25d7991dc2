use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

/// An fd that is closed when this goes out of scope. -1 means "not open".
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> Self {
        let fd = match open(path, oflag, Mode::empty()) {
            Ok(rawfd) => rawfd,
            Err(_) => -1,
        };
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // The fd may already be gone (e.g. the tracee died); nothing
            // useful to do about close failure.
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Hand the fd to the caller; this no longer owns it.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn extract_disowns() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        assert!(fd.is_open());
        let raw = fd.extract();
        assert!(!fd.is_open());
        nix::unistd::close(raw).unwrap();
    }
}
