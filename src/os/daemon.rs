//! The classic detach ritual: fork, new session, stray fds closed, stdio
//! on /dev/null.

use std::{ffi::CStr, io};

use super::c_wrappers::{self, Fork};
use crate::misc::{FdOrErrno, OrErrno};

pub enum Daemonize {
    /// The original process; just return from `main`.
    Parent,
    /// The detached child; go serve.
    Child,
}

/// Forks and fully detaches the child from the invoking environment.
/// The child comes back with fds 0 through 2 on /dev/null, everything
/// above closed, a 027 umask and `/` as its working directory.
pub fn daemonize() -> io::Result<Daemonize> {
    match c_wrappers::fork()? {
        Fork::Parent(_) => return Ok(Daemonize::Parent),
        Fork::Child => {}
    }
    c_wrappers::setsid()?;

    for fd in 3..c_wrappers::nofile_soft_limit() {
        unsafe { libc::close(fd) };
    }

    // SAFETY: proof by look at it
    let devnull = unsafe { CStr::from_bytes_with_nul_unchecked(b"/dev/null\0") };
    let null_fd = unsafe { libc::open(devnull.as_ptr(), libc::O_RDWR) }.fd_or_errno()?;
    for fd in 0..3 {
        unsafe { libc::dup2(null_fd, fd) != -1 }.true_val_or_errno(())?;
    }
    if null_fd > 2 {
        unsafe { libc::close(null_fd) };
    }

    unsafe { libc::umask(0o027) };
    // SAFETY: same as above
    let root = unsafe { CStr::from_bytes_with_nul_unchecked(b"/\0") };
    unsafe { libc::chdir(root.as_ptr()) != -1 }.true_val_or_errno(())?;
    Ok(Daemonize::Child)
}
