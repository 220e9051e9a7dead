use std::{
    ffi::CStr,
    io,
    os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use libc::{c_int, mode_t};

use crate::misc::{FdOrErrno, OrErrno};

/// Clears `FD_CLOEXEC` so the descriptor survives exec in children.
pub(crate) fn set_inheritable(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD, 0) }.fd_or_errno()?;
    unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags & !libc::FD_CLOEXEC) != -1 }
        .true_val_or_errno(())
}

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0) }.fd_or_errno()?;
    unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) != -1 }
        .true_val_or_errno(())
}

/// Anonymous pipe, `(read, write)`. Both ends are cloexec in the parent;
/// the write end reaches a child through the usual stdio dup2 dance,
/// which strips the flag on the way.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != -1 }.true_val_or_errno(())?;
    // SAFETY: we just created both of those file descriptors
    let ends = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok(ends)
}
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
)))]
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [c_int; 2] = [0; 2];
    unsafe { libc::pipe(fds.as_mut_ptr()) != -1 }.true_val_or_errno(())?;
    // SAFETY: same as above
    let ends = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for end in [&ends.0, &ends.1] {
        unsafe { libc::fcntl(end.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) != -1 }
            .true_val_or_errno(())?;
    }
    Ok(ends)
}

/// Applies the given umask and restores the previous one when dropped.
pub(crate) struct UmaskGuard(mode_t);
impl UmaskGuard {
    pub fn set(mask: mode_t) -> Self {
        Self(unsafe { libc::umask(mask) })
    }
}
impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe { libc::umask(self.0) };
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub(crate) type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub(crate) type RlimitResource = c_int;

/// Maps a lowercase limit name to its `RLIMIT_*` resource constant.
pub(crate) fn rlimit_resource(name: &str) -> Option<RlimitResource> {
    Some(match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "stack" => libc::RLIMIT_STACK,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        "nice" => libc::RLIMIT_NICE,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        "rtprio" => libc::RLIMIT_RTPRIO,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        "sigpending" => libc::RLIMIT_SIGPENDING,
        _ => return None,
    })
}

/// Sets the soft and hard limit to the same value.
pub(crate) fn setrlimit(resource: RlimitResource, value: u64) -> io::Result<()> {
    let lim = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    unsafe { libc::setrlimit(resource, &lim) != -1 }.true_val_or_errno(())
}

/// The soft `RLIMIT_NOFILE`, clamped to something worth iterating over.
pub(crate) fn nofile_soft_limit() -> RawFd {
    let mut lim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0 {
        lim.rlim_cur.min(65536) as RawFd
    } else {
        1024
    }
}

pub(crate) fn setsid() -> io::Result<()> {
    (unsafe { libc::setsid() } != -1).true_val_or_errno(())
}

pub(crate) fn setuid(uid: libc::uid_t) -> io::Result<()> {
    (unsafe { libc::setuid(uid) } == 0).true_val_or_errno(())
}

pub(crate) fn setgid(gid: libc::gid_t) -> io::Result<()> {
    (unsafe { libc::setgid(gid) } == 0).true_val_or_errno(())
}

pub(crate) fn initgroups(user: &CStr, gid: libc::gid_t) -> io::Result<()> {
    #[cfg(target_os = "macos")]
    let gid = gid as c_int;
    (unsafe { libc::initgroups(user.as_ptr(), gid) } == 0).true_val_or_errno(())
}

pub(crate) enum Fork {
    Parent(libc::pid_t),
    Child,
}

pub(crate) fn fork() -> io::Result<Fork> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}
