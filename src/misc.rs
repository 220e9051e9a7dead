//! Odd-job helpers: errno mapping for raw libc calls and lock-poison
//! normalization.

#![allow(dead_code)]

use std::{io, os::unix::io::RawFd, sync::PoisonError};

pub(crate) static LOCK_POISON: &str = "unexpected lock poison";
pub(crate) fn poison_error<T>(_: PoisonError<T>) -> io::Error {
    io::Error::other(LOCK_POISON)
}

/// Converts a C-style success indication into `io::Result`, fetching the
/// calling thread's errno on failure.
pub(crate) trait OrErrno<T>: Sized {
    fn true_or_errno(self, f: impl FnOnce() -> T) -> io::Result<T>;
    #[inline(always)]
    fn true_val_or_errno(self, value: T) -> io::Result<T> {
        self.true_or_errno(|| value)
    }
}
impl<B: ToBool, T> OrErrno<T> for B {
    #[inline]
    fn true_or_errno(self, f: impl FnOnce() -> T) -> io::Result<T> {
        if self.to_bool() {
            Ok(f())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Same, for calls that return a file descriptor or -1.
pub(crate) trait FdOrErrno: Sized {
    fn fd_or_errno(self) -> io::Result<Self>;
}
impl FdOrErrno for RawFd {
    #[inline]
    fn fd_or_errno(self) -> io::Result<Self> {
        (self != -1).true_val_or_errno(self)
    }
}

pub(crate) trait ToBool {
    fn to_bool(self) -> bool;
}
impl ToBool for bool {
    #[inline(always)]
    fn to_bool(self) -> bool {
        self
    }
}
impl ToBool for i32 {
    #[inline(always)]
    fn to_bool(self) -> bool {
        self != 0
    }
}
