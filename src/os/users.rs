//! Credential lookups for process specs: `uid=`/`gid=` options accept
//! either numbers (verified against the user database) or names.

use std::{
    ffi::{CStr, CString},
    io,
    mem::MaybeUninit,
    ptr,
};

use libc::{c_char, c_int, gid_t, uid_t};

use crate::error::{Error, Result};

/// A resolved user. The name is kept around for `initgroups`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct User {
    pub uid: uid_t,
    pub gid: gid_t,
    pub name: CString,
}

fn buffer_size(key: c_int) -> usize {
    match unsafe { libc::sysconf(key) } {
        n if n > 0 => n as usize,
        _ => 1024,
    }
}

/// Drives one of the `get*_r` reentrant lookups, growing the scratch
/// buffer on `ERANGE`. Returns whether the entry was found; the caller
/// reads the filled-in struct afterwards, while `buf` is still alive.
fn lookup_loop(
    buf: &mut Vec<c_char>,
    mut call: impl FnMut(*mut c_char, usize) -> (c_int, bool),
) -> io::Result<bool> {
    loop {
        let (rc, hit) = call(buf.as_mut_ptr(), buf.len());
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        return Ok(hit);
    }
}

/// Reads a `passwd` struct out once a lookup has hit.
///
/// SAFETY: `pwd` must have been filled in by a successful `getpw*_r`
/// whose scratch buffer is still alive.
unsafe fn read_user(pwd: &MaybeUninit<libc::passwd>) -> User {
    let pwd = unsafe { pwd.assume_init_ref() };
    User {
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        name: unsafe { CStr::from_ptr(pwd.pw_name) }.to_owned(),
    }
}

fn getpwnam(name: &CStr) -> io::Result<Option<User>> {
    let mut pwd = MaybeUninit::<libc::passwd>::uninit();
    let mut result: *mut libc::passwd = ptr::null_mut();
    let mut buf = vec![0; buffer_size(libc::_SC_GETPW_R_SIZE_MAX)];
    let hit = lookup_loop(&mut buf, |ptr, len| {
        let rc = unsafe { libc::getpwnam_r(name.as_ptr(), pwd.as_mut_ptr(), ptr, len, &mut result) };
        (rc, !result.is_null())
    })?;
    // SAFETY: `hit` implies the struct was filled in; `buf` is alive
    Ok(hit.then(|| unsafe { read_user(&pwd) }))
}

fn getpwuid(uid: uid_t) -> io::Result<Option<User>> {
    let mut pwd = MaybeUninit::<libc::passwd>::uninit();
    let mut result: *mut libc::passwd = ptr::null_mut();
    let mut buf = vec![0; buffer_size(libc::_SC_GETPW_R_SIZE_MAX)];
    let hit = lookup_loop(&mut buf, |ptr, len| {
        let rc = unsafe { libc::getpwuid_r(uid, pwd.as_mut_ptr(), ptr, len, &mut result) };
        (rc, !result.is_null())
    })?;
    // SAFETY: same as above
    Ok(hit.then(|| unsafe { read_user(&pwd) }))
}

fn getgrnam(name: &CStr) -> io::Result<Option<gid_t>> {
    let mut grp = MaybeUninit::<libc::group>::uninit();
    let mut result: *mut libc::group = ptr::null_mut();
    let mut buf = vec![0; buffer_size(libc::_SC_GETGR_R_SIZE_MAX)];
    let hit = lookup_loop(&mut buf, |ptr, len| {
        let rc = unsafe { libc::getgrnam_r(name.as_ptr(), grp.as_mut_ptr(), ptr, len, &mut result) };
        (rc, !result.is_null())
    })?;
    // SAFETY: same as above
    Ok(hit.then(|| unsafe { grp.assume_init_ref() }.gr_gid))
}

fn getgrgid(gid: gid_t) -> io::Result<Option<gid_t>> {
    let mut grp = MaybeUninit::<libc::group>::uninit();
    let mut result: *mut libc::group = ptr::null_mut();
    let mut buf = vec![0; buffer_size(libc::_SC_GETGR_R_SIZE_MAX)];
    let hit = lookup_loop(&mut buf, |ptr, len| {
        let rc = unsafe { libc::getgrgid_r(gid, grp.as_mut_ptr(), ptr, len, &mut result) };
        (rc, !result.is_null())
    })?;
    // SAFETY: same as above
    Ok(hit.then(|| unsafe { grp.assume_init_ref() }.gr_gid))
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| Error::Validation(format!("'{value}' is not a valid user or group name")))
}

/// Resolves a `uid=` option.
pub(crate) fn resolve_uid(value: &str) -> Result<User> {
    if let Ok(uid) = value.parse::<uid_t>() {
        getpwuid(uid)?.ok_or_else(|| Error::Validation(format!("'{value}' is not a valid user id")))
    } else {
        getpwnam(&cstring(value)?)?
            .ok_or_else(|| Error::Validation(format!("'{value}' is not a valid user name")))
    }
}

/// Resolves a `gid=` option.
pub(crate) fn resolve_gid(value: &str) -> Result<gid_t> {
    let found = if let Ok(gid) = value.parse::<gid_t>() {
        getgrgid(gid)?
    } else {
        getgrnam(&cstring(value)?)?
    };
    found.ok_or_else(|| Error::Validation(format!("No such group: '{value}'")))
}
