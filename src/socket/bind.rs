//! Listener construction. Everything here happens under the kernel lock,
//! which keeps name reservation and the actual bind atomic.

use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    os::unix::io::{AsFd, OwnedFd},
    path::Path,
};

use socket2::{Domain, SockAddr, Socket};

use super::{Family, PathReclaim, SocketEntry, SocketSpec};
use crate::{
    error::{Error, Result},
    os::c_wrappers,
};

pub(super) fn default_host(family: Family, any: bool) -> IpAddr {
    match (family, any) {
        (Family::Inet6, false) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        (Family::Inet6, true) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        (_, false) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        (_, true) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}

pub(super) fn resolve_host(family: Family, host: &str, port: u16) -> Result<IpAddr> {
    let wanted = |ip: &IpAddr| match (family, ip) {
        (Family::Inet, IpAddr::V4(_)) | (Family::Inet6, IpAddr::V6(_)) => true,
        _ => false,
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        if wanted(&ip) {
            return Ok(ip);
        }
        return Err(Error::Validation(format!(
            "Host {host} does not match the socket family"
        )));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(Error::sys(format!("Could not resolve host \"{host}\"")))?
        .map(|addr| addr.ip())
        .find(wanted)
        .ok_or_else(|| Error::Lookup(format!("Could not resolve host \"{host}\"")))
}

/// Binds a started listener for the given spec and stores it in the
/// registry shape. For reuseport specs only the kernel-assigned port is
/// kept; the probe listener is thrown away and children bind clones.
pub(crate) fn create_entry(mut spec: SocketSpec) -> Result<SocketEntry> {
    if spec.family == Family::Unix {
        return create_unix_entry(spec);
    }
    if spec.reuseport && !reuseport_supported(&spec) {
        spec.reuseport = false;
    }
    if spec.reuseport {
        let probe = build_listener(&spec, true).map_err(Error::sys("Bind failed"))?;
        if spec.port == 0 {
            spec.port = bound_port(&probe)?;
        }
        Ok(SocketEntry { spec, fd: None, reclaim: PathReclaim::default() })
    } else {
        let socket = build_listener(&spec, false).map_err(Error::sys("Bind failed"))?;
        if spec.port == 0 {
            spec.port = bound_port(&socket)?;
        }
        let fd = OwnedFd::from(socket);
        c_wrappers::set_inheritable(fd.as_fd())?;
        Ok(SocketEntry { spec, fd: Some(fd), reclaim: PathReclaim::default() })
    }
}

fn create_unix_entry(spec: SocketSpec) -> Result<SocketEntry> {
    let Some(path) = spec.path.clone() else {
        return Err(Error::Validation("A Unix socket requires a path".into()));
    };
    unlink_stale(&path)?;
    let socket = Socket::new(Domain::UNIX, spec.socket_type.raw(), None)
        .map_err(Error::sys("Bind failed"))?;
    {
        let _umask = spec.umask.map(c_wrappers::UmaskGuard::set);
        let addr = SockAddr::unix(&path).map_err(Error::sys("Bind failed"))?;
        socket.bind(&addr).map_err(Error::sys("Bind failed"))?;
    }
    if spec.socket_type.connection_oriented() {
        socket.listen(spec.backlog).map_err(Error::sys("Listen failed"))?;
    }
    let fd = OwnedFd::from(socket);
    c_wrappers::set_inheritable(fd.as_fd())?;
    Ok(SocketEntry { spec, fd: Some(fd), reclaim: PathReclaim::new(path) })
}

/// A fresh inheritable listener on the spec's address, bound for exactly
/// one child to inherit.
pub(crate) fn clone_for_reuseport(spec: &SocketSpec) -> Result<OwnedFd> {
    let socket = build_listener(spec, true).map_err(Error::sys("Bind failed"))?;
    let fd = OwnedFd::from(socket);
    c_wrappers::set_inheritable(fd.as_fd())?;
    Ok(fd)
}

fn build_listener(spec: &SocketSpec, reuseport: bool) -> io::Result<Socket> {
    let domain = match spec.family {
        Family::Unix => Domain::UNIX,
        Family::Inet => Domain::IPV4,
        Family::Inet6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, spec.socket_type.raw(), None)?;
    socket.set_reuse_address(true)?;
    if reuseport {
        socket.set_reuse_port(true)?;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(interface) = &spec.interface {
        // Best effort: SO_BINDTODEVICE wants CAP_NET_RAW.
        if let Err(e) = socket.bind_device(Some(interface.as_bytes())) {
            tracing::debug!("could not bind socket {} to device {interface}: {e}", spec.name);
        }
    }
    let host = spec.host.unwrap_or(default_host(spec.family, false));
    socket.bind(&SocketAddr::new(host, spec.port).into())?;
    if spec.socket_type.connection_oriented() {
        socket.listen(spec.backlog)?;
    }
    Ok(socket)
}

/// Probes `SO_REUSEPORT` support without binding anything.
fn reuseport_supported(spec: &SocketSpec) -> bool {
    let domain = match spec.family {
        Family::Unix => Domain::UNIX,
        Family::Inet => Domain::IPV4,
        Family::Inet6 => Domain::IPV6,
    };
    Socket::new(domain, spec.socket_type.raw(), None)
        .and_then(|probe| probe.set_reuse_port(true))
        .is_ok()
}

fn bound_port(socket: &Socket) -> Result<u16> {
    socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .map(|addr| addr.port())
        .ok_or_else(|| Error::Sys("could not read back the bound port".into()))
}

fn unlink_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::sys("Could not remove stale socket path")(e)),
    }
}
