//! The socket registry: listeners bound once by the kernel and handed to
//! child processes by inherited file descriptor.

mod bind;

pub(crate) use bind::clone_for_reuseport;

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    net::IpAddr,
    os::unix::io::{AsRawFd, OwnedFd, RawFd},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    command::Outcome,
    error::{Error, Result},
    kernel::Kernel,
    matcher, wire,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Unix,
    Inet,
    Inet6,
}

impl Family {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "unix" => Self::Unix,
            "inet" => Self::Inet,
            "inet6" => Self::Inet6,
            _ => return Err(Error::Validation(format!("Unknown socket family \"{s}\""))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Inet => "inet",
            Self::Inet6 => "inet6",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Dgram,
    Raw,
    Rdm,
    Seqpacket,
}

impl SocketType {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "stream" => Self::Stream,
            "dgram" => Self::Dgram,
            "raw" => Self::Raw,
            "rdm" => Self::Rdm,
            "seqpacket" => Self::Seqpacket,
            _ => return Err(Error::Validation(format!("Unknown socket type \"{s}\""))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Dgram => "dgram",
            Self::Raw => "raw",
            Self::Rdm => "rdm",
            Self::Seqpacket => "seqpacket",
        }
    }

    fn raw(self) -> socket2::Type {
        match self {
            Self::Stream => socket2::Type::STREAM,
            Self::Dgram => socket2::Type::DGRAM,
            Self::Raw => socket2::Type::RAW,
            Self::Rdm => socket2::Type::from(libc::SOCK_RDM),
            Self::Seqpacket => socket2::Type::SEQPACKET,
        }
    }

    /// Whether `listen` applies.
    fn connection_oriented(self) -> bool {
        matches!(self, Self::Stream | Self::Seqpacket)
    }
}

/// Immutable description of a listener, as requested by the client.
/// `port` is updated to the bound port once the listener exists, so a
/// kernel-assigned port sticks for later lookups and `$(socket.X.port)`.
#[derive(Clone, Debug)]
pub struct SocketSpec {
    pub name: String,
    pub family: Family,
    pub socket_type: SocketType,
    pub backlog: i32,
    pub path: Option<PathBuf>,
    pub umask: Option<libc::mode_t>,
    pub host: Option<IpAddr>,
    pub port: u16,
    pub interface: Option<String>,
    pub reuseport: bool,
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        _ => Err(Error::Validation(format!("\"{value}\" is not a valid value for {key}"))),
    }
}

impl SocketSpec {
    pub(crate) fn from_options(name: String, opts: &BTreeMap<String, String>) -> Result<Self> {
        let mut family = None;
        let mut socket_type = SocketType::Stream;
        let mut backlog = 5;
        let mut path = None;
        let mut umask = None;
        let mut host_raw = None;
        let mut port = 0u16;
        let mut interface = None;
        let mut reuseport = false;
        for (key, value) in opts {
            match key.as_str() {
                "family" => family = Some(Family::parse(value)?),
                "type" => socket_type = SocketType::parse(value)?,
                "backlog" => {
                    backlog = value.parse().map_err(|_| {
                        Error::Validation(format!("\"{value}\" is not a valid backlog"))
                    })?;
                }
                "path" => path = Some(PathBuf::from(value)),
                "umask" => {
                    umask = Some(libc::mode_t::from_str_radix(value, 8).map_err(|_| {
                        Error::Validation(format!("\"{value}\" is not a valid umask"))
                    })?);
                }
                "host" => host_raw = Some(value.clone()),
                "port" => {
                    port = value.parse().map_err(|_| {
                        Error::Validation(format!("\"{value}\" is not a valid port"))
                    })?;
                }
                "interface" => interface = Some(value.clone()),
                "reuseport" => reuseport = parse_flag(key, value)?,
                _ => return Err(Error::Validation(format!("Unknown socket option \"{key}\""))),
            }
        }

        let family = family.unwrap_or(if path.is_some() { Family::Unix } else { Family::Inet });
        let host = match family {
            Family::Unix => {
                let Some(path) = &path else {
                    return Err(Error::Validation("A Unix socket requires a path".into()));
                };
                if !path.is_absolute() {
                    return Err(Error::Validation("Socket path must be absolute to a file".into()));
                }
                if host_raw.is_some() || port != 0 || interface.is_some() || reuseport {
                    return Err(Error::Validation(
                        "Do not specify a host, port, interface or reuseport for a Unix socket"
                            .into(),
                    ));
                }
                None
            }
            _ => {
                if path.is_some() || umask.is_some() {
                    return Err(Error::Validation(
                        "Do not specify a path or umask for an Internet socket".into(),
                    ));
                }
                Some(match &host_raw {
                    Some(host) => bind::resolve_host(family, host, port)?,
                    None => bind::default_host(family, interface.is_some()),
                })
            }
        };

        Ok(Self { name, family, socket_type, backlog, path, umask, host, port, interface, reuseport })
    }

    /// Idempotency comparison. `reuseport` is advisory, and a port of 0
    /// on either side matches whatever the other side has.
    pub(crate) fn matches(&self, other: &Self) -> bool {
        self.name == other.name
            && self.family == other.family
            && self.socket_type == other.socket_type
            && self.backlog == other.backlog
            && self.path == other.path
            && self.umask == other.umask
            && self.host == other.host
            && (self.port == 0 || other.port == 0 || self.port == other.port)
            && self.interface == other.interface
    }
}

/// A started spec: the spec plus its bound fd. Reuseport specs keep no
/// fd of their own; every child binds a clone instead.
#[derive(Debug)]
pub struct SocketEntry {
    pub spec: SocketSpec,
    fd: Option<OwnedFd>,
    reclaim: PathReclaim,
}

impl SocketEntry {
    pub(crate) fn fileno(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}

impl Display for SocketEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let spec = &self.spec;
        write!(
            f,
            "{} family={} type={} backlog={}",
            spec.name,
            spec.family.as_str(),
            spec.socket_type.as_str(),
            spec.backlog
        )?;
        match spec.family {
            Family::Unix => {
                if let Some(path) = &spec.path {
                    write!(f, " path={}", path.display())?;
                }
                if let Some(umask) = spec.umask {
                    write!(f, " umask={umask:o}")?;
                }
            }
            _ => {
                if let Some(host) = spec.host {
                    write!(f, " host={host}")?;
                }
                write!(f, " port={}", spec.port)?;
                if let Some(interface) = &spec.interface {
                    write!(f, " interface={interface}")?;
                }
                if spec.reuseport {
                    write!(f, " reuseport=1")?;
                }
            }
        }
        if let Some(fileno) = self.fileno() {
            write!(f, " fileno={fileno}")?;
        }
        Ok(())
    }
}

/// Unlinks a bound Unix socket path when the entry goes away.
#[derive(Debug, Default)]
struct PathReclaim(Option<PathBuf>);

impl PathReclaim {
    fn new(path: PathBuf) -> Self {
        Self(Some(path))
    }
}

impl Drop for PathReclaim {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("could not unlink socket path {}: {e}", path.display());
                }
            }
        }
    }
}

pub(crate) fn cmd_make(kernel: &Arc<Kernel>, mut args: Vec<String>) -> Result<Outcome> {
    if args.is_empty() {
        return Err(Error::Validation("Socket requires a name".into()));
    }
    let name = args.remove(0);
    let opts = wire::take_options(&mut args);
    if let Some(extra) = args.first() {
        return Err(Error::Validation(format!("Unexpected argument \"{extra}\"")));
    }
    let spec = SocketSpec::from_options(name, &opts)?;

    let mut state = kernel.lock()?;
    if let Some(existing) = state.sockets.get(&spec.name) {
        if spec.matches(&existing.spec) {
            return Ok(Outcome::reply(existing.to_string()));
        }
        return Err(Error::Conflict(format!(
            "Socket {} has already been created - {existing}",
            spec.name
        )));
    }
    if let Some(path) = &spec.path {
        if state.socket_paths.contains_key(path) {
            return Err(Error::Conflict(format!(
                "Socket path {} has already been created",
                path.display()
            )));
        }
    }

    let entry = bind::create_entry(spec)?;
    tracing::info!("Created socket {entry}");
    let reply = entry.to_string();
    if let Some(path) = &entry.spec.path {
        state.socket_paths.insert(path.clone(), entry.spec.name.clone());
    }
    state.sockets.insert(entry.spec.name.clone(), entry);
    Ok(Outcome::reply(reply))
}

pub(crate) fn cmd_list(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let state = kernel.lock()?;
    let lines: Vec<String> = matcher::select(&state.sockets, &args, false)?
        .into_iter()
        .map(|(_, entry)| entry.to_string())
        .collect();
    Ok(Outcome::reply(lines.join("\n")))
}

pub(crate) fn cmd_remove(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let mut state = kernel.lock()?;
    let names: Vec<String> = matcher::select(&state.sockets, &args, true)?
        .into_iter()
        .map(|(name, _)| name.to_owned())
        .collect();
    for name in names {
        if let Some(entry) = state.sockets.remove(&name) {
            if let Some(path) = &entry.spec.path {
                state.socket_paths.remove(path);
            }
            tracing::info!("Closed socket {entry}");
        }
    }
    Ok(Outcome::reply(String::new()))
}
