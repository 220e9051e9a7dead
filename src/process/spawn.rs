//! Child construction: argv preprocessing, pipe plumbing, the pre-exec
//! descriptor and the spawn itself.

use std::{
    ffi::CString,
    io,
    os::unix::{
        io::{AsFd, AsRawFd, OwnedFd},
        process::CommandExt,
    },
    path::Path,
    process::Stdio,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use super::{reaper, ProcessEntry, ProcessSpec, StderrMode};
use crate::{
    error::{Error, Result},
    kernel::{Kernel, State},
    os::c_wrappers::{self, RlimitResource},
    socket,
};

const SOCKET_REF: &str = "$(socket.";

/// Creates the child for `spec`, or returns the existing entry when an
/// equal one is already registered. Runs under the kernel lock so the
/// name reservation and the registration are atomic; on any failure the
/// registry is left exactly as it was.
pub(super) fn spawn(
    kernel: &Arc<Kernel>,
    state: &mut State,
    spec: ProcessSpec,
) -> Result<Arc<ProcessEntry>> {
    if let Some(existing) = state.processes.get(&spec.name) {
        if spec == existing.spec {
            return Ok(existing.clone());
        }
        return Err(Error::Conflict(format!(
            "Process for {} has already been created - {existing}",
            spec.name
        )));
    }

    // Sockets bound for this child alone; closed on our side once the
    // child holds its inherited copies.
    let mut clones: Vec<OwnedFd> = Vec::new();
    let mut fixed = Vec::with_capacity(spec.args.len());
    for arg in &spec.args {
        fixed.push(inject_socket_refs(arg, &spec.name, state, &mut clones)?);
    }
    if fixed.is_empty() {
        return Err(Error::Validation("No command".into()));
    }

    let mut stdout_io = Stdio::null();
    let mut stderr_io = Stdio::null();
    let mut out_pipe = None;
    let mut err_pipe = None;
    if spec.stdout_capture {
        let (read, write) = c_wrappers::pipe().map_err(Error::sys("Could not create a pipe"))?;
        if spec.stderr == StderrMode::Stdout {
            stderr_io =
                Stdio::from(write.try_clone().map_err(Error::sys("Could not create a pipe"))?);
        }
        stdout_io = Stdio::from(write);
        out_pipe = Some(read);
    }
    if spec.stderr == StderrMode::Capture {
        let (read, write) = c_wrappers::pipe().map_err(Error::sys("Could not create a pipe"))?;
        stderr_io = Stdio::from(write);
        err_pipe = Some(read);
    }

    let argv: Vec<String> = if spec.shell {
        vec!["/bin/sh".into(), "-c".into(), fixed.join(" ")]
    } else {
        fixed.clone()
    };

    let mut command = std::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(stdout_io)
        .stderr(stderr_io)
        .env_clear()
        .envs(&spec.env);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    let setup = ChildSetup::from_spec(&spec)?;
    unsafe {
        command.pre_exec(move || setup.apply());
    }

    let child = tokio::process::Command::from(command)
        .spawn()
        .map_err(|e| spawn_error(e, &fixed, &spec))?;
    drop(clones);

    let out_rx = out_pipe
        .map(into_receiver)
        .transpose()
        .map_err(Error::sys("Could not watch the output pipe"))?;
    let err_rx = err_pipe
        .map(into_receiver)
        .transpose()
        .map_err(Error::sys("Could not watch the output pipe"))?;

    let pid = child.id().unwrap_or_default();
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let entry = Arc::new(ProcessEntry::new(spec, pid, started));
    state.processes.insert(entry.spec.name.clone(), entry.clone());
    tracing::info!("Created process {entry}");
    tokio::spawn(reaper::run(kernel.clone(), entry.clone(), child, out_rx, err_rx));
    Ok(entry)
}

/// Replaces every `$(socket.<name>.port)` and `$(socket.<name>.fileno)`
/// occurrence in one argv token. A `.fileno` on a reuseport socket binds
/// a fresh clone and records it in `clones`.
fn inject_socket_refs(
    arg: &str,
    process_name: &str,
    state: &State,
    clones: &mut Vec<OwnedFd>,
) -> Result<String> {
    let mut arg = arg.to_owned();
    while let Some(start) = arg.find(SOCKET_REF) {
        let inner = start + SOCKET_REF.len();
        let Some(close) = arg[inner..].find(')') else {
            return Err(Error::Validation(format!(
                "Process for {process_name} argument starts with \"$(socket.\" but has no closing parenthesis"
            )));
        };
        let end = inner + close;
        let (socket_name, part) = arg[inner..end].rsplit_once('.').unwrap_or(("", ""));
        if !matches!(part, "port" | "fileno") {
            return Err(Error::Validation(
                "You forgot to specify either \".port\" or \".fileno\" after the name".into(),
            ));
        }
        let entry = state
            .sockets
            .get(socket_name)
            .ok_or_else(|| Error::Lookup(format!("Socket {socket_name} not found")))?;
        let replacement = if part == "port" {
            entry.spec.port.to_string()
        } else if entry.spec.reuseport {
            let fd = socket::clone_for_reuseport(&entry.spec)?;
            let raw = fd.as_raw_fd();
            clones.push(fd);
            raw.to_string()
        } else {
            entry
                .fileno()
                .ok_or_else(|| Error::Lookup(format!("Socket {socket_name} not found")))?
                .to_string()
        };
        arg.replace_range(start..=end, &replacement);
    }
    Ok(arg)
}

fn into_receiver(fd: OwnedFd) -> io::Result<tokio::net::unix::pipe::Receiver> {
    c_wrappers::set_nonblocking(fd.as_fd())?;
    tokio::net::unix::pipe::Receiver::from_owned_fd(fd)
}

fn spawn_error(e: io::Error, argv: &[String], spec: &ProcessSpec) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        if let Some(program) = argv.first() {
            if !Path::new(program).exists() {
                return Error::Sys(format!("Bad command - {e}"));
            }
        }
        if let Some(dir) = &spec.working_dir {
            if !dir.is_dir() {
                return Error::Sys(format!("Bad working_dir - {e}"));
            }
        }
    }
    Error::sys("Could not spawn process")(e)
}

/// Everything that must happen in the child between fork and exec,
/// carried as plain values with no references back into the kernel.
struct ChildSetup {
    rlimits: Vec<(RlimitResource, u64)>,
    gid: Option<libc::gid_t>,
    username: Option<CString>,
    uid: Option<libc::uid_t>,
}

impl ChildSetup {
    fn from_spec(spec: &ProcessSpec) -> Result<Self> {
        let mut rlimits = Vec::with_capacity(spec.rlimits.len());
        for (name, value) in &spec.rlimits {
            let resource = c_wrappers::rlimit_resource(name)
                .ok_or_else(|| Error::Validation(format!("Unknown rlimit \"{name}\"")))?;
            rlimits.push((resource, *value));
        }
        Ok(Self {
            rlimits,
            gid: spec.gid,
            username: spec.username.clone(),
            uid: spec.uid,
        })
    }

    /// Runs on the child side of the fork; async-signal-safe calls only.
    fn apply(&self) -> io::Result<()> {
        c_wrappers::setsid()?;
        for &(resource, value) in &self.rlimits {
            c_wrappers::setrlimit(resource, value)?;
        }
        if let Some(gid) = self.gid {
            c_wrappers::setgid(gid)?;
            if let Some(user) = &self.username {
                // initgroups is unavailable to unprivileged children.
                let _ = c_wrappers::initgroups(user, gid);
            }
        }
        if let Some(uid) = self.uid {
            c_wrappers::setuid(uid)?;
        }
        Ok(())
    }
}
