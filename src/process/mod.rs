//! The process supervisor: child specs, live entries and their commands.

mod reaper;
mod spawn;

use std::{
    collections::BTreeMap,
    ffi::CString,
    fmt::{self, Display, Formatter},
    io,
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{Acquire, Release},
        },
        Arc,
    },
};

use tokio::sync::Notify;

use crate::{
    command::Outcome,
    error::{Error, Result},
    kernel::Kernel,
    matcher,
    os::{c_wrappers, users},
    ring::{Item, OutputRing, StreamTag},
    wire,
};

/// What to do with the child's stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StderrMode {
    Capture,
    Discard,
    /// Merge into the stdout pipe at the OS level.
    Stdout,
}

/// Immutable description of a child process, as requested by the client.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub rlimits: BTreeMap<String, u64>,
    pub working_dir: Option<PathBuf>,
    pub shell: bool,
    pub uid: Option<libc::uid_t>,
    pub username: Option<CString>,
    pub gid: Option<libc::gid_t>,
    pub stdout_capture: bool,
    pub stderr: StderrMode,
    pub bufsize: usize,
}

/// Parses a buffer size: plain bytes, or with a `k`/`m`/`g` suffix.
pub(crate) fn parse_size(s: &str) -> Result<usize> {
    if let Ok(n) = s.parse() {
        return Ok(n);
    }
    let mut chars = s.chars();
    let multiplier = match chars.next_back() {
        Some('k') | Some('K') => 1024,
        Some('m') | Some('M') => 1024 * 1024,
        Some('g') | Some('G') => 1024 * 1024 * 1024,
        _ => 0,
    };
    if multiplier != 0 {
        if let Ok(n) = chars.as_str().parse::<usize>() {
            return Ok(n * multiplier);
        }
    }
    Err(Error::Validation(format!("\"{s}\" is not a valid buffer size")))
}

impl ProcessSpec {
    pub(crate) fn from_options(
        name: String,
        opts: BTreeMap<String, String>,
        args: Vec<String>,
    ) -> Result<Self> {
        let mut env = BTreeMap::new();
        let mut rlimits = BTreeMap::new();
        let mut working_dir = None;
        let mut shell = false;
        let mut uid = None;
        let mut username = None;
        let mut primary_gid = None;
        let mut gid_opt = None;
        let mut stdout_capture = true;
        let mut stderr = StderrMode::Capture;
        let mut bufsize = 1024 * 1024;

        for (key, value) in opts {
            if let Some(var) = key.strip_prefix("env.") {
                env.insert(var.to_owned(), value);
            } else if let Some(limit) = key.strip_prefix("rlimit.") {
                if c_wrappers::rlimit_resource(limit).is_none() {
                    return Err(Error::Validation(format!("Unknown rlimit \"{limit}\"")));
                }
                let parsed = value.parse().map_err(|_| {
                    Error::Validation(format!(
                        "The rlimit value for \"{limit}\" must be an integer, not \"{value}\""
                    ))
                })?;
                rlimits.insert(limit.to_owned(), parsed);
            } else {
                match key.as_str() {
                    "uid" => {
                        let user = users::resolve_uid(&value)?;
                        uid = Some(user.uid);
                        primary_gid = Some(user.gid);
                        username = Some(user.name);
                    }
                    "gid" => gid_opt = Some(value),
                    "working_dir" => working_dir = Some(PathBuf::from(value)),
                    "shell" => shell = value != "0",
                    "stdout" => {
                        stdout_capture = match value.as_str() {
                            "1" => true,
                            "0" => false,
                            _ => {
                                return Err(Error::Validation(
                                    "stdout must be 0 or 1".into(),
                                ))
                            }
                        };
                    }
                    "stderr" => {
                        stderr = match value.as_str() {
                            "stdout" => StderrMode::Stdout,
                            "1" => StderrMode::Capture,
                            "0" => StderrMode::Discard,
                            _ => {
                                return Err(Error::Validation(
                                    "stderr must be 0, 1 or stdout".into(),
                                ))
                            }
                        };
                    }
                    "bufsize" => bufsize = parse_size(&value)?,
                    _ => {
                        return Err(Error::Validation(format!(
                            "Unknown process option \"{key}\""
                        )))
                    }
                }
            }
        }

        let gid = match gid_opt {
            Some(value) => Some(users::resolve_gid(&value)?),
            None => uid.and(primary_gid),
        };
        if bufsize == 0 {
            stdout_capture = false;
            stderr = StderrMode::Discard;
        }

        Ok(Self {
            name,
            args,
            env,
            rlimits,
            working_dir,
            shell,
            uid,
            username,
            gid,
            stdout_capture,
            stderr,
            bufsize,
        })
    }
}

/// A spawned spec. Shared between the registry, the reaper task and any
/// watching sessions.
#[derive(Debug)]
pub struct ProcessEntry {
    pub spec: ProcessSpec,
    pub pid: u32,
    pub started: f64,
    running: AtomicBool,
    auto_close: AtomicBool,
    stop: Notify,
    /// Always present: stdout chunks when captured, and the final
    /// `closed` item either way.
    out: OutputRing,
    /// Present only when stderr is captured without merging.
    err: Option<OutputRing>,
}

impl ProcessEntry {
    fn new(spec: ProcessSpec, pid: u32, started: f64) -> Self {
        let err = (spec.stderr == StderrMode::Capture).then(|| OutputRing::new(spec.bufsize));
        Self {
            out: OutputRing::new(spec.bufsize),
            err,
            running: AtomicBool::new(true),
            auto_close: AtomicBool::new(false),
            stop: Notify::new(),
            spec,
            pid,
            started,
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Acquire)
    }

    fn set_finished(&self) {
        self.running.store(false, Release);
    }

    fn auto_closed(&self) -> bool {
        self.auto_close.load(Acquire)
    }

    /// Shuts the output channels and marks the entry for removal once
    /// the child exits.
    pub(crate) fn close_output(&self) -> io::Result<()> {
        self.out.close()?;
        if let Some(err) = &self.err {
            err.close()?;
        }
        self.auto_close.store(true, Release);
        self.stop.notify_one();
        Ok(())
    }

    /// Merged snapshot of both rings, oldest first, `closed` last, plus
    /// the newest timestamp for the eventual
    /// [`remove_output`](Self::remove_output).
    pub(crate) fn retrieve(&self) -> io::Result<Option<(f64, Vec<Item>)>> {
        let mut items = Vec::new();
        let mut newest = 0.0f64;
        if let Some((ts, mut chunk)) = self.out.retrieve()? {
            newest = ts;
            items.append(&mut chunk);
        }
        if let Some(err) = &self.err {
            if let Some((ts, mut chunk)) = err.retrieve()? {
                newest = newest.max(ts);
                items.append(&mut chunk);
            }
        }
        if items.is_empty() {
            return Ok(None);
        }
        items.sort_by(|a, b| {
            let closed = |item: &Item| item.tag == StreamTag::Closed;
            a.timestamp.total_cmp(&b.timestamp).then(closed(a).cmp(&closed(b)))
        });
        Ok(Some((newest, items)))
    }

    pub(crate) fn remove_output(&self, timestamp: f64) -> io::Result<()> {
        self.out.remove(timestamp)?;
        if let Some(err) = &self.err {
            err.remove(timestamp)?;
        }
        Ok(())
    }
}

impl Display for ProcessEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pid={} running={} started={}",
            self.spec.name,
            self.pid,
            self.running(),
            self.started
        )?;
        if let Some(uid) = self.spec.uid {
            write!(f, " uid={uid}")?;
        }
        if let Some(gid) = self.spec.gid {
            write!(f, " gid={gid}")?;
        }
        if self.spec.shell {
            write!(f, " shell=True")?;
        }
        if !self.spec.args.is_empty() {
            write!(f, " args={}", self.spec.args.join(" "))?;
        }
        Ok(())
    }
}

pub(crate) fn cmd_make(kernel: &Arc<Kernel>, mut args: Vec<String>) -> Result<Outcome> {
    if args.is_empty() {
        return Err(Error::Validation("Process requires a name".into()));
    }
    let name = args.remove(0);
    let mut opts = wire::take_options(&mut args);
    let watch = opts.remove("watch").map(|value| value != "0").unwrap_or(false);
    let spec = ProcessSpec::from_options(name, opts, args)?;

    let mut state = kernel.lock()?;
    let entry = spawn::spawn(kernel, &mut state, spec)?;
    drop(state);

    let line = entry.to_string();
    if watch {
        Ok(Outcome::Watch { preamble: format!("{line}\n"), procs: vec![entry] })
    } else {
        Ok(Outcome::reply(line))
    }
}

pub(crate) fn cmd_list(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let state = kernel.lock()?;
    let lines: Vec<String> = matcher::select(&state.processes, &args, false)?
        .into_iter()
        .map(|(_, entry)| entry.to_string())
        .collect();
    Ok(Outcome::reply(lines.join("\n")))
}

pub(crate) fn cmd_remove(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let mut state = kernel.lock()?;
    let matched: Vec<Arc<ProcessEntry>> = matcher::select(&state.processes, &args, true)?
        .into_iter()
        .map(|(_, entry)| entry.clone())
        .collect();
    for entry in matched {
        entry.close_output()?;
        if !entry.running() && state.processes.remove(entry.spec.name.as_str()).is_some() {
            tracing::info!("Removed process {entry}");
        }
    }
    Ok(Outcome::reply(String::new()))
}

pub(crate) fn cmd_watch(kernel: &Arc<Kernel>, args: Vec<String>) -> Result<Outcome> {
    let state = kernel.lock()?;
    let procs: Vec<Arc<ProcessEntry>> = matcher::select(&state.processes, &args, true)?
        .into_iter()
        .map(|(_, entry)| entry.clone())
        .collect();
    drop(state);
    if procs.is_empty() {
        return Err(Error::Lookup("Nothing to watch".into()));
    }
    Ok(Outcome::Watch { preamble: format!("Watching {}\n", procs.len()), procs })
}
