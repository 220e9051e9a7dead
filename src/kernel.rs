//! The kernel's shared state: every registry behind one coarse lock.

use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{misc::poison_error, process::ProcessEntry, socket::SocketEntry};

/// Everything the kernel owns on behalf of its clients.
#[derive(Default)]
pub struct State {
    pub processes: BTreeMap<String, Arc<ProcessEntry>>,
    pub sockets: BTreeMap<String, SocketEntry>,
    /// Unix paths in use, for the path-uniqueness check.
    pub socket_paths: BTreeMap<PathBuf, String>,
    pub values: BTreeMap<String, String>,
    /// Set by `exit-if-idle`; the acceptor polls it between sessions.
    pub exit_if_idle: bool,
}

impl State {
    pub fn is_idle(&self) -> bool {
        self.processes.is_empty()
            && self.sockets.is_empty()
            && self.socket_paths.is_empty()
            && self.values.is_empty()
    }

    /// Drops every registry entry, closing listener fds and unlinking
    /// Unix socket paths on the way out.
    pub fn clear(&mut self) {
        self.sockets.clear();
        self.socket_paths.clear();
        self.processes.clear();
        self.values.clear();
    }
}

#[derive(Default)]
pub struct Kernel {
    state: Mutex<State>,
}

impl Kernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The coarse lock. Held only to mutate or snapshot the registries;
    /// never across I/O, and never together with an output-ring lock.
    pub fn lock(&self) -> io::Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(poison_error)
    }
}
