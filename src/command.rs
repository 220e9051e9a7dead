//! The two-level command tree and its prefix-abbreviation dispatch.

use std::sync::Arc;

use crate::{
    error::{Error, Result},
    kernel::Kernel,
    process::{self, ProcessEntry},
    socket, values,
};

pub type Handler = fn(&Arc<Kernel>, Vec<String>) -> Result<Outcome>;

/// What the session loop should do with a finished command.
pub enum Outcome {
    /// Write the reply, framed with a prompt, and keep reading.
    Reply(String),
    /// Write the final bytes verbatim and close the session.
    Close(&'static str),
    /// Write the preamble, then stream output until the watch ends.
    Watch {
        preamble: String,
        procs: Vec<Arc<ProcessEntry>>,
    },
}

impl Outcome {
    pub(crate) fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }
}

/// A node of the command tree: a branch with a further word to come, or
/// a leaf with the handler to run.
#[derive(Debug)]
pub(crate) enum Node {
    Branch {
        help: &'static str,
        children: &'static [(&'static str, Node)],
    },
    Leaf {
        help: &'static str,
        handler: Handler,
    },
}

impl Node {
    fn help(&self) -> &'static str {
        match self {
            Self::Branch { help, .. } | Self::Leaf { help, .. } => help,
        }
    }
}

static TREE: &[(&str, Node)] = &[
    ("exit-if-idle", Node::Leaf { help: EXIT_IF_IDLE_HELP, handler: cmd_exit_if_idle }),
    ("get", Node::Leaf { help: GET_HELP, handler: values::cmd_get }),
    ("help", Node::Leaf { help: HELP_HELP, handler: cmd_help }),
    (
        "list",
        Node::Branch {
            help: LIST_HELP,
            children: &[
                ("processes", Node::Leaf { help: LIST_PROCESSES_HELP, handler: process::cmd_list }),
                ("sockets", Node::Leaf { help: LIST_SOCKETS_HELP, handler: socket::cmd_list }),
                ("values", Node::Leaf { help: LIST_VALUES_HELP, handler: values::cmd_list }),
            ],
        },
    ),
    (
        "make",
        Node::Branch {
            help: MAKE_HELP,
            children: &[
                ("process", Node::Leaf { help: MAKE_PROCESS_HELP, handler: process::cmd_make }),
                ("socket", Node::Leaf { help: MAKE_SOCKET_HELP, handler: socket::cmd_make }),
            ],
        },
    ),
    ("quit", Node::Leaf { help: QUIT_HELP, handler: cmd_quit }),
    (
        "remove",
        Node::Branch {
            help: REMOVE_HELP,
            children: &[
                ("processes", Node::Leaf { help: REMOVE_PROCESSES_HELP, handler: process::cmd_remove }),
                ("sockets", Node::Leaf { help: REMOVE_SOCKETS_HELP, handler: socket::cmd_remove }),
                ("values", Node::Leaf { help: REMOVE_VALUES_HELP, handler: values::cmd_remove }),
            ],
        },
    ),
    ("set", Node::Leaf { help: SET_HELP, handler: values::cmd_set }),
    (
        "watch",
        Node::Branch {
            help: WATCH_HELP,
            children: &[
                ("processes", Node::Leaf { help: WATCH_PROCESSES_HELP, handler: process::cmd_watch }),
            ],
        },
    ),
];

fn names(nodes: &[(&'static str, Node)]) -> String {
    nodes.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ")
}

/// Resolves one command word against a set of siblings: an exact match
/// first, otherwise a prefix that matches exactly one entry.
/// `exit-if-idle` is destructive enough to demand full spelling.
pub(crate) fn find<'n>(
    word: &str,
    nodes: &'n [(&'static str, Node)],
    primary: Option<&str>,
) -> Result<(&'static str, &'n Node)> {
    let word = word.to_ascii_lowercase();
    if let Some(entry) = nodes.iter().find(|(name, _)| *name == word) {
        return Ok((entry.0, &entry.1));
    }
    let matches: Vec<&(&'static str, Node)> =
        nodes.iter().filter(|(name, _)| name.starts_with(&word)).collect();
    match matches.as_slice() {
        [] => Err(match primary {
            Some(primary) => Error::Protocol(format!(
                "Bad \"{primary}\" command. The following word must be one of: {}",
                names(nodes)
            )),
            None => Error::Protocol(format!("Unknown command \"{word}\"")),
        }),
        [entry] => {
            if entry.0 == "exit-if-idle" {
                return Err(Error::Protocol("You cannot abbreviate \"exit-if-idle\"".into()));
            }
            Ok((entry.0, &entry.1))
        }
        several => {
            let choices =
                several.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ");
            Err(Error::Protocol(format!(
                "\"{word}\" is ambiguous. It could be any of: {choices}"
            )))
        }
    }
}

/// Walks the tree, consuming command words from the front of `args`.
/// With `allow_partial`, a branch with no further words is returned as
/// is (the help command wants that); otherwise it is an error naming the
/// valid continuations.
fn lookup(args: &mut Vec<String>, allow_partial: bool) -> Result<&'static Node> {
    let mut nodes = TREE;
    let mut primary: Option<String> = None;
    loop {
        if args.is_empty() {
            return Err(Error::Protocol("No command".into()));
        }
        let word = args.remove(0);
        let (name, node) = find(&word, nodes, primary.as_deref())?;
        match node {
            Node::Leaf { .. } => return Ok(node),
            Node::Branch { children, .. } => {
                if args.is_empty() {
                    if allow_partial {
                        return Ok(node);
                    }
                    return Err(Error::Protocol(format!(
                        "\"{name}\" must be followed by one of: {}",
                        names(children)
                    )));
                }
                primary = Some(match &primary {
                    Some(prefix) => format!("{prefix} {name}"),
                    None => name.to_owned(),
                });
                nodes = children;
            }
        }
    }
}

/// Resolves and runs one tokenized request.
pub fn dispatch(kernel: &Arc<Kernel>, mut args: Vec<String>) -> Result<Outcome> {
    let node = lookup(&mut args, false)?;
    match node {
        Node::Leaf { handler, .. } => handler(kernel, args),
        // lookup(allow_partial = false) never hands back a branch
        Node::Branch { .. } => Err(Error::Protocol("No command".into())),
    }
}

fn cmd_quit(_kernel: &Arc<Kernel>, _args: Vec<String>) -> Result<Outcome> {
    Ok(Outcome::Close("ok\n"))
}

fn cmd_exit_if_idle(kernel: &Arc<Kernel>, _args: Vec<String>) -> Result<Outcome> {
    let mut state = kernel.lock()?;
    if !state.is_idle() {
        return Ok(Outcome::reply("not idle"));
    }
    state.exit_if_idle = true;
    Ok(Outcome::Close("Exiting papa!\n> "))
}

fn cmd_help(_kernel: &Arc<Kernel>, mut args: Vec<String>) -> Result<Outcome> {
    if args.is_empty() {
        return Ok(Outcome::reply(TOP_HELP.trim_matches('\n')));
    }
    Ok(Outcome::reply(match lookup(&mut args, true) {
        Ok(node) => node.help().trim_matches('\n').to_owned(),
        Err(e) => e.to_string(),
    }))
}

static TOP_HELP: &str = r#"
Possible commands are:
    make socket - Create a socket to be used by processes
    remove sockets - Close and remove sockets by name
    list sockets - List sockets by name
    -----------------------------------------------------
    make process - Launch a process
    remove processes - Stop recording the output of processes by name
    list processes - List processes by name
    watch processes - Start receiving the output of processes by name
    -----------------------------------------------------
    set - Set a named value
    get - Get a named value
    list values - List values by name
    remove values - Remove values by name
    -----------------------------------------------------
    quit - Close the client session
    exit-if-idle - Exit papa if there are no processes, sockets or values
    help - Type "help <cmd>" for more information

NOTE: All of these commands may be abbreviated to any unique prefix.
      "exit-if-idle" must be spelled out in full.

After a "watch" command, send any line to receive more output, or a line
starting with "q" to stop watching.
"#;

static LIST_HELP: &str = r#"
List sockets, processes or values by name or trailing-* wildcard.

Examples:
    list sockets uwsgi.*
    list processes
    list values aack

All commands can be abbreviated, so the above can also be:
    l s uwsgi.*
    lis proc
    l v aack
"#;

static MAKE_HELP: &str = r#"
Make a new socket or process.

Do "help make process" or "help make socket" for details.
"#;

static REMOVE_HELP: &str = r#"
Remove sockets, process output channels or values by name or trailing-*
wildcard.

Examples:
    remove sockets uwsgi
    remove processes nginx.*
    remove values aack

All commands can be abbreviated, so the above can also be:
    r s uwsgi
    rem proc nginx.*
    r v aack
"#;

static WATCH_HELP: &str = r#"
Watch processes.

Examples:
    watch processes nginx.*
    w proc uwsgi
"#;

static MAKE_SOCKET_HELP: &str = r#"
Create a socket to be used by processes.
You need to specify a name, followed by name=value options. The name must
not contain spaces.

Socket options are:
    family - "inet" (default), "inet6" or "unix"
    type - "stream" (default), "dgram", "raw", "rdm" or "seqpacket"
    backlog - listen backlog (default is 5)
    path - absolute path of a unix socket
    umask - octal umask applied while binding a unix socket
    host - address to bind (default is the loopback address)
    port - port to bind (default is 0, meaning kernel-assigned)
    interface - bind to a specific network interface
    reuseport - let every process bind its own copy with SO_REUSEPORT

Examples:
    make socket uwsgi port=8080
    make socket chaussette path=/tmp/chaussette.sock
"#;

static MAKE_PROCESS_HELP: &str = r#"
Launch a process.
You need to specify a name, followed by name=value options, followed by
the command and args to execute. The name must not contain spaces.

Process options are:
    uid - the user name or user ID to run the process as
    gid - the group name or group ID to run the process as
    working_dir - the directory to run the process in
    shell - run the command through /bin/sh -c
    stdout - 0 to discard standard output (default is 1)
    stderr - 0 to discard, 1 to capture, "stdout" to merge (default is 1)
    bufsize - size of each output buffer, such as 1m (default); 0 turns
              capture off
    watch - start watching the process output right away

You can also specify environment variables by prefixing the name with
"env." and rlimits by prefixing the name with "rlimit."

Every occurrence of $(socket.NAME.port) or $(socket.NAME.fileno) in the
command is replaced from the socket registry before the process starts.

Examples:
    make process sf uid=1001 gid=2000 working_dir=/sf/bin/ /sf/bin/uwsgi --ini uwsgi-live.ini --socket fd://$(socket.uwsgi.fileno)
    make process nginx /usr/local/nginx/sbin/nginx
"#;

static LIST_SOCKETS_HELP: &str = r#"
List sockets by name or trailing-* wildcard.

Examples:
    list sockets uwsgi.*
    l s
"#;

static LIST_PROCESSES_HELP: &str = r#"
List processes by name or trailing-* wildcard.

Examples:
    list processes nginx.*
    l p
"#;

static LIST_VALUES_HELP: &str = r#"
List values by name or trailing-* wildcard.

Examples:
    list values circus.*
    l v
"#;

static REMOVE_SOCKETS_HELP: &str = r#"
Close and remove sockets by name or trailing-* wildcard. The file of a
unix socket is unlinked.

Examples:
    remove sockets uwsgi
    r s uwsgi.*
"#;

static REMOVE_PROCESSES_HELP: &str = r#"
Close the output channels of processes and remove each process from the
list as soon as it has finished.

Examples:
    remove processes uwsgi
    r p nginx.*
"#;

static REMOVE_VALUES_HELP: &str = r#"
Remove values by name or trailing-* wildcard. You cannot remove all
variables with a bare "*".

Examples:
    remove values aack
    r v circus.*
"#;

static WATCH_PROCESSES_HELP: &str = r#"
Start receiving the output of processes by name or trailing-* wildcard.
Each batch ends with a "] " line; reply with any line to continue, or a
line starting with "q" to stop watching.

Examples:
    watch processes nginx.*
    w p uwsgi
"#;

static SET_HELP: &str = r#"
Set or clear a named value. Pass no value to clear.

Examples:
    set count 5
    set count
"#;

static GET_HELP: &str = r#"
Get a named value.

Example:
    get count
"#;

static QUIT_HELP: &str = "Close the client session";

static EXIT_IF_IDLE_HELP: &str =
    "Exit papa if there are no processes, sockets or values";

static HELP_HELP: &str = "Show help info. Type \"help <cmd>\" for details on a command";
