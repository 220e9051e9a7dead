//! CLI entry point for the papa daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use papa::{
    kernel::Kernel,
    os::daemon::{daemonize, Daemonize},
    server::{self, ControlListener, Endpoint},
};

/// A simple parent process for sockets and other processes.
#[derive(Debug, Parser)]
#[command(name = "papa", version)]
struct Args {
    /// Run in debug mode (informational logging)
    #[arg(short = 'd', long)]
    debug: bool,
    /// Path of a Unix socket to bind instead of TCP
    #[arg(short = 'u', long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,
    /// Port to bind on localhost
    #[arg(short = 'p', long, default_value_t = 20202)]
    port: u16,
    /// Fork and detach before serving
    #[arg(long)]
    daemonize: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);
    let endpoint = match &args.unix_socket {
        Some(path) => Endpoint::Unix(path.clone()),
        None => Endpoint::Tcp(args.port),
    };
    if args.daemonize {
        // Fork first: the runtime must be built on the serving side.
        match daemonize().context("unable to fork")? {
            Daemonize::Parent => return Ok(()),
            Daemonize::Child => {}
        }
    }
    run(endpoint)
}

fn init_logging(debug: bool) {
    let default = if debug { "info" } else { "error" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(endpoint: Endpoint) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("could not start the runtime")?;
    runtime.block_on(async {
        let listener = match ControlListener::bind(&endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Bind failed: {e}");
                anyhow::bail!("Bind failed: {e}");
            }
        };
        server::serve(Kernel::new(), listener, false).await.context("server failed")
    })
}
