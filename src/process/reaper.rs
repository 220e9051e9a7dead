//! One task per child: pumps the pipes into the rings, then reaps.

use std::{io, os::unix::process::ExitStatusExt, process::ExitStatus, sync::Arc};

use tokio::{io::AsyncReadExt, net::unix::pipe, process::Child};

use super::ProcessEntry;
use crate::{kernel::Kernel, ring::StreamTag};

const READ_CHUNK: usize = 65536;

async fn read_opt(pipe: &mut Option<pipe::Receiver>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(receiver) => receiver.read(buf).await,
        None => std::future::pending().await,
    }
}

pub(super) async fn run(
    kernel: Arc<Kernel>,
    entry: Arc<ProcessEntry>,
    mut child: Child,
    mut out: Option<pipe::Receiver>,
    mut err: Option<pipe::Receiver>,
) {
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    while out.is_some() || err.is_some() {
        tokio::select! {
            _ = entry.stop.notified() => break,
            read = read_opt(&mut out, &mut out_buf), if out.is_some() => match read {
                Ok(n) if n > 0 => {
                    if let Err(e) = entry.out.push(StreamTag::Out, out_buf[..n].to_vec()) {
                        tracing::warn!("dropping output of {}: {e}", entry.spec.name);
                    }
                }
                _ => out = None,
            },
            read = read_opt(&mut err, &mut err_buf), if err.is_some() => match read {
                Ok(n) if n > 0 => {
                    if let Some(ring) = &entry.err {
                        if let Err(e) = ring.push(StreamTag::Err, err_buf[..n].to_vec()) {
                            tracing::warn!("dropping output of {}: {e}", entry.spec.name);
                        }
                    }
                }
                _ => err = None,
            },
        }
    }
    // An auto-closed child loses its pipes here and may die of EPIPE;
    // either way there is nobody left to read.
    drop(out);
    drop(err);

    let status = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!("wait for {} failed: {e}", entry.spec.name);
            -1
        }
    };
    entry.set_finished();
    if entry.auto_closed() {
        if let Ok(mut state) = kernel.lock() {
            if state.processes.remove(entry.spec.name.as_str()).is_some() {
                tracing::info!("Removed process {entry}");
            }
        }
    } else if let Err(e) = entry.out.push_closed(status) {
        tracing::warn!("dropping exit status of {}: {e}", entry.spec.name);
    }
}

/// The exit code, or the negated signal number for a signalled child.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().or_else(|| status.signal().map(|sig| -sig)).unwrap_or(-1)
}
