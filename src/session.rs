//! One client conversation: read a line, dispatch it, write the reply —
//! and the watch mode, where the roles flip and the kernel streams until
//! the client quits or hangs up.

use std::{io, sync::Arc, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    command::{self, Outcome},
    kernel::Kernel,
    process::ProcessEntry,
    ring::StreamTag,
    wire,
};

pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(kernel: Arc<Kernel>, stream: S, peer: String) {
    tracing::info!("Started client session with {peer}");
    if let Err(e) = chat(&kernel, stream).await {
        tracing::debug!("session with {peer} ended: {e}");
    }
    tracing::info!("Closed client session with {peer}");
}

async fn chat<S: AsyncRead + AsyncWrite + Unpin>(
    kernel: &Arc<Kernel>,
    stream: S,
) -> io::Result<()> {
    let mut stream = BufReader::new(stream);
    stream.write_all(wire::GREETING.as_bytes()).await?;

    let mut line = Vec::new();
    loop {
        line.clear();
        if stream.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line);
        let args = wire::tokenize(text.trim());
        if args.is_empty() {
            stream.write_all(wire::PROMPT.as_bytes()).await?;
            continue;
        }
        match command::dispatch(kernel, args) {
            Err(e) => {
                stream.write_all(format!("Error: {e}\n> ").as_bytes()).await?;
            }
            Ok(Outcome::Reply(reply)) => {
                stream.write_all(frame(reply).as_bytes()).await?;
            }
            Ok(Outcome::Close(last_words)) => {
                stream.write_all(last_words.as_bytes()).await?;
                return Ok(());
            }
            Ok(Outcome::Watch { preamble, procs }) => {
                stream.write_all(preamble.as_bytes()).await?;
                let status = watch(kernel, &mut stream, procs).await?;
                stream.write_all(frame(status.to_owned()).as_bytes()).await?;
            }
        }
    }
}

/// Reply framing: a newline unless one is already there, then the prompt.
fn frame(mut reply: String) -> String {
    if reply.is_empty() || !reply.ends_with('\n') {
        reply.push('\n');
    }
    reply.push_str(wire::PROMPT);
    reply
}

struct Watched {
    entry: Arc<ProcessEntry>,
    /// Newest timestamp of the last un-acked snapshot; 0 when none.
    snapshot: f64,
    closed: bool,
}

/// The watch sub-protocol. Drains the rings of the watched processes to
/// the client in batches; every batch ends with the `] ` terminator and
/// waits for a one-line acknowledgment, after which the acked items are
/// dropped from the rings. Finished processes leave the watch set and
/// the registry.
async fn watch<S: AsyncRead + AsyncWrite + Unpin>(
    kernel: &Arc<Kernel>,
    stream: &mut BufReader<S>,
    procs: Vec<Arc<ProcessEntry>>,
) -> io::Result<&'static str> {
    let mut watched: Vec<Watched> = procs
        .into_iter()
        .map(|entry| Watched { entry, snapshot: 0.0, closed: false })
        .collect();
    let mut ack = Vec::new();
    loop {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        for w in &mut watched {
            if let Some((newest, items)) = w.entry.retrieve()? {
                for item in items {
                    match item.tag {
                        StreamTag::Closed => {
                            frames.push(
                                format!(
                                    "closed:{}:{}:{}",
                                    w.entry.spec.name,
                                    item.timestamp,
                                    String::from_utf8_lossy(&item.payload)
                                )
                                .into_bytes(),
                            );
                            w.closed = true;
                        }
                        tag => {
                            frames.push(
                                format!(
                                    "{}:{}:{}:{}",
                                    tag.as_str(),
                                    w.entry.spec.name,
                                    item.timestamp,
                                    item.payload.len()
                                )
                                .into_bytes(),
                            );
                            frames.push(item.payload);
                        }
                    }
                }
                w.snapshot = newest;
            }
        }

        if !frames.is_empty() {
            frames.push(b"] ".to_vec());
            stream.write_all(&frames.join(&b"\n"[..])).await?;

            ack.clear();
            if stream.read_until(b'\n', &mut ack).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let stop = matches!(ack.first(), Some(b'q') | Some(b'Q'));

            let mut finished = Vec::new();
            for w in &mut watched {
                if w.snapshot != 0.0 {
                    w.entry.remove_output(w.snapshot)?;
                    if w.closed {
                        finished.push(w.entry.clone());
                    }
                }
            }
            if !finished.is_empty() {
                let mut state = kernel.lock()?;
                for entry in &finished {
                    if state.processes.remove(entry.spec.name.as_str()).is_some() {
                        tracing::info!("Removed process {entry}");
                    }
                }
            }
            watched.retain(|w| !w.closed);
            if watched.is_empty() {
                return Ok("Nothing left to watch");
            }
            if stop {
                return Ok("Stopped watching");
            }
        } else {
            // Nothing to send; give the client a chance to hang up.
            match tokio::time::timeout(Duration::from_millis(100), stream.fill_buf()).await {
                Ok(Ok([])) => return Ok("Client closed connection"),
                Ok(Ok(_)) => tokio::time::sleep(Duration::from_millis(100)).await,
                Ok(Err(e)) => return Err(e),
                Err(_) => {}
            }
        }
    }
}
