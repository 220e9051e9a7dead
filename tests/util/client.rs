use std::{io, sync::Arc, time::Duration};

use color_eyre::eyre::{bail, ensure, eyre};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    task::JoinHandle,
};

use super::eyre::TestResult;
use crate::{
    kernel::Kernel,
    server::{self, ControlListener, Endpoint},
};

/// A kernel serving on an ephemeral localhost port inside the test
/// runtime.
pub struct TestKernel {
    pub kernel: Arc<Kernel>,
    pub port: u16,
    pub handle: JoinHandle<io::Result<()>>,
}

pub async fn start_kernel() -> TestResult<TestKernel> {
    super::install();
    let kernel = Kernel::new();
    let listener = ControlListener::bind(&Endpoint::Tcp(0)).await?;
    let port = listener.local_port()?;
    let handle = tokio::spawn(server::serve(kernel.clone(), listener, false));
    Ok(TestKernel { kernel, port, handle })
}

/// One item observed through the watch sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchItem {
    Out(String, Vec<u8>),
    Err(String, Vec<u8>),
    Closed(String, i32),
}

/// A protocol client: sends one-line commands, reads prompt-terminated
/// replies and knows how to follow a watch.
pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    pub async fn connect(port: u16) -> TestResult<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let mut client = Self { stream: BufReader::new(stream) };
        let greeting = client.read_reply().await?;
        ensure!(greeting.contains("Papa is home"), "unexpected greeting: {greeting:?}");
        Ok(client)
    }

    pub async fn send_line(&mut self, line: &str) -> TestResult<()> {
        self.stream.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    /// Reads up to the `\n> ` prompt and returns what came before it.
    pub async fn read_reply(&mut self) -> TestResult<String> {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.stream.read(&mut byte).await? == 0 {
                bail!(
                    "connection closed while waiting for a reply; got {:?}",
                    String::from_utf8_lossy(&data)
                );
            }
            data.push(byte[0]);
            if data.ends_with(b"\n> ") {
                data.truncate(data.len() - 3);
                return Ok(String::from_utf8_lossy(&data).into_owned());
            }
        }
    }

    /// One line, without waiting for a prompt (watch preambles and final
    /// words).
    pub async fn read_line(&mut self) -> TestResult<String> {
        let mut line = String::new();
        self.stream.read_line(&mut line).await?;
        Ok(line.trim_end().to_owned())
    }

    /// Reads the bare `> ` written for an empty request line.
    pub async fn read_bare_prompt(&mut self) -> TestResult<()> {
        let mut prompt = [0u8; 2];
        self.stream.read_exact(&mut prompt).await?;
        ensure_eq!(&prompt, b"> ");
        Ok(())
    }

    /// Runs a command that is expected to succeed.
    pub async fn command(&mut self, cmd: &str) -> TestResult<String> {
        self.send_line(cmd).await?;
        let reply = self.read_reply().await?;
        if let Some(msg) = reply.strip_prefix("Error: ") {
            bail!("command {cmd:?} failed: {}", msg.trim_end());
        }
        Ok(reply)
    }

    /// Runs a command that is expected to fail, returning the message.
    pub async fn command_err(&mut self, cmd: &str) -> TestResult<String> {
        self.send_line(cmd).await?;
        let reply = self.read_reply().await?;
        match reply.strip_prefix("Error: ") {
            Some(msg) => Ok(msg.trim_end().to_owned()),
            None => bail!("expected an error from {cmd:?}, got {reply:?}"),
        }
    }

    /// Reads one watch batch up to its `] ` terminator.
    pub async fn read_batch(&mut self) -> TestResult<Vec<WatchItem>> {
        let mut items = Vec::new();
        loop {
            let mut first = [0u8; 2];
            self.stream.read_exact(&mut first).await?;
            if &first == b"] " {
                return Ok(items);
            }
            let mut header = first.to_vec();
            let mut rest = Vec::new();
            self.stream.read_until(b'\n', &mut rest).await?;
            header.extend_from_slice(&rest);
            let header = String::from_utf8(header)?;
            let fields: Vec<&str> = header.trim_end().splitn(4, ':').collect();
            ensure!(fields.len() == 4, "malformed watch header: {header:?}");
            let (tag, name, last) = (fields[0], fields[1], fields[3]);
            match tag {
                "closed" => items.push(WatchItem::Closed(name.to_owned(), last.parse()?)),
                "out" | "err" => {
                    let len: usize = last.parse()?;
                    let mut payload = vec![0u8; len];
                    self.stream.read_exact(&mut payload).await?;
                    let mut sep = [0u8; 1];
                    self.stream.read_exact(&mut sep).await?;
                    ensure_eq!(sep, [b'\n'], "missing separator after a payload");
                    items.push(if tag == "out" {
                        WatchItem::Out(name.to_owned(), payload)
                    } else {
                        WatchItem::Err(name.to_owned(), payload)
                    });
                }
                other => bail!("unknown watch tag {other:?}"),
            }
        }
    }

    pub async fn ack(&mut self) -> TestResult<()> {
        self.send_line("-").await
    }

    pub async fn stop_watch(&mut self) -> TestResult<()> {
        self.send_line("q").await
    }

    /// Collects and acknowledges batches until a `closed` item arrives.
    pub async fn watch_until_closed(&mut self) -> TestResult<Vec<WatchItem>> {
        tokio::time::timeout(Duration::from_secs(30), async {
            let mut all = Vec::new();
            loop {
                let batch = self.read_batch().await?;
                let done = batch.iter().any(|item| matches!(item, WatchItem::Closed(..)));
                all.extend(batch);
                self.ack().await?;
                if done {
                    return Ok(all);
                }
            }
        })
        .await
        .map_err(|_| eyre!("watch timed out"))?
    }
}

/// Polls `list processes` until the given closure likes the output.
pub async fn wait_for_listing(
    client: &mut Client,
    command: &str,
    mut good: impl FnMut(&str) -> bool,
) -> TestResult<String> {
    for _ in 0..100 {
        let listing = client.command(command).await?;
        if good(&listing) {
            return Ok(listing);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("{command:?} never produced the expected listing");
}
