//! Session-level behavior of the dispatcher: framing, abbreviation,
//! help, quit and exit-if-idle.

use std::time::Duration;

use color_eyre::eyre::ensure;

use crate::{
    command::{find, Node, Outcome},
    error::Error,
    kernel::Kernel,
    server::{self, ControlListener, Endpoint},
};

use super::util::*;

#[tokio::test]
async fn empty_request_gets_a_bare_prompt() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    c.send_line("").await?;
    c.read_bare_prompt().await?;
    // The session is still good for real commands afterwards.
    ensure_eq!(c.command("list values").await?, "");
    Ok(())
}

#[tokio::test]
async fn unknown_and_incomplete_commands() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    ensure_eq!(c.command_err("frobnicate").await?, "Unknown command \"frobnicate\"");
    ensure_eq!(
        c.command_err("list").await?,
        "\"list\" must be followed by one of: processes, sockets, values"
    );
    let bad = c.command_err("list whatever").await?;
    ensure!(bad.starts_with("Bad \"list\" command."), "got {bad:?}");
    Ok(())
}

#[tokio::test]
async fn commands_abbreviate_to_unique_prefixes() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    ensure_eq!(c.command("l s").await?, "");
    ensure_eq!(c.command("lis proc").await?, "");
    ensure_eq!(c.command("l v").await?, "");
    c.command("s aack bar").await?;
    ensure_eq!(c.command("g aack").await?, "bar");
    c.command("r v aack").await?;
    Ok(())
}

#[tokio::test]
async fn exit_if_idle_cannot_be_abbreviated() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    ensure_eq!(c.command_err("exit").await?, "You cannot abbreviate \"exit-if-idle\"");
    ensure_eq!(c.command_err("e").await?, "You cannot abbreviate \"exit-if-idle\"");
    Ok(())
}

#[test]
fn ambiguous_prefixes_are_rejected() {
    fn nothing(
        _: &std::sync::Arc<crate::kernel::Kernel>,
        _: Vec<String>,
    ) -> crate::error::Result<Outcome> {
        Ok(Outcome::reply(""))
    }
    static FAKE: &[(&str, Node)] = &[
        ("start", Node::Leaf { help: "", handler: nothing }),
        ("status", Node::Leaf { help: "", handler: nothing }),
        ("stop", Node::Leaf { help: "", handler: nothing }),
    ];
    let err = find("st", FAKE, None).unwrap_err();
    let Error::Protocol(msg) = err else { panic!("wrong error kind") };
    assert!(msg.contains("ambiguous"), "got {msg:?}");
    assert!(msg.contains("start, status"), "got {msg:?}");
    assert!(find("sta", FAKE, None).is_err(), "sta still matches two entries");
    assert!(find("star", FAKE, None).is_ok());
    assert!(find("sto", FAKE, None).is_ok());
    assert!(find("start", FAKE, None).is_ok());
}

#[tokio::test]
async fn help_texts() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    ensure!(c.command("help").await?.contains("Possible commands"), "top-level help");
    ensure!(c.command("help make").await?.contains("Make a new socket"), "branch help");
    ensure!(c.command("help make process").await?.contains("Launch a process"), "leaf help");
    ensure!(c.command("h wat proc").await?.contains("output"), "help resolves abbreviations");
    // An unknown help target is reported as a normal reply.
    ensure_eq!(c.command("help nope").await?, "Unknown command \"nope\"");
    Ok(())
}

#[tokio::test]
async fn quit_says_ok_and_hangs_up() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    c.send_line("quit").await?;
    ensure_eq!(c.read_line().await?, "ok");
    ensure_eq!(c.read_line().await?, "", "the kernel should close the connection");
    Ok(())
}

#[tokio::test]
async fn single_socket_mode_exits_after_one_session() -> TestResult {
    install();
    let listener = ControlListener::bind(&Endpoint::Tcp(0)).await?;
    let port = listener.local_port()?;
    let handle = tokio::spawn(server::serve(Kernel::new(), listener, true));

    let mut c = Client::connect(port).await?;
    c.send_line("quit").await?;
    ensure_eq!(c.read_line().await?, "ok");
    drop(c);

    let served = tokio::time::timeout(Duration::from_secs(5), handle).await;
    ensure!(served.is_ok(), "single-socket mode must end with its only session");
    Ok(())
}

#[tokio::test]
async fn unix_control_socket_serves_and_unlinks() -> TestResult {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixStream,
    };

    install();
    let path = std::env::temp_dir().join(format!("papa-ctl-{}.sock", std::process::id()));
    let listener = ControlListener::bind(&Endpoint::Unix(path.clone())).await?;
    let handle = tokio::spawn(server::serve(Kernel::new(), listener, false));

    let mut stream = UnixStream::connect(&path).await?;
    let mut greeting = vec![0u8; 128];
    let n = stream.read(&mut greeting).await?;
    ensure!(
        String::from_utf8_lossy(&greeting[..n]).contains("Papa is home"),
        "unexpected greeting over the unix control socket"
    );
    stream.write_all(b"exit-if-idle\n").await?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    ensure!(String::from_utf8_lossy(&reply).contains("Exiting papa!"), "missing final words");
    drop(stream);

    let served = tokio::time::timeout(Duration::from_secs(5), handle).await;
    ensure!(served.is_ok(), "the kernel should exit once idle");
    ensure!(!path.exists(), "the control socket path must be unlinked on exit");
    Ok(())
}

#[tokio::test]
async fn exit_if_idle_only_when_idle() -> TestResult {
    let tk = start_kernel().await?;
    let mut c = Client::connect(tk.port).await?;
    c.command("set keep me").await?;
    ensure_eq!(c.command("exit-if-idle").await?, "not idle");
    c.command("remove values keep").await?;

    c.send_line("exit-if-idle").await?;
    ensure_eq!(c.read_reply().await?, "Exiting papa!");
    drop(c);

    let served = tokio::time::timeout(Duration::from_secs(5), tk.handle).await;
    ensure!(served.is_ok(), "the kernel should exit once idle");
    ensure!(Client::connect(tk.port).await.is_err(), "nobody should be listening anymore");
    Ok(())
}
