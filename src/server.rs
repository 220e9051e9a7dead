//! The control-socket acceptor: binds, accepts, spawns session tasks and
//! notices when it is time to go.

use std::{
    io,
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream},
    task::JoinSet,
    time::timeout,
};

use crate::{kernel::Kernel, session};

/// Where the kernel listens for clients.
#[derive(Clone, Debug)]
pub enum Endpoint {
    /// `127.0.0.1:<port>`.
    Tcp(u16),
    /// A Unix stream socket at this path.
    Unix(PathBuf),
}

/// The bound control socket. The Unix flavor unlinks its path on drop.
pub enum ControlListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl ControlListener {
    /// Binds the control socket. A stale Unix socket file is unlinked
    /// first; TCP binds with `SO_REUSEADDR` so a restart does not trip
    /// over TIME_WAIT.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(port) => {
                let socket = TcpSocket::new_v4()?;
                socket.set_reuseaddr(true)?;
                socket.bind(SocketAddr::from(([127, 0, 0, 1], *port)))?;
                Ok(Self::Tcp(socket.listen(5)?))
            }
            Endpoint::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                Ok(Self::Unix(UnixListener::bind(path)?, path.clone()))
            }
        }
    }

    /// The actual TCP port, for callers that bound port 0.
    pub fn local_port(&self) -> io::Result<u16> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.port()),
            Self::Unix(..) => Err(io::Error::other("not a TCP listener")),
        }
    }

    async fn accept(&self) -> io::Result<(ControlStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((ControlStream::Tcp(stream), addr.to_string()))
            }
            Self::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((ControlStream::Unix(stream), path.display().to_string()))
            }
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// One accepted client connection, TCP or Unix, behind a single type so
/// the session loop does not care which.
pub enum ControlStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ControlStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// The accept loop. Returns once `exit-if-idle` has been honored or, in
/// single-socket mode, when the only session ends. On the way out every
/// registry entry is dropped, closing listener fds and unlinking Unix
/// socket paths.
pub async fn serve(
    kernel: Arc<Kernel>,
    listener: ControlListener,
    single_socket_mode: bool,
) -> io::Result<()> {
    tracing::info!("Listening");
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        if sessions.is_empty() {
            // Nobody around to exit for; wait as long as it takes.
            let (stream, peer) = listener.accept().await?;
            start_session(&kernel, &mut sessions, stream, peer)?;
        } else {
            match timeout(Duration::from_millis(500), listener.accept()).await {
                Ok(Ok((stream, peer))) => start_session(&kernel, &mut sessions, stream, peer)?,
                Ok(Err(e)) => tracing::warn!("accept failed: {e}"),
                Err(_) => {}
            }
        }
        while sessions.try_join_next().is_some() {}
        if sessions.is_empty() {
            if single_socket_mode {
                break;
            }
            let exit = {
                let state = kernel.lock()?;
                state.exit_if_idle && state.is_idle()
            };
            if exit {
                tracing::info!("Exiting due to exit_if_idle request");
                break;
            }
        }
    }
    drop(listener);
    kernel.lock()?.clear();
    Ok(())
}

fn start_session(
    kernel: &Arc<Kernel>,
    sessions: &mut JoinSet<()>,
    stream: ControlStream,
    peer: String,
) -> io::Result<()> {
    kernel.lock()?.exit_if_idle = false;
    sessions.spawn(session::run(kernel.clone(), stream, peer));
    Ok(())
}
