//! Domain socket proxy: exposes a host-side Unix socket (typically the
//! container engine's control socket) to a container through a per-kernel
//! listening socket.
//!
//! Each accepted connection opens one upstream connection and runs two copy
//! loops. Whichever loop finishes first cancels the other, and the relay
//! returns only after both have shut down their writers.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::kernel::DomainSocketProxyDescriptor;
use crate::types::{Error, ProxyConfig, Result};

/// Subdirectory of the IPC base path holding proxy sockets.
pub const PROXY_SUBDIR: &str = "proxy";

/// A listening proxy socket bound to one upstream path.
#[derive(Debug)]
pub struct DomainSocketProxy {
    host_sock_path: PathBuf,
    host_proxy_path: PathBuf,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl DomainSocketProxy {
    /// Bind a fresh proxy socket at `<ipc_base>/proxy/<random>.sock`.
    pub async fn start(
        host_sock_path: impl Into<PathBuf>,
        ipc_base_path: &Path,
        config: &ProxyConfig,
    ) -> Result<Self> {
        let token = uuid::Uuid::new_v4();
        let name = format!("{}.sock", hex::encode(&token.as_bytes()[..12]));
        let descriptor = DomainSocketProxyDescriptor {
            host_sock_path: host_sock_path.into(),
            host_proxy_path: ipc_base_path.join(PROXY_SUBDIR).join(name),
        };
        Self::bind(descriptor, config).await
    }

    /// Bind at the descriptor's proxy path, replacing a stale socket file
    /// left by a previous agent process.
    pub async fn bind(descriptor: DomainSocketProxyDescriptor, config: &ProxyConfig) -> Result<Self> {
        let DomainSocketProxyDescriptor {
            host_sock_path,
            host_proxy_path,
        } = descriptor;
        if let Some(parent) = host_proxy_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&host_proxy_path).await {
            Ok(()) => tracing::debug!("proxy_stale_socket_removed: path={}", host_proxy_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&host_proxy_path)?;
        tokio::fs::set_permissions(
            &host_proxy_path,
            std::fs::Permissions::from_mode(config.socket_mode),
        )
        .await?;

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            host_sock_path.clone(),
            config.chunk_size.max(1),
            cancel.clone(),
        ));
        tracing::info!(
            "proxy_started: upstream={} proxy={}",
            host_sock_path.display(),
            host_proxy_path.display()
        );

        Ok(Self {
            host_sock_path,
            host_proxy_path,
            cancel,
            server: Some(server),
        })
    }

    pub fn host_sock_path(&self) -> &Path {
        &self.host_sock_path
    }

    pub fn host_proxy_path(&self) -> &Path {
        &self.host_proxy_path
    }

    pub fn descriptor(&self) -> DomainSocketProxyDescriptor {
        DomainSocketProxyDescriptor {
            host_sock_path: self.host_sock_path.clone(),
            host_proxy_path: self.host_proxy_path.clone(),
        }
    }

    /// Stop accepting, cancel in-flight relays and unlink the socket file.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                tracing::warn!("proxy_server_join_failed: error={}", e);
            }
            match tokio::fs::remove_file(&self.host_proxy_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "proxy_unlink_failed: path={} error={}",
                    self.host_proxy_path.display(),
                    e
                ),
            }
            tracing::info!("proxy_closed: proxy={}", self.host_proxy_path.display());
        }
    }
}

impl Drop for DomainSocketProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(listener: UnixListener, upstream: PathBuf, chunk_size: usize, cancel: CancellationToken) {
    let mut relays = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!("proxy_accept_failed: error={}", e);
                        continue;
                    }
                };
                let upstream = upstream.clone();
                let shutdown = cancel.child_token();
                relays.spawn(async move {
                    if let Err(e) = proxy_connection(&upstream, stream, chunk_size, shutdown).await {
                        tracing::warn!("proxy_relay_failed: upstream={} error={}", upstream.display(), e);
                    }
                });
            }
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }
    while relays.join_next().await.is_some() {}
}

/// Relay bytes between `downstream` and a new connection to `upstream_path`
/// until either side closes or `shutdown` fires.
pub async fn proxy_connection(
    upstream_path: &Path,
    downstream: UnixStream,
    chunk_size: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let upstream = UnixStream::connect(upstream_path).await.map_err(|e| {
        Error::transport(format!("connect {}: {}", upstream_path.display(), e))
    })?;
    let (down_reader, down_writer) = downstream.into_split();
    let (up_reader, up_writer) = upstream.into_split();

    let cancel = shutdown.child_token();
    let mut up_to_down = tokio::spawn(copy_loop(up_reader, down_writer, chunk_size, cancel.clone()));
    let mut down_to_up = tokio::spawn(copy_loop(down_reader, up_writer, chunk_size, cancel.clone()));

    let (first, rest) = tokio::select! {
        r = &mut up_to_down => (r, down_to_up),
        r = &mut down_to_up => (r, up_to_down),
    };
    cancel.cancel();
    let second = rest.await;

    let mut failure = None;
    for joined in [first, second] {
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => failure = Some(Error::Io(e)),
            Err(e) => failure = Some(Error::internal(format!("relay task failed: {}", e))),
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Copy until EOF, error or cancellation; the writer is always shut down.
async fn copy_loop(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    chunk_size: usize,
    cancel: CancellationToken,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    let outcome = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break Ok(total),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break Ok(total),
            w = writer.write_all(&buf[..n]) => w,
        };
        if let Err(e) = written {
            break Err(e);
        }
        total += n as u64;
    };

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    outcome
}
