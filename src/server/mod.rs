//! Local HTTP server for cached derivatives.
//!
//! Routes: `GET /health`, and `GET /{thumb|preview|standard|full}/{project}/{file}`.
//! Requests are resolved through the project registry, so the server holds
//! no state of its own.

pub(crate) mod http;
mod routes;

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::reconcile::ProjectRegistry;

pub struct Server {
    listener: TcpListener,
    registry: ProjectRegistry,
    port: u16,
    head_timeout: Duration,
}

impl Server {
    /// Bind the first free port at or above `start_port`.
    pub async fn bind(config: &ServerConfig, registry: ProjectRegistry) -> Result<Self> {
        let attempts = config.port_attempts.max(1);
        for offset in 0..attempts {
            let Some(port) = config.start_port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((config.host.as_str(), port)).await {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    info!("Derivative server listening on {}:{}", config.host, port);
                    return Ok(Self {
                        listener,
                        registry,
                        port,
                        head_timeout: Duration::from_millis(config.head_timeout_ms),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!("Port {} in use, trying next", port);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to bind {}:{}", config.host, port));
                }
            }
        }
        anyhow::bail!(
            "No free port in {}..{} on {}",
            config.start_port,
            config.start_port.saturating_add(attempts),
            config.host
        )
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn base_url(&self) -> String {
        match self.listener.local_addr() {
            Ok(addr) => format!("http://{}", addr),
            Err(_) => format!("http://127.0.0.1:{}", self.port),
        }
    }

    /// Start accepting connections in the background.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = self.port;
        let task = tokio::spawn(self.serve(shutdown_rx));
        ServerHandle {
            port,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = self.registry.clone();
                        let port = self.port;
                        let head_timeout = self.head_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, port, head_timeout).await {
                                debug!("Connection from {} failed: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Derivative server on port {} stopped", self.port);
    }
}

/// Answer one request. A head that is too long, malformed or not complete
/// within `head_timeout` gets a 400.
async fn handle_connection<S>(stream: S, registry: ProjectRegistry, port: u16, head_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half.take(http::MAX_HEAD_BYTES as u64));
    let head = tokio::time::timeout(head_timeout, http::read_request(&mut reader)).await;
    let response = match head {
        Ok(Ok(Some(request))) => {
            let response = routes::route(&request, &registry, port).await;
            debug!("{} {} -> {}", request.method, request.path, response.status);
            response
        }
        Ok(Ok(None)) => http::Response::text(400, "bad request"),
        Ok(Err(e)) => {
            debug!("Unreadable request head: {}", e);
            http::Response::text(400, "bad request")
        }
        Err(_) => {
            debug!("Request head not received within {:?}", head_timeout);
            http::Response::text(400, "request timeout")
        }
    };
    response.write_to(&mut write_half).await
}

pub struct ServerHandle {
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and wait for the accept loop to exit. Connections
    /// already being answered finish on their own.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("Server task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn config(start_port: u16) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            start_port,
            port_attempts: 50,
            head_timeout_ms: 200,
        }
    }

    async fn get(port: u16, raw: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).to_string()
    }

    #[tokio::test]
    async fn test_skips_ports_in_use() {
        let first = Server::bind(&config(23450), ProjectRegistry::new()).await.unwrap();
        let second = Server::bind(&config(first.port()), ProjectRegistry::new()).await.unwrap();
        assert!(second.port() > first.port());
    }

    #[tokio::test]
    async fn test_health_and_bad_request() {
        let server = Server::bind(&config(23550), ProjectRegistry::new()).await.unwrap();
        let port = server.port();
        let handle = server.spawn();

        let health = get(port, "GET /health HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(health.starts_with("HTTP/1.1 200 OK"));
        assert!(health.contains(&format!("\"port\":{}", port)));
        assert!(health.contains("\"status\":\"ok\""));

        let bad = get(port, "nonsense\r\n\r\n").await;
        assert!(bad.starts_with("HTTP/1.1 400"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_head_is_bad_request() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(
            server,
            ProjectRegistry::new(),
            1,
            Duration::from_secs(5),
        ));

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(&vec![b'A'; 20_000]).await.unwrap();
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let server = Server::bind(&config(23650), ProjectRegistry::new()).await.unwrap();
        let port = server.port();
        let handle = server.spawn();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\n").await.unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .expect("server kept the connection open")
            .unwrap();
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 400"));

        handle.shutdown().await.unwrap();
    }
}
