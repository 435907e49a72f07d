//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tlsproxy::tls::{self, Identity, TlsSettings};
use tlsproxy::{run_tunnel, Mode, TunnelConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Default bound for every wait in the integration tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Sessions still open when a test stops its tunnel are cancelled after this
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Generate an in-memory identity valid for localhost / 127.0.0.1
pub fn test_identity() -> Identity {
    Identity::self_signed(&["localhost".to_string(), "127.0.0.1".to_string()])
        .expect("Failed to generate test identity")
}

/// TLS settings presenting `own` and trusting only `trusted`
pub fn tls_settings(
    own: Option<&Identity>,
    trusted: &Identity,
    require_client_auth: bool,
) -> TlsSettings {
    TlsSettings::new(
        own.cloned(),
        trusted.root_store().expect("Failed to build root store"),
        require_client_auth,
    )
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let unique_id = format!(
        "{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let temp_dir = std::env::temp_dir();
    let cert_path = temp_dir.join(format!("tlsproxy-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("tlsproxy-test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Cleanup function for test resources
pub struct TestCleanup {
    paths: Vec<PathBuf>,
}

impl TestCleanup {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    addr
}

/// What the ping-pong backend observed on one accepted connection
#[derive(Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Accepted,
    Received(Vec<u8>),
    Closed,
}

/// Backend that answers "PING" with "PONG" and reports what it sees
pub async fn start_ping_pong_server() -> (SocketAddr, mpsc::UnboundedReceiver<BackendEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind ping-pong server");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            let _ = tx.send(BackendEvent::Accepted);
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if socket.read_exact(&mut buf).await.is_ok() {
                    let _ = tx.send(BackendEvent::Received(buf.to_vec()));
                    if &buf == b"PING" {
                        let _ = socket.write_all(b"PONG").await;
                    }
                }
                // Wait for the relay to close its outbound leg
                let mut rest = Vec::new();
                let _ = socket.read_to_end(&mut rest).await;
                let _ = tx.send(BackendEvent::Closed);
            });
        }
    });

    (addr, rx)
}

/// Backend that only counts accepted connections
pub async fn start_counting_server() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let _ = tx.send(());
            drop(socket);
        }
    });

    (addr, rx)
}

/// A tunnel running on an ephemeral port
pub struct RunningTunnel {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<tlsproxy::Result<()>>,
}

impl RunningTunnel {
    /// Stop the tunnel and wait for it to return
    pub async fn stop(mut self) -> tlsproxy::Result<()> {
        self.shutdown.cancel();
        timeout(WAIT, &mut self.handle)
            .await
            .expect("Tunnel did not stop in time")
            .expect("Tunnel task panicked")
    }
}

impl Drop for RunningTunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind 127.0.0.1:0 and run the tunnel on it
pub async fn spawn_tunnel(config: TunnelConfig) -> RunningTunnel {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind tunnel listener");
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_tunnel(listener, config, shutdown.clone()));

    RunningTunnel {
        addr,
        shutdown,
        handle,
    }
}

/// Server-mode config: present `server`, accept only clients signed by `client_ca`
pub fn server_config(forward: SocketAddr, server: &Identity, client_ca: &Identity) -> TunnelConfig {
    let mut config = TunnelConfig::new(
        Mode::Server,
        forward.to_string(),
        tls_settings(Some(server), client_ca, true),
    );
    config.timeouts.shutdown_grace = SHUTDOWN_GRACE;
    config
}

/// Client-mode config: present `client`, trust only `server_ca`
pub fn client_config(remote: SocketAddr, client: &Identity, server_ca: &Identity) -> TunnelConfig {
    let mut config = TunnelConfig::new(
        Mode::Client,
        remote.to_string(),
        tls_settings(Some(client), server_ca, false),
    );
    config.server_name = Some("localhost".to_string());
    config.timeouts.shutdown_grace = SHUTDOWN_GRACE;
    config
}

/// Read until EOF or error, returning whatever arrived first
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = timeout(WAIT, stream.read_to_end(&mut data))
        .await
        .expect("Connection was not closed in time");
    data
}

/// Wait for the next event from a backend
pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    timeout(WAIT, rx.recv()).await.ok().flatten()
}
