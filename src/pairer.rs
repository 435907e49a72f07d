/// 连接配对
///
/// 对每个被接受的入站连接建立对应的出站连接。服务端模式在入站连接上完成 TLS 握手后
/// 明文拨号转发地址；客户端模式接受明文入站连接，拨号后在出站连接上完成 TLS 握手。
/// 两种模式实现同一个 [`Pairer`] 接口，启动时选定一次，中继会话本身与模式无关。
use crate::config::{Mode, TunnelConfig};
use crate::error::{Result, Stage, TunnelError};
use crate::keepalive::apply_keepalive;
use crate::tls;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// 双向字节流抽象
///
/// 统一封装明文 TCP、TLS 连接和测试用的内存流
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// 底层 TCP 连接（内存流没有）
    fn tcp(&self) -> Option<&TcpStream> {
        None
    }
}

impl Transport for TcpStream {
    fn tcp(&self) -> Option<&TcpStream> {
        Some(self)
    }
}

impl Transport for tokio_rustls::server::TlsStream<TcpStream> {
    fn tcp(&self) -> Option<&TcpStream> {
        Some(self.get_ref().0)
    }
}

impl Transport for tokio_rustls::client::TlsStream<TcpStream> {
    fn tcp(&self) -> Option<&TcpStream> {
        Some(self.get_ref().0)
    }
}

impl Transport for DuplexStream {}

pub type BoxedStream = Pin<Box<dyn Transport>>;

/// 一对已建立的连接，由创建它的中继会话独占
pub struct ConnectionPair {
    /// 监听器接受的一端
    pub inbound: BoxedStream,
    /// 拨向转发地址的一端
    pub outbound: BoxedStream,
    /// 入站对端地址
    pub peer: SocketAddr,
    /// 对端是否出示了经过验证的证书
    pub peer_verified: bool,
}

/// 连接一建立（TLS 端为握手完成后）就对其底层 TCP 连接应用 keepalive
fn keepalive_leg<T: Transport>(stream: &T, period: Duration, leg: &str) {
    if let Some(tcp) = stream.tcp() {
        apply_keepalive(tcp, period, leg);
    }
}

/// 配对参数
#[derive(Debug, Clone)]
pub struct PairingOptions {
    pub forward_addr: String,
    pub keepalive_period: Duration,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl PairingOptions {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            forward_addr: config.forward_addr.clone(),
            keepalive_period: config.keepalive_period,
            handshake_timeout: config.timeouts.handshake,
            dial_timeout: config.timeouts.dial,
        }
    }
}

/// 建立配对连接的接口
#[async_trait]
pub trait Pairer: Send + Sync {
    /// 为入站连接建立配对；失败时入站连接随之关闭
    async fn pair(&self, inbound: TcpStream, peer: SocketAddr) -> Result<ConnectionPair>;

    /// 对应的运行模式
    fn mode(&self) -> Mode;
}

/// 带超时的出站 TCP 拨号
pub async fn dial(addr: &str, dial_timeout: Duration) -> Result<TcpStream> {
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TunnelError::connection_failed(addr, e)),
        Err(_) => Err(TunnelError::timeout(Stage::Dial, dial_timeout)),
    }
}

/// 服务端模式：入站 TLS 握手 + 出站明文拨号
pub struct ServerPairer {
    acceptor: TlsAcceptor,
    options: PairingOptions,
}

impl ServerPairer {
    pub fn new(acceptor: TlsAcceptor, options: PairingOptions) -> Self {
        Self { acceptor, options }
    }
}

#[async_trait]
impl Pairer for ServerPairer {
    async fn pair(&self, inbound: TcpStream, peer: SocketAddr) -> Result<ConnectionPair> {
        let handshake_timeout = self.options.handshake_timeout;
        let tls_stream = match timeout(handshake_timeout, self.acceptor.accept(inbound)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TunnelError::handshake_failed(peer, e)),
            Err(_) => return Err(TunnelError::timeout(Stage::Handshake, handshake_timeout)),
        };

        let peer_verified = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .is_some_and(|chain| !chain.is_empty());
        debug!(%peer, peer_verified, "TLS handshake completed");
        keepalive_leg(&tls_stream, self.options.keepalive_period, "inbound");

        // 拨号失败时 tls_stream 被 drop，入站连接随之关闭
        let outbound = dial(&self.options.forward_addr, self.options.dial_timeout).await?;
        keepalive_leg(&outbound, self.options.keepalive_period, "outbound");

        Ok(ConnectionPair {
            inbound: Box::pin(tls_stream),
            outbound: Box::pin(outbound),
            peer,
            peer_verified,
        })
    }

    fn mode(&self) -> Mode {
        Mode::Server
    }
}

/// 客户端模式：入站明文 + 出站拨号后 TLS 握手
pub struct ClientPairer {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    options: PairingOptions,
}

impl ClientPairer {
    pub fn new(
        connector: TlsConnector,
        server_name: ServerName<'static>,
        options: PairingOptions,
    ) -> Self {
        Self {
            connector,
            server_name,
            options,
        }
    }
}

#[async_trait]
impl Pairer for ClientPairer {
    async fn pair(&self, inbound: TcpStream, peer: SocketAddr) -> Result<ConnectionPair> {
        keepalive_leg(&inbound, self.options.keepalive_period, "inbound");

        let forward_addr = &self.options.forward_addr;
        let tcp_stream = dial(forward_addr, self.options.dial_timeout).await?;

        let handshake_timeout = self.options.handshake_timeout;
        let tls_stream = match timeout(
            handshake_timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TunnelError::handshake_failed(forward_addr, e)),
            Err(_) => return Err(TunnelError::timeout(Stage::Handshake, handshake_timeout)),
        };

        debug!(%peer, forward = %forward_addr, "TLS connection established");
        keepalive_leg(&tls_stream, self.options.keepalive_period, "outbound");

        Ok(ConnectionPair {
            inbound: Box::pin(inbound),
            outbound: Box::pin(tls_stream),
            peer,
            peer_verified: false,
        })
    }

    fn mode(&self) -> Mode {
        Mode::Client
    }
}

/// 根据模式创建配对器
pub fn create_pairer(config: &TunnelConfig) -> Result<Arc<dyn Pairer>> {
    let options = PairingOptions::from_config(config);

    let pairer: Arc<dyn Pairer> = match config.mode {
        Mode::Server => {
            let server_config = tls::build_server_config(&config.tls)?;
            Arc::new(ServerPairer::new(TlsAcceptor::from(server_config), options))
        }
        Mode::Client => {
            let client_config = tls::build_client_config(&config.tls)?;
            let server_name = ServerName::try_from(config.effective_server_name().to_string())
                .map_err(|e| {
                    TunnelError::config_error(format!(
                        "Invalid server name '{}': {}",
                        config.effective_server_name(),
                        e
                    ))
                })?;
            Arc::new(ClientPairer::new(
                TlsConnector::from(client_config),
                server_name,
                options,
            ))
        }
    };

    Ok(pairer)
}
