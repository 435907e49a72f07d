use crate::config::{Mode, TunnelConfig};
use crate::error::Result;
use crate::tls::TlsSettings;
use crate::tunnel::run_tunnel;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// 客户端模式：接受明文连接，通过 mTLS 转发到远端隧道 `forward_addr`
///
/// 握手使用的服务器名称取 `forward_addr` 的主机部分，远端证书只按 `tls` 中的
/// 信任根验证。
pub async fn run_client(
    listener: TcpListener,
    forward_addr: &str,
    keepalive_period: Duration,
    tls: TlsSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut config = TunnelConfig::new(Mode::Client, forward_addr, tls);
    config.keepalive_period = keepalive_period;
    run_tunnel(listener, config, shutdown).await
}
