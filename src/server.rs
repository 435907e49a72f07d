use crate::config::{Mode, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::tls::TlsSettings;
use crate::tunnel::run_tunnel;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// 服务端模式：接受 mTLS 连接，明文转发到 `forward_addr`
///
/// `tls` 必须包含本端身份；`require_client_auth` 为 true 时只接受
/// 由信任根签发的客户端证书。
pub async fn run_server(
    listener: TcpListener,
    forward_addr: &str,
    keepalive_period: Duration,
    tls: TlsSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    if tls.identity.is_none() {
        return Err(TunnelError::config_error(
            "Server mode requires a certificate and private key",
        ));
    }

    let mut config = TunnelConfig::new(Mode::Server, forward_addr, tls);
    config.keepalive_period = keepalive_period;
    run_tunnel(listener, config, shutdown).await
}
