/// TCP keepalive 配置
///
/// 中继的两端连接在建立后立即设置 keepalive，用于发现已经失联的对端。
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 按周期设置 TCP keepalive
///
/// 周期为 0 时关闭 keepalive；否则首次探测时间和探测间隔都设置为该周期。
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let sock_ref = SockRef::from(stream);

    if period.is_zero() {
        return sock_ref.set_keepalive(false);
    }

    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "windows",
    ))]
    let keepalive = keepalive.with_interval(period);

    sock_ref.set_tcp_keepalive(&keepalive)
}

/// 应用 keepalive，失败只记录日志，不影响会话
pub fn apply_keepalive(stream: &TcpStream, period: Duration, leg: &str) {
    match set_keepalive(stream, period) {
        Ok(()) => debug!(leg, ?period, "TCP keepalive configured"),
        Err(e) => warn!(
            "Failed to set TCP keepalive on {} leg {}: {}",
            leg,
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        ),
    }
}
