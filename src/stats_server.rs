use crate::pool::BufferPool;
use crate::stats::{RelayStats, RelayStatsSnapshot};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 启动统计数据 HTTP 服务器
pub async fn start_stats_server(
    addr: &str,
    stats: RelayStats,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind stats server address {}", addr))?;

    info!("Stats server listening on http://{}", listener.local_addr()?);
    serve_stats(listener, stats, pool, shutdown).await;
    Ok(())
}

/// 在已绑定的监听器上提供统计数据，直到 `shutdown` 被取消
pub async fn serve_stats(
    listener: TcpListener,
    stats: RelayStats,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((mut stream, addr)) => {
                let snapshot = stats.snapshot(&pool);
                tokio::spawn(async move {
                    handle_stats_request(&mut stream, addr, &snapshot).await;
                });
            }
            Err(e) => {
                error!("Failed to accept stats connection: {}", e);
            }
        }
    }
    debug!("Stats server stopped");
}

/// 处理单个统计请求
async fn handle_stats_request(
    stream: &mut TcpStream,
    addr: SocketAddr,
    snapshot: &RelayStatsSnapshot,
) {
    let mut buffer = vec![0u8; 4096];
    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) => {
            error!("Failed to read from stats client {}: {}", addr, e);
            return;
        }
    };

    // 只看请求行的路径
    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = if path == "/stats" || path == "/stats/" {
        let json = serde_json::to_string_pretty(snapshot).unwrap_or_default();
        http_response("200 OK", "application/json", &json)
    } else if path == "/" || path.starts_with("/?") {
        http_response("200 OK", "text/plain; charset=utf-8", &render_summary(snapshot))
    } else {
        http_response("404 Not Found", "text/plain", "404 Not Found")
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response to {}: {}", addr, e);
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// 纯文本摘要
fn render_summary(s: &RelayStatsSnapshot) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(s.start_time);

    format!(
        "tlsproxy {} ({} mode)\n\
         forward:    {}\n\
         uptime:     {}\n\
         accepted:   {}\n\
         active:     {}\n\
         completed:  {}\n\
         handshake failures: {}\n\
         dial failures:      {}\n\
         upstream:   {}\n\
         downstream: {}\n\
         buffers:    {} in use, {} overflow, {} idle\n",
        env!("CARGO_PKG_VERSION"),
        s.mode,
        s.forward_addr,
        format_duration(now.saturating_sub(s.start_time)),
        s.accepted_connections,
        s.active_sessions,
        s.completed_sessions,
        s.handshake_failures,
        s.dial_failures,
        format_bytes(s.bytes_upstream),
        format_bytes(s.bytes_downstream),
        s.buffers_outstanding,
        s.buffers_overflow,
        s.buffers_idle,
    )
}

/// 格式化字节数为人类可读格式
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// 格式化持续时间为人类可读格式
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
