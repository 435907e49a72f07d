/// 监听循环
///
/// 持续接受入站连接，每个连接在独立任务中完成配对和中继，接受循环从不等待会话结束。
/// 临时性的 accept 错误记录后退避重试；永久性错误结束循环并作为致命错误返回。
use crate::error::{Result, TunnelError};
use crate::pairer::Pairer;
use crate::pool::BufferPool;
use crate::relay::{RelayOptions, RelaySession};
use crate::stats::{RelayStats, SessionGuard};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// 监听循环共享给所有会话的资源
#[derive(Clone)]
pub struct ListenerContext {
    pub pool: Arc<BufferPool>,
    pub stats: RelayStats,
    pub relay_options: RelayOptions,
    /// 停止后等待活动会话的时间
    pub shutdown_grace: Duration,
}

/// 监听器已不可用的 accept 错误
///
/// 其余错误（fd 耗尽、连接在 accept 前被重置等）都视为临时错误。
pub fn is_permanent_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Unsupported
            | io::ErrorKind::BrokenPipe
    )
}

enum Accepted {
    Conn(io::Result<(TcpStream, SocketAddr)>),
    Shutdown,
}

/// 运行监听循环直到 `shutdown` 被取消或发生永久性 accept 错误
///
/// 返回前会等待所有会话结束（最多 `shutdown_grace`，之后取消剩余会话）。
pub async fn run_listener(
    listener: TcpListener,
    pairer: Arc<dyn Pairer>,
    ctx: ListenerContext,
    shutdown: CancellationToken,
) -> Result<()> {
    let tracker = TaskTracker::new();
    // 会话不随监听器立即取消，只在宽限期结束后取消
    let sessions = CancellationToken::new();
    let mut backoff = MIN_ACCEPT_BACKOFF;

    if let Ok(addr) = listener.local_addr() {
        info!(mode = %pairer.mode(), "Listening on {}", addr);
    }

    let result = loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => Accepted::Shutdown,
            conn = listener.accept() => Accepted::Conn(conn),
        };

        match accepted {
            Accepted::Shutdown => {
                info!("Listener shutting down");
                break Ok(());
            }
            Accepted::Conn(Ok((stream, peer))) => {
                backoff = MIN_ACCEPT_BACKOFF;
                let id = ctx.stats.connection_accepted();
                debug!(session = id, %peer, "Accepted connection");
                tracker.spawn(handle_connection(
                    id,
                    stream,
                    peer,
                    Arc::clone(&pairer),
                    ctx.clone(),
                    sessions.clone(),
                ));
            }
            Accepted::Conn(Err(e)) if is_permanent_accept_error(&e) => {
                error!("Listener failed: {}", e);
                break Err(TunnelError::Listener(e));
            }
            Accepted::Conn(Err(e)) => {
                error!("Failed to accept connection: {}; retrying in {:?}", e, backoff);
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
            }
        }
    };

    drop(listener);
    drain_sessions(&tracker, &sessions, ctx.shutdown_grace).await;
    result
}

/// 等待会话结束，超过宽限期后取消剩余会话
async fn drain_sessions(tracker: &TaskTracker, sessions: &CancellationToken, grace: Duration) {
    tracker.close();
    if tracker.is_empty() {
        return;
    }

    info!("Waiting up to {:?} for {} active sessions", grace, tracker.len());
    if timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            "{} sessions still active after {:?}, closing them",
            tracker.len(),
            grace
        );
        sessions.cancel();
        tracker.wait().await;
    }
    info!("All sessions closed");
}

/// 配对并运行一个会话
async fn handle_connection(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    pairer: Arc<dyn Pairer>,
    ctx: ListenerContext,
    sessions: CancellationToken,
) {
    let paired = tokio::select! {
        _ = sessions.cancelled() => return,
        paired = pairer.pair(stream, peer) => paired,
    };

    let pair = match paired {
        Ok(pair) => pair,
        Err(e) => {
            if e.is_handshake_failure() {
                ctx.stats.handshake_failed();
            } else {
                ctx.stats.dial_failed();
            }
            warn!(session = id, %peer, "Connection pairing failed: {}", e);
            return;
        }
    };

    let _guard = SessionGuard::new(ctx.stats.clone());
    RelaySession::new(pair, ctx.pool, ctx.relay_options, &sessions)
        .with_id(id)
        .with_stats(ctx.stats)
        .run()
        .await;
}
