/// 中继会话
///
/// 一个会话独占一对连接，并发运行两个方向的拷贝：入站→出站（upstream）和
/// 出站→入站（downstream）。每次拷贝从缓冲区池借一个缓冲区，读、写、归还。
///
/// 关闭顺序：
/// - 某个方向读到 EOF 或出错后，对其目标端做半关闭（shutdown 写方向），使远端读到 EOF；
/// - 若该方向出错，立即取消另一个方向；若是正常 EOF，另一个方向最多再运行 `drain_timeout`；
/// - 两个方向都结束后，两端连接都会被完整关闭，所有缓冲区都已归还。
use crate::error::{peer_label, Stage, TunnelError};
use crate::pairer::{BoxedStream, ConnectionPair};
use crate::pool::BufferPool;
use crate::stats::RelayStats;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 最终关闭连接时每一端的等待上限
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// 拷贝方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 入站 → 出站
    Upstream,
    /// 出站 → 入站
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => write!(f, "inbound->outbound"),
            Direction::Downstream => write!(f, "outbound->inbound"),
        }
    }
}

/// 单个方向的结束原因
#[derive(Debug)]
pub enum TransferEnd {
    /// 源端正常结束
    Eof,
    /// 被会话或进程取消
    Cancelled,
    /// 读写失败（包括空闲超时）
    Failed(io::Error),
}

/// 单个方向的拷贝结果
#[derive(Debug)]
pub struct Transfer {
    pub direction: Direction,
    pub bytes: u64,
    pub end: TransferEnd,
}

impl Transfer {
    pub fn is_eof(&self) -> bool {
        matches!(self.end, TransferEnd::Eof)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.end, TransferEnd::Failed(_))
    }
}

/// 会话结果
#[derive(Debug)]
pub struct SessionSummary {
    pub upstream: Transfer,
    pub downstream: Transfer,
}

impl SessionSummary {
    /// 两个方向都以 EOF 结束
    pub fn is_clean(&self) -> bool {
        self.upstream.is_eof() && self.downstream.is_eof()
    }
}

/// 会话参数
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// 两个方向都没有数据的最长时间；None 表示不限制
    pub idle_timeout: Option<Duration>,
    /// 一个方向正常结束后另一个方向的最长排空时间；None 表示等待它自行结束
    pub drain_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            drain_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// 会话内两个方向共享的最近活动时间
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// 一次拷贝循环共享的上下文
struct PumpContext<'a> {
    pool: &'a Arc<BufferPool>,
    cancel: &'a CancellationToken,
    activity: &'a Activity,
    idle_timeout: Option<Duration>,
    stats: Option<&'a RelayStats>,
}

enum Step<T> {
    Ready(T),
    Cancelled,
}

/// 在取消信号和 `fut` 之间竞争
async fn or_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Step<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Step::Cancelled,
        out = fut => Step::Ready(out),
    }
}

/// 读取，若整个会话空闲超过 `idle_timeout` 则返回 TimedOut
async fn read_with_idle<R>(
    reader: &mut R,
    buf: &mut [u8],
    activity: &Activity,
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(idle) = idle_timeout else {
        return reader.read(buf).await;
    };

    loop {
        let remaining = idle.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                TunnelError::timeout(Stage::Idle, idle),
            ));
        }
        // read 是取消安全的，超时后重新发起不会丢数据
        if let Ok(result) = timeout(remaining, reader.read(buf)).await {
            return result;
        }
    }
}

async fn write_and_flush<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}

/// 单方向拷贝循环
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    ctx: &PumpContext<'_>,
) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;

    let end = loop {
        let mut buf = match or_cancelled(ctx.cancel, ctx.pool.acquire()).await {
            Step::Ready(Ok(buf)) => buf,
            Step::Ready(Err(e)) => break TransferEnd::Failed(io::Error::other(e)),
            Step::Cancelled => break TransferEnd::Cancelled,
        };

        let n = match or_cancelled(
            ctx.cancel,
            read_with_idle(reader, &mut buf, ctx.activity, ctx.idle_timeout),
        )
        .await
        {
            Step::Ready(Ok(0)) => break TransferEnd::Eof,
            Step::Ready(Ok(n)) => n,
            Step::Ready(Err(e)) => break TransferEnd::Failed(e),
            Step::Cancelled => break TransferEnd::Cancelled,
        };

        match or_cancelled(ctx.cancel, write_and_flush(writer, &buf[..n])).await {
            Step::Ready(Ok(())) => {}
            Step::Ready(Err(e)) => break TransferEnd::Failed(e),
            Step::Cancelled => break TransferEnd::Cancelled,
        }
        ctx.pool.release(buf);

        bytes += n as u64;
        ctx.activity.touch();
        if let Some(stats) = ctx.stats {
            match direction {
                Direction::Upstream => stats.add_bytes_upstream(n as u64),
                Direction::Downstream => stats.add_bytes_downstream(n as u64),
            }
        }
    };

    // 半关闭目标端，让远端读到 EOF；取消时由会话统一关闭
    if !matches!(end, TransferEnd::Cancelled) {
        if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            debug!(%direction, "Half-close failed: {}", e);
        }
    }

    Transfer {
        direction,
        bytes,
        end,
    }
}

/// 第一个方向结束后收尾另一个方向
async fn finish_remaining<F>(
    first: &Transfer,
    rest: &mut F,
    cancel: &CancellationToken,
    drain_timeout: Option<Duration>,
) -> Transfer
where
    F: Future<Output = Transfer> + Unpin,
{
    if !first.is_eof() {
        cancel.cancel();
    }

    let Some(drain_timeout) = drain_timeout else {
        return rest.await;
    };

    match timeout(drain_timeout, &mut *rest).await {
        Ok(transfer) => transfer,
        Err(_) => {
            debug!(direction = %first.direction, "Drain timeout reached, cancelling session");
            cancel.cancel();
            rest.await
        }
    }
}

/// 完整关闭一端（尽力而为）
async fn close_stream(read: ReadHalf<BoxedStream>, write: WriteHalf<BoxedStream>) {
    let mut stream = read.unsplit(write);
    let _ = timeout(CLOSE_TIMEOUT, stream.shutdown()).await;
}

/// 中继会话
pub struct RelaySession {
    id: u64,
    pair: ConnectionPair,
    pool: Arc<BufferPool>,
    options: RelayOptions,
    cancel: CancellationToken,
    stats: Option<RelayStats>,
}

impl RelaySession {
    /// `shutdown` 为进程级取消信号，会话使用其子令牌
    pub fn new(
        pair: ConnectionPair,
        pool: Arc<BufferPool>,
        options: RelayOptions,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            id: 0,
            pair,
            pool,
            options,
            cancel: shutdown.child_token(),
            stats: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_stats(mut self, stats: RelayStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.pair.peer
    }

    /// 运行直到两个方向都结束并关闭两端连接
    pub async fn run(self) -> SessionSummary {
        let RelaySession {
            id,
            pair,
            pool,
            options,
            cancel,
            stats,
        } = self;
        let ConnectionPair {
            inbound,
            outbound,
            peer,
            peer_verified,
        } = pair;

        debug!(session = id, %peer, peer_verified, "Relay session started");

        let (mut inbound_read, mut inbound_write) = tokio::io::split(inbound);
        let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);
        let activity = Activity::new();

        let ctx = PumpContext {
            pool: &pool,
            cancel: &cancel,
            activity: &activity,
            idle_timeout: options.idle_timeout,
            stats: stats.as_ref(),
        };

        let (upstream, downstream) = {
            let up = pump(
                &mut inbound_read,
                &mut outbound_write,
                Direction::Upstream,
                &ctx,
            );
            let down = pump(
                &mut outbound_read,
                &mut inbound_write,
                Direction::Downstream,
                &ctx,
            );
            tokio::pin!(up, down);

            let first = tokio::select! {
                transfer = &mut up => transfer,
                transfer = &mut down => transfer,
            };

            match first.direction {
                Direction::Upstream => {
                    let second =
                        finish_remaining(&first, &mut down, &cancel, options.drain_timeout).await;
                    (first, second)
                }
                Direction::Downstream => {
                    let second =
                        finish_remaining(&first, &mut up, &cancel, options.drain_timeout).await;
                    (second, first)
                }
            }
        };

        // 无论哪个方向先结束，两端都完整关闭
        tokio::join!(
            close_stream(inbound_read, inbound_write),
            close_stream(outbound_read, outbound_write),
        );

        let summary = SessionSummary {
            upstream,
            downstream,
        };
        log_summary(id, peer, &summary);
        summary
    }
}

fn log_summary(id: u64, peer: SocketAddr, summary: &SessionSummary) {
    for transfer in [&summary.upstream, &summary.downstream] {
        if let TransferEnd::Failed(ref e) = transfer.end {
            warn!(
                session = id,
                peer = %peer_label(Some(peer)),
                direction = %transfer.direction,
                "Relay error after {} bytes: {}",
                transfer.bytes,
                e
            );
        }
    }

    info!(
        session = id,
        %peer,
        up = summary.upstream.bytes,
        down = summary.downstream.bytes,
        "Connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, PoolPolicy};
    use rand::Rng;
    use tokio::io::{duplex, DuplexStream};

    fn test_pool() -> Arc<BufferPool> {
        BufferPool::new(PoolConfig {
            capacity: 8,
            buffer_size: 1024,
            policy: PoolPolicy::Block,
        })
    }

    /// 返回 (会话, 入站对端, 出站对端)
    fn session_with(
        pool: &Arc<BufferPool>,
        options: RelayOptions,
        shutdown: &CancellationToken,
    ) -> (RelaySession, DuplexStream, DuplexStream) {
        let (inbound, client) = duplex(16 * 1024);
        let (outbound, server) = duplex(16 * 1024);
        let pair = ConnectionPair {
            inbound: Box::pin(inbound),
            outbound: Box::pin(outbound),
            peer: "127.0.0.1:40000".parse().unwrap(),
            peer_verified: false,
        };
        (
            RelaySession::new(pair, Arc::clone(pool), options, shutdown),
            client,
            server,
        )
    }

    async fn read_to_end(stream: &mut DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_round_trip_fidelity() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let (session, mut client, mut server) =
            session_with(&pool, RelayOptions::default(), &shutdown);
        let handle = tokio::spawn(session.run());

        let mut upload = vec![0u8; 200 * 1024];
        let mut download = vec![0u8; 150 * 1024];
        rand::rng().fill(&mut upload[..]);
        rand::rng().fill(&mut download[..]);

        let (client_side, server_side) = tokio::join!(
            async {
                let (mut r, mut w) = tokio::io::split(&mut client);
                let writer = async {
                    w.write_all(&upload).await.unwrap();
                    w.shutdown().await.unwrap();
                };
                let mut received = Vec::new();
                let reader = r.read_to_end(&mut received);
                let (_, n) = tokio::join!(writer, reader);
                n.unwrap();
                received
            },
            async {
                let (mut r, mut w) = tokio::io::split(&mut server);
                let writer = async {
                    w.write_all(&download).await.unwrap();
                    w.shutdown().await.unwrap();
                };
                let mut received = Vec::new();
                let reader = r.read_to_end(&mut received);
                let (_, n) = tokio::join!(writer, reader);
                n.unwrap();
                received
            },
        );

        assert_eq!(server_side, upload);
        assert_eq!(client_side, download);

        let summary = timeout(Duration::from_secs(5), handle)
            .await
            .expect("session should finish")
            .unwrap();
        assert!(summary.is_clean());
        assert_eq!(summary.upstream.bytes, upload.len() as u64);
        assert_eq!(summary.downstream.bytes, download.len() as u64);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let (session, mut client, mut server) =
            session_with(&pool, RelayOptions::default(), &shutdown);
        let handle = tokio::spawn(session.run());

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // 服务端读到请求和 EOF 后仍然可以回写
        assert_eq!(read_to_end(&mut server).await, b"request");
        server.write_all(b"late response").await.unwrap();
        drop(server);

        assert_eq!(read_to_end(&mut client).await, b"late response");

        let summary = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.is_clean());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_drain_waits_for_late_response() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let file = crate::config::FileConfig::from_toml_str("drain_timeout_secs = 0").unwrap();
        let options = RelayOptions {
            idle_timeout: None,
            drain_timeout: file.timeouts().drain,
        };
        let (session, mut client, mut server) = session_with(&pool, options, &shutdown);
        let handle = tokio::spawn(session.run());

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(read_to_end(&mut server).await, b"request");
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.write_all(b"late response").await.unwrap();
        drop(server);

        assert_eq!(read_to_end(&mut client).await, b"late response");

        let summary = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.is_clean());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_smallest_blocking_pool_relays_server_greeting() {
        let pool = BufferPool::new(PoolConfig {
            capacity: crate::pool::MIN_BLOCKING_CAPACITY,
            buffer_size: 1024,
            policy: PoolPolicy::Block,
        });
        let shutdown = CancellationToken::new();
        let (session, mut client, mut server) =
            session_with(&pool, RelayOptions::default(), &shutdown);
        let handle = tokio::spawn(session.run());

        // 服务端先说话，客户端保持沉默
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"HELLO").await.unwrap();

        let mut greeting = [0u8; 5];
        timeout(Duration::from_secs(2), client.read_exact(&mut greeting))
            .await
            .expect("greeting should be relayed")
            .unwrap();
        assert_eq!(&greeting, b"HELLO");

        drop(client);
        drop(server);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_error_closes_both_sides() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let (session, mut client, server) = session_with(&pool, RelayOptions::default(), &shutdown);
        let handle = tokio::spawn(session.run());

        // 出站端消失：下行读到 EOF，上行写入失败
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = client.write_all(b"into the void").await;

        let summary = timeout(Duration::from_secs(5), handle)
            .await
            .expect("session must not wait for drain after an error")
            .unwrap();
        assert!(summary.upstream.is_failed() || summary.upstream.is_eof());
        assert_eq!(read_to_end(&mut client).await, b"");
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_cancels_stalled_direction() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let options = RelayOptions {
            idle_timeout: None,
            drain_timeout: Some(Duration::from_millis(100)),
        };
        let (session, mut client, mut server) = session_with(&pool, options, &shutdown);
        let handle = tokio::spawn(session.run());

        client.shutdown().await.unwrap();
        assert_eq!(read_to_end(&mut server).await, b"");

        // 服务端一直不关闭，会话在排空超时后结束
        let summary = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.upstream.is_eof());
        assert!(matches!(summary.downstream.end, TransferEnd::Cancelled));
        assert_eq!(pool.outstanding(), 0);
        drop(server);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let options = RelayOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            drain_timeout: Some(Duration::from_secs(30)),
        };
        let (session, _client, _server) = session_with(&pool, options, &shutdown);

        let summary = timeout(Duration::from_secs(5), session.run())
            .await
            .expect("idle session should be closed");
        let timed_out = [&summary.upstream, &summary.downstream].iter().any(|t| {
            matches!(&t.end, TransferEnd::Failed(e) if e.kind() == io::ErrorKind::TimedOut)
        });
        assert!(timed_out);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_cancels_session() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let (session, _client, _server) = session_with(&pool, RelayOptions::default(), &shutdown);
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let summary = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(summary.upstream.end, TransferEnd::Cancelled));
        assert!(matches!(summary.downstream.end, TransferEnd::Cancelled));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stats_are_recorded() {
        let pool = test_pool();
        let shutdown = CancellationToken::new();
        let stats = RelayStats::new(crate::config::Mode::Server, "127.0.0.1:6379");
        let (session, mut client, mut server) =
            session_with(&pool, RelayOptions::default(), &shutdown);
        let handle = tokio::spawn(session.with_id(7).with_stats(stats.clone()).run());

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"PONG!").await.unwrap();
        client.read_exact(&mut [0u8; 5]).await.unwrap();
        drop(client);
        drop(server);

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        let snapshot = stats.snapshot(&pool);
        assert_eq!(snapshot.bytes_upstream, 4);
        assert_eq!(snapshot.bytes_downstream, 5);
    }
}
