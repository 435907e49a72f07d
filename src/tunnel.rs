/// 中继引擎入口
///
/// 按配置的模式选定配对器，创建进程级缓冲区池和统计，然后运行监听循环。
use crate::config::TunnelConfig;
use crate::error::Result;
use crate::listener::{run_listener, ListenerContext};
use crate::pairer::create_pairer;
use crate::pool::BufferPool;
use crate::relay::RelayOptions;
use crate::stats::RelayStats;
use crate::stats_server::start_stats_server;
use crate::tls::ensure_crypto_provider;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 在已绑定的监听器上运行隧道，直到 `shutdown` 被取消或监听器失败
pub async fn run_tunnel(
    listener: TcpListener,
    config: TunnelConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    ensure_crypto_provider();

    let pairer = create_pairer(&config)?;
    let pool = BufferPool::new(config.buffer_pool.clone());
    let stats = RelayStats::new(config.mode, config.forward_addr.clone());

    info!(
        mode = %config.mode,
        forward = %config.forward_addr,
        "Buffer pool: {} x {} bytes ({})",
        pool.capacity(),
        pool.buffer_size(),
        pool.policy()
    );

    // 统计服务器随引擎一起停止
    let stats_shutdown = shutdown.child_token();
    if let Some(addr) = config.stats_addr.clone() {
        let stats = stats.clone();
        let pool = Arc::clone(&pool);
        let token = stats_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_stats_server(&addr, stats, pool, token).await {
                error!("Stats server error: {:#}", e);
            }
        });
    }

    let ctx = ListenerContext {
        pool: Arc::clone(&pool),
        stats,
        relay_options: RelayOptions {
            idle_timeout: config.timeouts.idle,
            drain_timeout: config.timeouts.drain,
        },
        shutdown_grace: config.timeouts.shutdown_grace,
    };

    let result = run_listener(listener, pairer, ctx, shutdown).await;

    stats_shutdown.cancel();
    pool.close();
    result
}
