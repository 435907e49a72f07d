/// 透明双向 TLS 隧道库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod listener;
pub mod pairer;
pub mod pool;
pub mod relay;
pub mod server;
pub mod stats;
pub mod stats_server;
pub mod tls;
pub mod tunnel;

// 重新导出常用类型
pub use client::run_client;
pub use config::{FileConfig, Mode, Timeouts, TunnelConfig};
pub use error::{Result, TunnelError};
pub use pairer::{ConnectionPair, Pairer};
pub use pool::{BufferPool, PoolConfig, PoolPolicy, PooledBuffer};
pub use relay::{RelayOptions, RelaySession, SessionSummary};
pub use server::run_server;
pub use tls::TlsSettings;
pub use tunnel::run_tunnel;
