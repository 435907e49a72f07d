/// 自定义错误类型
///
/// 按照失败的影响范围划分：监听器失败是进程级致命错误，
/// 握手/拨号失败只中止一次配对，会话内的读写错误只结束该会话。
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// 超时发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 出站 TCP 拨号
    Dial,
    /// TLS 握手
    Handshake,
    /// 会话空闲
    Idle,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Dial => write!(f, "dial"),
            Stage::Handshake => write!(f, "handshake"),
            Stage::Idle => write!(f, "idle"),
        }
    }
}

/// TLS 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 监听器不可用（致命）
    #[error("Listener failed: {0}")]
    Listener(#[source] io::Error),

    /// 出站连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS 握手失败
    #[error("TLS handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// 超时错误
    #[error("{stage} timeout after {duration:?}")]
    Timeout { stage: Stage, duration: Duration },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS 配置错误
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// 资源耗尽
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建握手失败错误
    pub fn handshake_failed(peer: impl ToString, source: io::Error) -> Self {
        Self::Handshake {
            peer: peer.to_string(),
            source,
        }
    }

    /// 创建超时错误
    pub fn timeout(stage: Stage, duration: Duration) -> Self {
        Self::Timeout { stage, duration }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 是否只影响单次配对（握手、拨号或其超时）
    pub fn is_pairing_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::Handshake { .. }
                | Self::Timeout {
                    stage: Stage::Dial | Stage::Handshake,
                    ..
                }
        )
    }

    /// 是否为终止整个中继引擎的错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Listener(_) | Self::ConfigError(_))
    }

    /// 握手阶段失败的统计分类
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::Handshake { .. }
                | Self::Timeout {
                    stage: Stage::Handshake,
                    ..
                }
        )
    }
}

/// 日志中使用的对端描述
pub fn peer_label(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
