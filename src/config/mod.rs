// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use crate::pool::PoolConfig;
use crate::tls::{self, TlsSettings};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 接受 TLS 连接，明文转发到本地服务
    Server,
    /// 接受明文连接，通过 TLS 转发到远端隧道
    Client,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            _ => anyhow::bail!("Unknown mode: {}", s),
        }
    }
}

/// TLS 文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFileConfig {
    /// 本端私钥路径（留空表示不使用本端身份，仅客户端模式可用）
    #[serde(default = "default_key_path")]
    pub key_path: String,
    /// 本端证书路径
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    /// 用于验证对端的 CA（或直接是对端证书）
    #[serde(default = "default_ca_path")]
    pub ca_path: String,
    /// 服务端模式是否要求并验证客户端证书
    #[serde(default = "default_true")]
    pub require_client_auth: bool,
}

fn default_key_path() -> String {
    "pk.pem".to_string()
}

fn default_cert_path() -> String {
    "cert.pem".to_string()
}

fn default_ca_path() -> String {
    "cert.pem".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TlsFileConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            cert_path: default_cert_path(),
            ca_path: default_ca_path(),
            require_client_auth: true,
        }
    }
}

/// 配置文件（TOML）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// 监听地址（":6380" 表示所有地址）
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 转发目标地址（host:port）
    #[serde(default = "default_forward_addr")]
    pub forward_addr: String,
    /// TLS 主机名（为空时自动检测）
    #[serde(default)]
    pub hostname: Option<String>,
    /// 客户端模式握手使用的服务器名称（默认取 forward_addr 的主机部分）
    #[serde(default)]
    pub server_name: Option<String>,
    /// TCP keepalive 周期（秒，0 表示关闭）
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_period_secs: u64,
    /// TLS 握手超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// 出站拨号超时（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// 会话空闲超时（秒，0 表示关闭）
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// 一个方向结束后另一个方向最多继续的时间（秒，0 表示不限制）
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// 停止时等待活动会话结束的时间（秒）
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// 统计信息 HTTP 服务器地址（可选）
    #[serde(default)]
    pub stats_addr: Option<String>,
    #[serde(default)]
    pub tls: TlsFileConfig,
    #[serde(default)]
    pub buffer_pool: PoolConfig,
}

fn default_listen_addr() -> String {
    ":6380".to_string()
}

fn default_forward_addr() -> String {
    "localhost:6379".to_string()
}

fn default_keepalive_secs() -> u64 {
    120
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            forward_addr: default_forward_addr(),
            hostname: None,
            server_name: None,
            keepalive_period_secs: default_keepalive_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            idle_timeout_secs: 0,
            drain_timeout_secs: default_drain_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stats_addr: None,
            tls: TlsFileConfig::default(),
            buffer_pool: PoolConfig::default(),
        }
    }
}

impl FileConfig {
    /// 从 TOML 文件加载
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// 验证配置
    pub fn validate(&self, mode: Mode) -> anyhow::Result<()> {
        ConfigValidator::validate_file_config(self, mode)
    }

    /// 监听地址（补全省略的主机部分）
    pub fn listen_socket_addr(&self) -> String {
        normalize_listen_addr(&self.listen_addr)
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_period_secs)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            handshake: Duration::from_secs(self.handshake_timeout_secs),
            dial: Duration::from_secs(self.dial_timeout_secs),
            idle: secs_or_off(self.idle_timeout_secs),
            drain: secs_or_off(self.drain_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

/// 0 秒表示关闭
fn secs_or_off(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// ":6380" → "0.0.0.0:6380"
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// 取 host:port 中的主机部分（支持 "[::1]:443"）
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

/// 展开 ~ 并返回路径
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// 超时设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TLS 握手
    pub handshake: Duration,
    /// 出站 TCP 拨号
    pub dial: Duration,
    /// 会话空闲（两个方向都没有数据），None 表示依赖 TCP keepalive
    pub idle: Option<Duration>,
    /// 一个方向正常结束后，另一个方向的最长排空时间，None 表示一直等到它结束
    pub drain: Option<Duration>,
    /// 停止时等待活动会话的时间
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        FileConfig::default().timeouts()
    }
}

/// 隧道运行时配置
///
/// 构造后在进程生命周期内不可变，由监听循环持有并只读共享给所有会话。
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub mode: Mode,
    /// 转发目标地址（host:port）
    pub forward_addr: String,
    /// 客户端模式握手使用的服务器名称
    pub server_name: Option<String>,
    /// TCP keepalive 周期，0 表示关闭
    pub keepalive_period: Duration,
    pub timeouts: Timeouts,
    pub buffer_pool: PoolConfig,
    pub tls: TlsSettings,
    /// 统计信息 HTTP 服务器地址
    pub stats_addr: Option<String>,
}

impl TunnelConfig {
    /// 使用默认超时和缓冲区池设置创建配置
    pub fn new(mode: Mode, forward_addr: impl Into<String>, tls: TlsSettings) -> Self {
        let defaults = FileConfig::default();
        Self {
            mode,
            forward_addr: forward_addr.into(),
            server_name: None,
            keepalive_period: defaults.keepalive_period(),
            timeouts: defaults.timeouts(),
            buffer_pool: defaults.buffer_pool,
            tls,
            stats_addr: None,
        }
    }

    /// 客户端模式握手时使用的服务器名称
    pub fn effective_server_name(&self) -> &str {
        self.server_name
            .as_deref()
            .unwrap_or_else(|| host_of(&self.forward_addr))
    }

    /// 从文件配置构造，加载 TLS 材料
    pub fn from_file_config(mode: Mode, file: &FileConfig) -> anyhow::Result<Self> {
        file.validate(mode)?;

        let hostname = tls::detect_hostname(file.hostname.as_deref());
        debug!("Mode: {}", mode);
        debug!("Hostname: {}", hostname);
        debug!("Forwarding to: {}", file.forward_addr);
        debug!("TCP KeepAlive Period: {:?}", file.keepalive_period());

        let identity = if file.tls.key_path.is_empty() || file.tls.cert_path.is_empty() {
            None
        } else {
            Some(
                tls::load_or_generate_identity(
                    &hostname,
                    &expand_path(&file.tls.key_path),
                    &expand_path(&file.tls.cert_path),
                )
                .context("Unable to load keypair")?,
            )
        };

        let roots = tls::load_root_store(&expand_path(&file.tls.ca_path))
            .context("Unable to load ca certificate")?;

        // 只有服务端模式验证客户端证书
        let require_client_auth = mode == Mode::Server && file.tls.require_client_auth;

        Ok(Self {
            mode,
            forward_addr: file.forward_addr.clone(),
            server_name: file.server_name.clone(),
            keepalive_period: file.keepalive_period(),
            timeouts: file.timeouts(),
            buffer_pool: file.buffer_pool.clone(),
            tls: TlsSettings::new(identity, roots, require_client_auth),
            stats_addr: file.stats_addr.clone(),
        })
    }
}
