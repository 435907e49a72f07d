use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::{expand_path, FileConfig, Mode};

#[derive(Parser, Debug)]
#[command(name = "tlsproxy")]
#[command(author, version, about = "Transparent mutual-TLS tunnel", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，设置 RUST_LOG 时以其为准
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 服务端模式：接受 mTLS 连接，明文转发到本地服务
    Server(RunArgs),
    /// 客户端模式：接受明文连接，通过 mTLS 转发到远端隧道
    Client(RunArgs),
    /// 生成自签名证书和私钥
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "pk.pem")]
        key_out: String,

        /// 证书的 Common Name（默认使用本机主机名）
        #[arg(long)]
        common_name: Option<String>,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
    /// 检查配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 按哪种模式验证
        #[arg(short, long, default_value = "server")]
        mode: Mode,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
}

/// server / client 共用的参数，命令行参数覆盖配置文件中的值
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    pub config: Option<String>,

    /// 监听地址，例如 ":6380"
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// 转发地址，例如 "localhost:6379"
    #[arg(long)]
    pub forward_addr: Option<String>,

    /// TLS 主机名（默认自动检测）
    #[arg(long)]
    pub hostname: Option<String>,

    /// TCP keepalive 周期，例如 "120s"、"2m"，0 表示关闭
    #[arg(long, value_parser = parse_duration_secs)]
    pub keepalive_period: Option<u64>,

    /// 私钥文件
    #[arg(long)]
    pub pkfile: Option<String>,

    /// 证书文件
    #[arg(long)]
    pub certfile: Option<String>,

    /// 用于验证对端的 CA 文件
    #[arg(long)]
    pub cafile: Option<String>,

    /// 统计信息 HTTP 服务器地址
    #[arg(long)]
    pub stats_addr: Option<String>,
}

impl RunArgs {
    /// 加载配置文件（未指定时使用默认值）并应用命令行覆盖
    pub fn load_file_config(&self) -> Result<FileConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(&expand_path(path).to_string_lossy())?,
            None => FileConfig::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut FileConfig) {
        if let Some(ref v) = self.listen_addr {
            config.listen_addr = v.clone();
        }
        if let Some(ref v) = self.forward_addr {
            config.forward_addr = v.clone();
        }
        if let Some(ref v) = self.hostname {
            config.hostname = Some(v.clone());
        }
        if let Some(v) = self.keepalive_period {
            config.keepalive_period_secs = v;
        }
        if let Some(ref v) = self.pkfile {
            config.tls.key_path = v.clone();
        }
        if let Some(ref v) = self.certfile {
            config.tls.cert_path = v.clone();
        }
        if let Some(ref v) = self.cafile {
            config.tls.ca_path = v.clone();
        }
        if let Some(ref v) = self.stats_addr {
            config.stats_addr = Some(v.clone());
        }
    }
}

/// 解析 "120"、"120s"、"2m"、"1h" 形式的时长，返回秒数
pub fn parse_duration_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 3600),
        _ => (s, 1),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid duration '{}'", s))
}
