use anyhow::{bail, Result};
use tokio::sync::Semaphore;
use tracing::warn;

use super::{FileConfig, Mode};
use crate::pool::{PoolConfig, PoolPolicy, MIN_BLOCKING_CAPACITY};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证 host:port 形式的地址（host 可以省略，如 ":6380"）
    pub fn validate_socket_addr(addr: &str, context: &str, require_host: bool) -> Result<()> {
        Self::validate_address(addr, context)?;

        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("{}: '{}' is missing a port", context, addr);
        };

        if require_host && host.trim_matches(|c| c == '[' || c == ']').is_empty() {
            bail!("{}: '{}' is missing a host", context, addr);
        }

        match port.parse::<u16>() {
            Ok(0) | Err(_) => bail!("{}: invalid port in '{}'", context, addr),
            Ok(_) => Ok(()),
        }
    }

    /// 验证缓冲区池配置
    pub fn validate_pool_config(config: &PoolConfig) -> Result<()> {
        if config.buffer_size == 0 {
            bail!("buffer_pool.buffer_size must be greater than 0");
        }
        if config.capacity == 0 {
            bail!("buffer_pool.capacity must be greater than 0");
        }
        if config.policy == PoolPolicy::Block && config.capacity < MIN_BLOCKING_CAPACITY {
            bail!(
                "buffer_pool.capacity must be at least {} with the block policy",
                MIN_BLOCKING_CAPACITY
            );
        }
        if config.capacity > Semaphore::MAX_PERMITS {
            bail!(
                "buffer_pool.capacity must not exceed {}",
                Semaphore::MAX_PERMITS
            );
        }
        Ok(())
    }

    /// 验证完整的文件配置
    pub fn validate_file_config(config: &FileConfig, mode: Mode) -> Result<()> {
        Self::validate_socket_addr(&config.listen_addr, "listen_addr", false)?;
        Self::validate_socket_addr(&config.forward_addr, "forward_addr", true)?;

        if let Some(ref addr) = config.stats_addr {
            Self::validate_socket_addr(addr, "stats_addr", false)?;
        }

        if config.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be greater than 0");
        }
        if config.dial_timeout_secs == 0 {
            bail!("dial_timeout_secs must be greater than 0");
        }

        Self::validate_pool_config(&config.buffer_pool)?;

        if config.tls.ca_path.trim().is_empty() {
            bail!("tls.ca_path cannot be empty: the remote end must be verified");
        }

        let has_identity = !config.tls.key_path.trim().is_empty()
            && !config.tls.cert_path.trim().is_empty();
        match mode {
            Mode::Server if !has_identity => {
                bail!("Server mode requires tls.key_path and tls.cert_path")
            }
            Mode::Server if !config.tls.require_client_auth => {
                warn!(
                    "Client certificate verification is disabled; any TLS client will be relayed"
                );
            }
            Mode::Client if !has_identity => {
                warn!("No client certificate configured; the remote end may reject the handshake");
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_socket_addr() {
        assert!(ConfigValidator::validate_socket_addr(":6380", "listen", false).is_ok());
        assert!(ConfigValidator::validate_socket_addr("[::1]:6380", "forward", true).is_ok());
        assert!(ConfigValidator::validate_socket_addr("localhost", "forward", true).is_err());
        assert!(ConfigValidator::validate_socket_addr(":6379", "forward", true).is_err());
        assert!(ConfigValidator::validate_socket_addr("host:0", "forward", true).is_err());
        assert!(ConfigValidator::validate_socket_addr("host:http", "forward", true).is_err());
        assert!(ConfigValidator::validate_socket_addr("  ", "forward", true).is_err());
    }

    #[test]
    fn test_validate_pool_config() {
        let mut config = PoolConfig::default();
        assert!(ConfigValidator::validate_pool_config(&config).is_ok());

        config.buffer_size = 0;
        assert!(ConfigValidator::validate_pool_config(&config).is_err());

        config.buffer_size = 1024;
        config.capacity = 0;
        assert!(ConfigValidator::validate_pool_config(&config).is_err());
    }

    #[test]
    fn test_block_pool_needs_a_buffer_per_direction() {
        let mut config = PoolConfig {
            capacity: 1,
            buffer_size: 1024,
            policy: PoolPolicy::Block,
        };
        let err = ConfigValidator::validate_pool_config(&config).unwrap_err();
        assert!(err.to_string().contains("at least 2"));

        config.capacity = 2;
        assert!(ConfigValidator::validate_pool_config(&config).is_ok());

        config.capacity = 1;
        config.policy = PoolPolicy::Overflow;
        assert!(ConfigValidator::validate_pool_config(&config).is_ok());
    }

    #[test]
    fn test_server_mode_requires_identity() {
        let mut config = FileConfig::default();
        config.tls.key_path = String::new();

        assert!(ConfigValidator::validate_file_config(&config, Mode::Server).is_err());
        assert!(ConfigValidator::validate_file_config(&config, Mode::Client).is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = FileConfig::default();
        config.handshake_timeout_secs = 0;
        assert!(ConfigValidator::validate_file_config(&config, Mode::Server).is_err());

        let mut config = FileConfig::default();
        config.dial_timeout_secs = 0;
        assert!(ConfigValidator::validate_file_config(&config, Mode::Client).is_err());
    }

    #[test]
    fn test_empty_ca_rejected() {
        let mut config = FileConfig::default();
        config.tls.ca_path = String::new();
        let err = ConfigValidator::validate_file_config(&config, Mode::Client).unwrap_err();
        assert!(err.to_string().contains("ca_path"));
    }
}
