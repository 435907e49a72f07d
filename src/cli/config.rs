use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::config::{expand_path, FileConfig, Mode};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {:?}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户可写时，任何人都可以替换信任的 CA
    if mode & 0o002 != 0 {
        warn!(
            "Config file {:?} is writable by others (permissions: {:o}); \
             anyone can change the trusted CA. RECOMMENDATION: chmod 644 {:?}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &Path) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    mode: Mode,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// TLS 文件缺失的提示（不存在的身份文件会在启动时生成，不算错误）
fn file_warnings(config: &FileConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let key = expand_path(&config.tls.key_path);
    let cert = expand_path(&config.tls.cert_path);
    let ca = expand_path(&config.tls.ca_path);

    if !config.tls.key_path.is_empty() && key.exists() != cert.exists() {
        warnings.push(format!(
            "Only one of {:?} and {:?} exists; both are required",
            key, cert
        ));
    }
    if !ca.exists() {
        warnings.push(format!("CA file not found: {:?}", ca));
    }
    warnings
}

/// Check configuration file format
pub fn check_config(config_path: &str, mode: Mode, format: &str) -> Result<()> {
    let path = expand_path(config_path);

    let loaded = FileConfig::load(&path.to_string_lossy())
        .and_then(|config| config.validate(mode).map(|_| config));

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    mode,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ {:#}", e);
            }
            return Err(e);
        }
    };

    let warnings = file_warnings(&config);

    if format == "json" {
        let result = CheckResult {
            valid: true,
            mode,
            warnings,
            error: None,
            details: serde_json::json!({
                "listen_addr": config.listen_socket_addr(),
                "forward_addr": config.forward_addr,
                "keepalive_period_secs": config.keepalive_period_secs,
                "key_path": config.tls.key_path,
                "cert_path": config.tls.cert_path,
                "ca_path": config.tls.ca_path,
                "require_client_auth": config.tls.require_client_auth,
                "buffer_pool": config.buffer_pool,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Checking configuration file: {}\n", config_path);
        println!("✓ Mode: {}", mode);
        println!("✓ Listen address: {}", config.listen_socket_addr());
        println!("✓ Forward address: {}", config.forward_addr);
        println!("✓ Keepalive period: {}s", config.keepalive_period_secs);
        println!("✓ Key / certificate: {} / {}", config.tls.key_path, config.tls.cert_path);
        println!("✓ CA: {}", config.tls.ca_path);
        println!(
            "✓ Buffer pool: {} x {} bytes ({})",
            config.buffer_pool.capacity, config.buffer_pool.buffer_size, config.buffer_pool.policy
        );
        for warning in &warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Configuration is valid!");
    }

    Ok(())
}
