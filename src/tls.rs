use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// 安装进程默认的加密实现（重复安装会被忽略）
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// 本端身份：证书链和私钥
#[derive(Debug)]
pub struct Identity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl Identity {
    /// 在内存中生成自签名身份
    pub fn self_signed(names: &[String]) -> Result<Self> {
        let certified = generate_simple_self_signed(names.to_vec())
            .context("Failed to generate self-signed certificate")?;
        Ok(Self {
            certs: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                certified.signing_key.serialize_der(),
            )),
        })
    }

    /// 只信任本身份证书的根存储
    pub fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in &self.certs {
            roots
                .add(cert.clone())
                .context("Failed to add certificate to root store")?;
        }
        Ok(roots)
    }
}

/// 已加载到内存中的 TLS 材料
///
/// 由启动代码构造，中继引擎只读使用。
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// 本端证书和私钥（服务端模式必需，客户端模式用于客户端证书认证）
    pub identity: Option<Identity>,
    /// 用于验证对端证书的受信根
    pub roots: Arc<RootCertStore>,
    /// 服务端模式是否要求并验证客户端证书
    pub require_client_auth: bool,
}

impl TlsSettings {
    pub fn new(
        identity: Option<Identity>,
        roots: RootCertStore,
        require_client_auth: bool,
    ) -> Self {
        Self {
            identity,
            roots: Arc::new(roots),
            require_client_auth,
        }
    }
}

/// 从 PEM 文件加载证书链
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}

/// 从 PEM 文件加载私钥
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}

/// 从 PEM 文件加载受信根（可以是 CA，也可以直接是对端证书）
pub fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    for cert in load_certs(path)? {
        root_store
            .add(cert)
            .context("Failed to add CA certificate")?;
    }

    Ok(root_store)
}

/// 加载本端身份；证书和私钥都不存在时为主机名生成自签名身份并写入这两个路径
pub fn load_or_generate_identity(
    hostname: &str,
    key_path: &Path,
    cert_path: &Path,
) -> Result<Identity> {
    match (key_path.exists(), cert_path.exists()) {
        (true, true) => {
            debug!("Loading key pair from {:?} and {:?}", key_path, cert_path);
        }
        (false, false) => {
            generate_self_signed_cert(hostname, &[hostname.to_string()], cert_path, key_path)?;
            info!(
                "Generated self-signed certificate for {} at {:?} (key at {:?})",
                hostname, cert_path, key_path
            );
        }
        (key_exists, _) => anyhow::bail!(
            "Only the {} exists; provide both {:?} and {:?}, or neither to auto-generate",
            if key_exists { "private key" } else { "certificate" },
            key_path,
            cert_path
        ),
    }

    Ok(Identity {
        certs: load_certs(cert_path)?,
        key: load_private_key(key_path)?,
    })
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}

/// 确定 TLS 使用的主机名：显式配置 > 操作系统主机名 > localhost
pub fn detect_hostname(explicit: Option<&str>) -> String {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// 构造服务端 TLS 配置
///
/// `require_client_auth` 为 true 时对端必须出示由受信根签发的证书（双向 TLS）。
pub fn build_server_config(settings: &TlsSettings) -> Result<Arc<rustls::ServerConfig>> {
    ensure_crypto_provider();

    let identity = settings
        .identity
        .clone()
        .context("Server mode requires a certificate and private key")?;

    let builder = rustls::ServerConfig::builder();
    let config = if settings.require_client_auth {
        let verifier = WebPkiClientVerifier::builder(Arc::clone(&settings.roots))
            .build()
            .context("Failed to build client certificate verifier")?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certs, identity.key)
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(identity.certs, identity.key)
    }
    .context("Failed to create server config")?;

    Ok(Arc::new(config))
}

/// 构造客户端 TLS 配置
///
/// 只信任配置的根证书；配置了本端身份时作为客户端证书出示。
pub fn build_client_config(settings: &TlsSettings) -> Result<Arc<rustls::ClientConfig>> {
    ensure_crypto_provider();

    let builder =
        rustls::ClientConfig::builder().with_root_certificates(Arc::clone(&settings.roots));

    let config = match settings.identity.clone() {
        Some(identity) => builder
            .with_client_auth_cert(identity.certs, identity.key)
            .context("Failed to configure client certificate")?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}
