use anyhow::Result;
use std::path::Path;

use crate::tls;

/// Generate self-signed TLS certificate
///
/// Without a common name the local hostname is used, matching the identity
/// `server`/`client` would generate on first start.
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: Option<&str>,
    alt_names: &[String],
) -> Result<()> {
    let common_name = tls::detect_hostname(common_name);

    tls::generate_self_signed_cert(
        &common_name,
        alt_names,
        Path::new(cert_out),
        Path::new(key_out),
    )?;

    println!("Generated self-signed certificate for {}: {}", common_name, cert_out);
    println!("Generated private key: {}", key_out);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_certificate_files() {
        let dir = std::env::temp_dir().join(format!("tlsproxy-cli-cert-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("pk.pem");

        generate_certificate(
            cert.to_str().unwrap(),
            key.to_str().unwrap(),
            Some("tunnel.local"),
            &["127.0.0.1".to_string()],
        )
        .unwrap();

        assert_eq!(tls::load_certs(&cert).unwrap().len(), 1);
        assert!(tls::load_private_key(&key).is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
