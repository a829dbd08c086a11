//! TLS listener support: multi-certificate resolution across the host
//! blocks sharing one listener, with optional auto-cert key-pairs served
//! from an on-disk cache directory.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{FasthttpdError, FasthttpdResult};

/// ALPN identifier used by ACME TLS-ALPN-01 responders.
const ACME_ALPN: &[u8] = b"acme-tls/1";

/// Builds one rustls server configuration for a listener bundle, or None
/// when no block carries SSL configuration.
pub fn multi_tls_config(cfgs: &[Config]) -> FasthttpdResult<Option<Arc<ServerConfig>>> {
    let mut by_host: HashMap<String, Arc<CertifiedKey>> = HashMap::new();
    let mut ordered: Vec<Arc<CertifiedKey>> = Vec::new();
    let mut acme_alpn = false;

    for cfg in cfgs {
        if cfg.ssl.auto_cert {
            if cfg.host.contains('*') {
                return Err(FasthttpdError::tls("wildcard is not supported"));
            }
            info!(cache_dir = %cfg.ssl.auto_cert_cache_dir, host = %cfg.host, "autoCert enabled");
            std::fs::create_dir_all(&cfg.ssl.auto_cert_cache_dir)?;
            if let Some(key) = load_cached_key_pair(&cfg.ssl.auto_cert_cache_dir, &cfg.host)? {
                let key = Arc::new(key);
                by_host.insert(cfg.host.to_ascii_lowercase(), Arc::clone(&key));
                ordered.push(key);
            }
            acme_alpn = true;
            continue;
        }
        if !cfg.ssl.cert_file.is_empty() && !cfg.ssl.key_file.is_empty() {
            let key = Arc::new(load_key_pair(&cfg.ssl.cert_file, &cfg.ssl.key_file)?);
            if !cfg.host.is_empty() {
                by_host.insert(cfg.host.to_ascii_lowercase(), Arc::clone(&key));
            }
            ordered.push(key);
        }
    }

    if ordered.is_empty() && !acme_alpn {
        return Ok(None);
    }
    if ordered.is_empty() {
        return Err(FasthttpdError::tls("no certificates configured"));
    }

    let resolver = MultiCertResolver { by_host, ordered };
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols.push(b"http/1.1".to_vec());
    if acme_alpn {
        config.alpn_protocols.push(ACME_ALPN.to_vec());
    }
    Ok(Some(Arc::new(config)))
}

/// Picks the certificate whose configured host matches the SNI name,
/// falling back to the first loaded certificate.
struct MultiCertResolver {
    by_host: HashMap<String, Arc<CertifiedKey>>,
    ordered: Vec<Arc<CertifiedKey>>,
}

impl ResolvesServerCert for MultiCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            if let Some(key) = self.by_host.get(&name.to_ascii_lowercase()) {
                debug!(sni = name, "resolved certificate by host");
                return Some(Arc::clone(key));
            }
        }
        self.ordered.first().cloned()
    }
}

/// Loads a PEM certificate chain and private key pair.
fn load_key_pair(cert_file: &str, key_file: &str) -> FasthttpdResult<CertifiedKey> {
    let certs = read_certs(Path::new(cert_file))?;
    if certs.is_empty() {
        return Err(FasthttpdError::tls(format!(
            "no certificates found in {}",
            cert_file
        )));
    }
    let key = read_private_key(Path::new(key_file))?.ok_or_else(|| {
        FasthttpdError::tls(format!("no private key found in {}", key_file))
    })?;
    certified(certs, key)
}

/// Loads `<host>.pem` (combined certificate chain + key) from the
/// auto-cert cache directory, if present.
fn load_cached_key_pair(cache_dir: &str, host: &str) -> FasthttpdResult<Option<CertifiedKey>> {
    let path = Path::new(cache_dir).join(format!("{}.pem", host));
    if !path.exists() {
        return Ok(None);
    }
    let certs = read_certs(&path)?;
    let key = read_private_key(&path)?;
    match (certs.is_empty(), key) {
        (false, Some(key)) => Ok(Some(certified(certs, key)?)),
        _ => Err(FasthttpdError::tls(format!(
            "incomplete cached key pair: {}",
            path.display()
        ))),
    }
}

fn certified(certs: Vec<Certificate>, key: PrivateKey) -> FasthttpdResult<CertifiedKey> {
    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| FasthttpdError::tls(format!("unsupported private key: {}", e)))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

fn read_certs(path: &Path) -> FasthttpdResult<Vec<Certificate>> {
    let file = std::fs::File::open(path)
        .map_err(|e| FasthttpdError::tls(format!("failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| FasthttpdError::tls(format!("failed to parse {}: {}", path.display(), e)))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_private_key(path: &Path) -> FasthttpdResult<Option<PrivateKey>> {
    let file = std::fs::File::open(path)
        .map_err(|e| FasthttpdError::tls(format!("failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| FasthttpdError::tls(format!("failed to parse {}: {}", path.display(), e)))?
        {
            Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(Some(PrivateKey(key))),
            Some(_) => continue,
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{unmarshal_yaml, Ssl};

    #[test]
    fn test_no_ssl_configuration_yields_none() {
        let cfgs = unmarshal_yaml("listen: ':8080'").unwrap();
        assert!(multi_tls_config(&cfgs).unwrap().is_none());
    }

    #[test]
    fn test_wildcard_host_under_autocert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfgs = unmarshal_yaml("host: '*.example.com'").unwrap();
        cfgs[0].ssl = Ssl {
            auto_cert: true,
            auto_cert_cache_dir: dir.path().to_string_lossy().into_owned(),
            ..Ssl::default()
        };
        let err = multi_tls_config(&cfgs).unwrap_err();
        assert_eq!(err.to_string(), "TLS error: wildcard is not supported");
    }

    #[test]
    fn test_missing_cert_file_is_tls_error() {
        let mut cfgs = unmarshal_yaml("host: example.com").unwrap();
        cfgs[0].ssl = Ssl {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
            ..Ssl::default()
        };
        let err = multi_tls_config(&cfgs).unwrap_err();
        assert!(matches!(err, FasthttpdError::Tls { .. }));
    }

    #[test]
    fn test_autocert_with_empty_cache_requires_nothing_but_errors_without_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfgs = unmarshal_yaml("host: example.com").unwrap();
        cfgs[0].ssl = Ssl {
            auto_cert: true,
            auto_cert_cache_dir: dir.path().to_string_lossy().into_owned(),
            ..Ssl::default()
        };
        // The cache holds no key pair yet: configuration is accepted as
        // "TLS requested" but there is nothing to serve.
        let err = multi_tls_config(&cfgs).unwrap_err();
        assert_eq!(err.to_string(), "TLS error: no certificates configured");
    }
}
