//! TLS: SNI-driven server certificates and upstream client configs
//!
//! Server certificates come from a [`CertificateResolver`]; any lookup or
//! load failure falls back to the configured fallback pair instead of
//! failing the handshake.

use crate::config::TlsConfig;
use crate::error::{GatewayError, Result};
use crate::provider::CertificateResolver;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio_rustls::TlsAcceptor;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring_provider::default_provider())
}

/// Build a TLS acceptor that picks certificates by SNI name
pub fn build_tls_acceptor(
    config: &TlsConfig,
    resolver: Arc<dyn CertificateResolver>,
) -> Result<TlsAcceptor> {
    let fallback = load_certified_key(Path::new(&config.cert_file), Path::new(&config.key_file))?;
    let sni = SniResolver::new(resolver, fallback);

    let mut server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Tls(format!("TLS configuration error: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(sni));
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Modification times of a certificate/key pair
type FileStamp = (Option<SystemTime>, Option<SystemTime>);

fn file_stamp(cert: &Path, key: &Path) -> FileStamp {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    (modified(cert), modified(key))
}

/// rustls adapter over a [`CertificateResolver`] with a per-pair cache
///
/// Entries are reloaded when either file's modification time changes.
pub struct SniResolver {
    resolver: Arc<dyn CertificateResolver>,
    cache: RwLock<HashMap<(PathBuf, PathBuf), (FileStamp, Arc<CertifiedKey>)>>,
    fallback: Arc<CertifiedKey>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("cached", &self.cache.read().map(|c| c.len()).unwrap_or(0))
            .finish()
    }
}

impl SniResolver {
    pub fn new(resolver: Arc<dyn CertificateResolver>, fallback: Arc<CertifiedKey>) -> Self {
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Certificate for a server name, or the fallback
    pub fn lookup(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let Some(name) = server_name else {
            return self.fallback.clone();
        };
        let (cert, key) = match self.resolver.certificate_for(name) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(server_name = name, error = %e, "Using fallback certificate");
                return self.fallback.clone();
            }
        };

        let stamp = file_stamp(&cert, &key);
        let cache_key = (cert, key);
        if let Some((cached_stamp, hit)) = self.cache.read().unwrap().get(&cache_key) {
            if *cached_stamp == stamp {
                return hit.clone();
            }
        }
        match load_certified_key(&cache_key.0, &cache_key.1) {
            Ok(loaded) => {
                tracing::debug!(server_name = name, cert = %cache_key.0.display(), "Certificate loaded");
                self.cache
                    .write()
                    .unwrap()
                    .insert(cache_key, (stamp, loaded.clone()));
                loaded
            }
            Err(e) => {
                tracing::warn!(server_name = name, error = %e, "Certificate load failed, using fallback");
                self.fallback.clone()
            }
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.lookup(client_hello.server_name()))
    }
}

/// Load a certificate chain and private key from PEM files
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        GatewayError::Tls(format!(
            "Failed to open certificate file {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("Failed to parse certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(GatewayError::Tls(
            "No certificates found in certificate file".to_string(),
        ));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        GatewayError::Tls(format!(
            "Failed to open key file {}: {}",
            key_path.display(),
            e
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| GatewayError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| GatewayError::Tls("No private key found in key file".to_string()))?;

    let signing_key = ring_provider::sign::any_supported_type(&key)
        .map_err(|e| GatewayError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Client config for dialing upstreams
///
/// With `skip_verify` the upstream certificate is accepted unchecked.
pub fn client_config(skip_verify: bool) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Tls(format!("TLS configuration error: {}", e)))?;

    let config = if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider())))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticCertificates;

    fn tls_config(cert: &str, key: &str) -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_file: cert.to_string(),
            key_file: key.to_string(),
            certificates: HashMap::new(),
        }
    }

    #[test]
    fn test_build_tls_acceptor_missing_cert() {
        let config = tls_config("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let resolver = Arc::new(StaticCertificates::default());
        match build_tls_acceptor(&config, resolver) {
            Err(e) => assert!(e.to_string().contains("certificate file")),
            Ok(_) => panic!("Expected error"),
        }
    }

    #[test]
    fn test_build_tls_acceptor_empty_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let config = tls_config(cert_path.to_str().unwrap(), key_path.to_str().unwrap());
        let resolver = Arc::new(StaticCertificates::default());
        match build_tls_acceptor(&config, resolver) {
            Err(e) => assert!(e.to_string().contains("No certificates")),
            Ok(_) => panic!("Expected error"),
        }
    }

    #[test]
    fn test_load_certified_key_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        std::fs::write(&cert_path, "not a real cert").unwrap();
        let result = load_certified_key(&cert_path, Path::new("/nonexistent/key.pem"));
        assert!(result.is_err());
    }

    fn pem(label: &str, der: &[u8]) -> String {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(der);
        let mut out = format!("-----BEGIN {}-----\n", label);
        for line in encoded.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(line).unwrap());
            out.push('\n');
        }
        out.push_str(&format!("-----END {}-----\n", label));
        out
    }

    fn ecdsa_key_pem() -> String {
        use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        pem("PRIVATE KEY", pkcs8.as_ref())
    }

    fn write_pair(dir: &Path, cert_der: &[u8], key_pem: &str) -> (PathBuf, PathBuf) {
        let cert = dir.join("site.pem");
        let key = dir.join("site.key");
        std::fs::write(&cert, pem("CERTIFICATE", cert_der)).unwrap();
        std::fs::write(&key, key_pem).unwrap();
        (cert, key)
    }

    #[test]
    fn test_sni_resolver_reloads_renewed_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let key_pem = ecdsa_key_pem();
        let (cert, key) = write_pair(dir.path(), b"first-chain", &key_pem);
        let fallback_dir = dir.path().join("fallback");
        std::fs::create_dir(&fallback_dir).unwrap();
        let fallback = write_pair(&fallback_dir, b"fallback", &key_pem);
        let fallback = load_certified_key(&fallback.0, &fallback.1).unwrap();

        let mut pairs = HashMap::new();
        pairs.insert(
            "site.example.com".to_string(),
            crate::config::CertificatePair {
                cert_file: cert.to_string_lossy().into_owned(),
                key_file: key.to_string_lossy().into_owned(),
            },
        );
        let sni = SniResolver::new(Arc::new(StaticCertificates::new(&pairs)), fallback);

        let loaded = sni.lookup(Some("site.example.com"));
        assert_eq!(loaded.cert[0].to_vec(), b"first-chain".to_vec());
        let again = sni.lookup(Some("site.example.com"));
        assert!(Arc::ptr_eq(&loaded, &again));

        write_pair(dir.path(), b"renewed-chain", &key_pem);
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&cert)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let renewed = sni.lookup(Some("site.example.com"));
        assert_eq!(renewed.cert[0].to_vec(), b"renewed-chain".to_vec());
        assert_eq!(sni.lookup(None).cert[0].to_vec(), b"fallback".to_vec());
    }

    #[test]
    fn test_client_config_variants() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }

    #[test]
    fn test_no_verifier_accepts_any_certificate() {
        let verifier = NoVerifier(provider());
        let name = ServerName::try_from("upstream.internal").unwrap();
        let result = verifier.verify_server_cert(
            &CertificateDer::from(vec![0u8; 4]),
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
