//! TLS certificate provisioning
//!
//! Certificates come from a [`CertificateProvider`]. The bundled
//! implementation, [`CertCache`], loads PEM material from disk once at
//! startup and falls back to self-signed certificates generated on demand
//! for names it has nothing for. A single provider instance is shared by
//! every TLS listener through [`server_config`].

use crate::error::CertError;
use dashmap::DashMap;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upper bound on memoised self-signed certificates
const MAX_GENERATED: usize = 1024;

/// Name served once the self-signed memo is full
const FALLBACK_NAME: &str = "localhost";

/// Source of server certificates, looked up by SNI name during the handshake
pub trait CertificateProvider: Send + Sync + std::fmt::Debug {
    fn get_certificate(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;
}

/// Adapts a [`CertificateProvider`] to rustls
#[derive(Debug)]
pub struct ProviderResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl ProviderResolver {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self { provider }
    }
}

impl ResolvesServerCert for ProviderResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let key = self.provider.get_certificate(client_hello.server_name());
        if key.is_none() {
            warn!(sni = ?client_hello.server_name(), "No certificate available for handshake");
        }
        key
    }
}

/// Build the rustls server configuration used by every TLS listener.
pub fn server_config(provider: Arc<dyn CertificateProvider>) -> Result<Arc<rustls::ServerConfig>, CertError> {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ProviderResolver::new(provider)));

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Certificates loaded from a directory or bundle, plus memoised self-signed fallbacks
pub struct CertCache {
    source: Option<PathBuf>,
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Keyed by the parent domain of a `*.` SAN
    wildcard: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
    generated: DashMap<String, Arc<CertifiedKey>>,
    generated_limit: usize,
}

impl std::fmt::Debug for CertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache")
            .field("source", &self.source)
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field("wildcard", &self.wildcard.keys().collect::<Vec<_>>())
            .field("generated", &self.generated.len())
            .finish()
    }
}

impl CertCache {
    /// A cache with no backing storage; every name gets a self-signed certificate.
    pub fn self_signed_only() -> Self {
        Self {
            source: None,
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            default: None,
            generated: DashMap::new(),
            generated_limit: MAX_GENERATED,
        }
    }

    /// Load certificates from `path`.
    ///
    /// A missing path is created as an empty directory. A directory is
    /// scanned for `*.pem` bundles and `<name>.crt`/`<name>.key` pairs; a
    /// regular file is read as a single bundle.
    pub fn initialize(path: impl AsRef<Path>) -> Result<Self, CertError> {
        let path = path.as_ref();
        let mut cache = Self::self_signed_only();
        cache.source = Some(path.to_path_buf());

        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| CertError::CachePath {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            info!(path = %path.display(), "Created empty certificate cache");
            return Ok(cache);
        }

        if path.is_file() {
            cache.load_bundle(path)?;
        } else if path.is_dir() {
            let mut files = std::fs::read_dir(path)
                .map_err(|e| CertError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect::<Vec<_>>();
            files.sort();

            for file in files {
                match file.extension().and_then(|e| e.to_str()) {
                    Some("pem") => cache.load_bundle(&file)?,
                    Some("crt") => {
                        let key = file.with_extension("key");
                        if !key.is_file() {
                            return Err(CertError::MissingKey { path: file });
                        }
                        cache.load_pair(&file, &key)?;
                    }
                    _ => {}
                }
            }
        } else {
            return Err(CertError::CachePath {
                path: path.to_path_buf(),
                reason: "not a file or directory".to_string(),
            });
        }

        info!(
            path = %path.display(),
            names = cache.exact.len(),
            wildcards = cache.wildcard.len(),
            "Certificate cache loaded"
        );
        Ok(cache)
    }

    /// Register a certificate for the given names. The first certificate
    /// registered becomes the default for handshakes without SNI.
    pub fn insert(&mut self, names: &[String], key: Arc<CertifiedKey>) {
        for name in names {
            let name = name.to_ascii_lowercase();
            match name.strip_prefix("*.") {
                Some(parent) => {
                    self.wildcard.entry(parent.to_string()).or_insert_with(|| Arc::clone(&key));
                }
                None => {
                    self.exact.entry(name).or_insert_with(|| Arc::clone(&key));
                }
            }
        }
        if self.default.is_none() {
            self.default = Some(key);
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.exact.get(name) {
            return Some(Arc::clone(key));
        }
        let (_, parent) = name.split_once('.')?;
        self.wildcard.get(parent).cloned()
    }

    /// Memoised self-signed certificate for `name`.
    ///
    /// SNI is client controlled, so only the first `generated_limit` names get their
    /// own certificate. Past that, unknown names get the default certificate
    /// or the one generated for [`FALLBACK_NAME`].
    fn generated_for(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.generated.get(name) {
            return Some(Arc::clone(key.value()));
        }

        if name != FALLBACK_NAME && self.generated.len() >= self.generated_limit {
            debug!(name, limit = self.generated_limit, "Self-signed certificate limit reached");
            return self.default.clone().or_else(|| self.generated_for(FALLBACK_NAME));
        }

        match self_signed(name) {
            Ok(key) => {
                debug!(name, "Generated self-signed certificate");
                let entry = self.generated.entry(name.to_string()).or_insert(key);
                Some(Arc::clone(entry.value()))
            }
            Err(e) => {
                error!(error = %e, "Failed to generate fallback certificate");
                None
            }
        }
    }

    fn load_bundle(&mut self, path: &Path) -> Result<(), CertError> {
        let (certs, key) = read_pem(path)?;
        let key = key.ok_or_else(|| CertError::MissingKey {
            path: path.to_path_buf(),
        })?;
        self.add(path, certs, key)
    }

    fn load_pair(&mut self, cert_path: &Path, key_path: &Path) -> Result<(), CertError> {
        let (certs, _) = read_pem(cert_path)?;
        let (_, key) = read_pem(key_path)?;
        let key = key.ok_or_else(|| CertError::MissingKey {
            path: cert_path.to_path_buf(),
        })?;
        self.add(cert_path, certs, key)
    }

    fn add(
        &mut self,
        path: &Path,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<(), CertError> {
        let leaf = certs.first().ok_or_else(|| CertError::NoCertificate {
            path: path.to_path_buf(),
        })?;

        let (names, not_after) = certificate_names(leaf).map_err(|message| CertError::X509 {
            path: path.to_path_buf(),
            message,
        })?;

        if not_after < unix_now() {
            warn!(path = %path.display(), names = ?names, "Skipping expired certificate");
            return Ok(());
        }

        let signing_key = ring::sign::any_supported_type(&key).map_err(|e| CertError::Key {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if names.is_empty() {
            warn!(path = %path.display(), "Certificate carries no DNS names");
        }
        debug!(path = %path.display(), names = ?names, "Loaded certificate");

        self.insert(&names, Arc::new(CertifiedKey::new(certs, signing_key)));
        Ok(())
    }
}

impl CertificateProvider for CertCache {
    fn get_certificate(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        match server_name {
            Some(name) => {
                let name = name.trim_end_matches('.').to_ascii_lowercase();
                self.lookup(&name).or_else(|| self.generated_for(&name))
            }
            None => self.default.clone().or_else(|| self.generated_for(FALLBACK_NAME)),
        }
    }
}

fn read_pem(path: &Path) -> Result<(Vec<CertificateDer<'static>>, Option<PrivateKeyDer<'static>>), CertError> {
    let data = std::fs::read(path).map_err(|e| CertError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut certs = Vec::new();
    let mut key = None;
    for item in rustls_pemfile::read_all(&mut BufReader::new(&data[..])) {
        let item = item.map_err(|e| CertError::Pem {
            path: path.to_path_buf(),
            source: e,
        })?;
        match item {
            rustls_pemfile::Item::X509Certificate(cert) => certs.push(cert),
            rustls_pemfile::Item::Pkcs1Key(k) if key.is_none() => key = Some(k.into()),
            rustls_pemfile::Item::Pkcs8Key(k) if key.is_none() => key = Some(k.into()),
            rustls_pemfile::Item::Sec1Key(k) if key.is_none() => key = Some(k.into()),
            _ => {}
        }
    }

    Ok((certs, key))
}

/// DNS names and expiry (unix seconds) of a certificate.
///
/// Falls back to the subject common name when there are no DNS SANs.
fn certificate_names(cert: &CertificateDer<'_>) -> Result<(Vec<String>, i64), String> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).map_err(|e| e.to_string())?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    if names.is_empty() {
        for cn in parsed.subject().iter_common_name() {
            if let Ok(cn) = cn.as_str() {
                names.push(cn.to_ascii_lowercase());
            }
        }
    }

    Ok((names, parsed.validity().not_after.timestamp()))
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn self_signed(name: &str) -> Result<Arc<CertifiedKey>, CertError> {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .map_err(|e| CertError::Generate {
            name: name.to_string(),
            message: e.to_string(),
        })?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| CertError::Generate {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    let signing_key = ring::sign::any_supported_type(&key_der)?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path, file: &str, names: &[&str]) -> Vec<u8> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
        let pem = format!("{}{}", cert.pem(), key_pair.serialize_pem());
        std::fs::write(dir.join(file), pem).unwrap();
        cert.der().to_vec()
    }

    fn leaf(key: &CertifiedKey) -> Vec<u8> {
        key.cert[0].as_ref().to_vec()
    }

    #[test]
    fn test_missing_path_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs");

        let cache = CertCache::initialize(&path).unwrap();
        assert!(path.is_dir());
        assert!(cache.exact.is_empty());
    }

    #[test]
    fn test_exact_and_wildcard_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let exact = write_bundle(dir.path(), "a.pem", &["a.test"]);
        let wild = write_bundle(dir.path(), "b.pem", &["*.wild.test"]);

        let cache = CertCache::initialize(dir.path()).unwrap();

        assert_eq!(leaf(&cache.get_certificate(Some("a.test")).unwrap()), exact);
        assert_eq!(leaf(&cache.get_certificate(Some("A.Test.")).unwrap()), exact);
        assert_eq!(leaf(&cache.get_certificate(Some("x.wild.test")).unwrap()), wild);

        // a wildcard covers a single label only
        let deep = cache.get_certificate(Some("y.x.wild.test")).unwrap();
        assert_ne!(leaf(&deep), wild);
    }

    #[test]
    fn test_crt_key_pair() {
        let dir = tempfile::tempdir().unwrap();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["pair.test".to_string()]).unwrap();
        std::fs::write(dir.path().join("pair.crt"), cert.pem()).unwrap();
        std::fs::write(dir.path().join("pair.key"), key_pair.serialize_pem()).unwrap();

        let cache = CertCache::initialize(dir.path()).unwrap();
        let key = cache.get_certificate(Some("pair.test")).unwrap();
        assert_eq!(leaf(&key), cert.der().to_vec());
    }

    #[test]
    fn test_crt_without_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let rcgen::CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["lonely.test".to_string()]).unwrap();
        std::fs::write(dir.path().join("lonely.crt"), cert.pem()).unwrap();

        let err = CertCache::initialize(dir.path()).unwrap_err();
        assert!(matches!(err, CertError::MissingKey { .. }));
    }

    #[test]
    fn test_single_file_bundle_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let der = write_bundle(dir.path(), "site.pem", &["site.test", "www.site.test"]);

        let cache = CertCache::initialize(dir.path().join("site.pem")).unwrap();
        assert_eq!(leaf(&cache.get_certificate(None).unwrap()), der);
        assert_eq!(leaf(&cache.get_certificate(Some("www.site.test")).unwrap()), der);
    }

    #[test]
    fn test_unparseable_pem_without_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.pem"), "not a certificate").unwrap();

        let err = CertCache::initialize(dir.path()).unwrap_err();
        assert!(matches!(err, CertError::MissingKey { .. } | CertError::NoCertificate { .. }));
    }

    #[test]
    fn test_expired_certificate_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["old.test".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        std::fs::write(
            dir.path().join("old.pem"),
            format!("{}{}", cert.pem(), key_pair.serialize_pem()),
        )
        .unwrap();

        let cache = CertCache::initialize(dir.path()).unwrap();
        assert!(cache.exact.is_empty());
        let served = cache.get_certificate(Some("old.test")).unwrap();
        assert_ne!(leaf(&served), cert.der().to_vec());
    }

    #[test]
    fn test_self_signed_fallback_is_memoised() {
        let cache = CertCache::self_signed_only();

        let first = cache.get_certificate(Some("new.test")).unwrap();
        let second = cache.get_certificate(Some("new.test")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = cache.get_certificate(Some("other.test")).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));

        assert!(cache.get_certificate(None).is_some());
    }

    #[test]
    fn test_self_signed_memo_is_bounded() {
        let mut cache = CertCache::self_signed_only();
        cache.generated_limit = 4;

        let fallback = cache.get_certificate(Some("localhost")).unwrap();
        for i in 0..40 {
            cache.get_certificate(Some(&format!("r{}.unknown.test", i))).unwrap();
        }
        assert!(cache.generated.len() <= 4);

        let late = cache.get_certificate(Some("late.unknown.test")).unwrap();
        assert!(Arc::ptr_eq(&late, &fallback));
        assert!(!cache.generated.contains_key("late.unknown.test"));
    }

    #[test]
    fn test_full_memo_prefers_loaded_default() {
        let dir = tempfile::tempdir().unwrap();
        let der = write_bundle(dir.path(), "site.pem", &["site.test"]);

        let mut cache = CertCache::initialize(dir.path()).unwrap();
        cache.generated_limit = 1;

        let first = cache.get_certificate(Some("one.test")).unwrap();
        assert_ne!(leaf(&first), der);
        let second = cache.get_certificate(Some("two.test")).unwrap();
        assert_eq!(leaf(&second), der);
        assert_eq!(cache.generated.len(), 1);
    }

    #[test]
    fn test_server_config_alpn() {
        let config = server_config(Arc::new(CertCache::self_signed_only())).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
