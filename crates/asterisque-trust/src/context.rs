//! Directory-backed trust context.
//!
//! Layout under a root path:
//!
//! ```text
//! node.key    own private key, PKCS#8 PEM (optional)
//! node.crt    own certificate chain, PEM, leaf first (optional)
//! ca/*.pem    trusted CA certificates
//! blocked/*.pem  revoked individual certificates or CAs
//! ```
//!
//! The `ca/` and `blocked/` sets are observed through a [`Cache`], so
//! replacing a file on disk is visible to the next `verify` call. The
//! block-list always takes precedence over the trusted set.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_parser::prelude::*;

use crate::{Cache, TrustError};

/// Files in `ca/` or `blocked/` larger than this are never parsed.
pub const MAX_CERT_SIZE_TO_READ: u64 = 64 * 1024;

/// Default minimum interval between directory stat passes, milliseconds.
pub const DEFAULT_CACHE_REFRESH_MS: u64 = 1_000;

const KEY_FILE: &str = "node.key";
const CERT_FILE: &str = "node.crt";
const CA_DIR: &str = "ca";
const BLOCKED_DIR: &str = "blocked";
const LOCK_FILE: &str = ".lock";

/// Key material and certificate directories of one node.
pub struct TrustContext {
    root: PathBuf,
    key_pkcs8: Option<Vec<u8>>,
    chain: Vec<Vec<u8>>,
    ca: Cache<Vec<Vec<u8>>>,
    blocked: Cache<Vec<Vec<u8>>>,
}

impl TrustContext {
    /// Load a context from `root` with the default cache refresh interval.
    pub fn load(root: &Path) -> Result<TrustContext, TrustError> {
        TrustContext::load_with_refresh(root, DEFAULT_CACHE_REFRESH_MS)
    }

    pub fn load_with_refresh(root: &Path, refresh_ms: u64) -> Result<TrustContext, TrustError> {
        let key_path = root.join(KEY_FILE);
        let key_pkcs8 = if key_path.is_file() {
            let pem = std::fs::read(&key_path)?;
            let key = rustls_pemfile::private_key(&mut pem.as_slice())
                .map_err(|_| TrustError::BadCertificate("unreadable private key".to_string()))?
                .ok_or_else(|| TrustError::BadCertificate("no key in node.key".to_string()))?;
            match key {
                PrivateKeyDer::Pkcs8(k) => Some(k.secret_pkcs8_der().to_vec()),
                _ => {
                    return Err(TrustError::BadCertificate(
                        "node.key must hold a PKCS#8 key".to_string(),
                    ));
                }
            }
        } else {
            None
        };

        let cert_path = root.join(CERT_FILE);
        let chain = if cert_path.is_file() {
            let pem = std::fs::read(&cert_path)?;
            read_pem_certs(&pem)?
        } else {
            Vec::new()
        };
        if key_pkcs8.is_some() && chain.is_empty() {
            return Err(TrustError::BadCertificate("node.key without node.crt".to_string()));
        }

        let ca = Cache::new(&root.join(CA_DIR), refresh_ms, Vec::new(), read_cert_dir);
        let blocked = Cache::new(&root.join(BLOCKED_DIR), refresh_ms, Vec::new(), read_cert_dir);
        Ok(TrustContext { root: root.to_path_buf(), key_pkcs8, chain, ca, blocked })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_key(&self) -> bool {
        self.key_pkcs8.is_some()
    }

    /// Own leaf certificate, DER.
    pub fn certificate(&self) -> Option<&[u8]> {
        self.chain.first().map(|der| der.as_slice())
    }

    /// Own certificate chain, leaf first, DER.
    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// ECDSA signing key for envelope seals.
    pub fn signing_key(&self) -> Result<SigningKey, TrustError> {
        let der = self.key_pkcs8.as_deref().ok_or(TrustError::MissingKey)?;
        SigningKey::from_pkcs8_der(der)
            .map_err(|_| TrustError::BadCertificate("node.key is not a P-256 key".to_string()))
    }

    /// Current trusted CA certificates, DER.
    pub fn trusted_cas(&self) -> Arc<Vec<Vec<u8>>> {
        self.ca.get()
    }

    /// Current blocked certificates, DER.
    pub fn blocked_certs(&self) -> Arc<Vec<Vec<u8>>> {
        self.blocked.get()
    }

    /// Whether `der` is byte-identical to one of the trusted CAs.
    pub fn is_trusted_ca(&self, der: &[u8]) -> bool {
        self.ca.get().iter().any(|ca| ca == der)
    }

    /// Verify a certificate path (leaf first, DER).
    ///
    /// Succeeds iff every certificate's validity window includes now, some
    /// trusted CA signs a prefix of the path, and neither the certificates
    /// nor their issuers appear on the block-list. Blocking wins over trust.
    pub fn verify(&self, chain: &[Vec<u8>]) -> Result<(), TrustError> {
        if chain.is_empty() {
            return Err(TrustError::BadCertificate("empty certificate path".to_string()));
        }
        let mut parsed = Vec::with_capacity(chain.len());
        for der in chain {
            let (_, cert) = X509Certificate::from_der(der)
                .map_err(|e| TrustError::BadCertificate(e.to_string()))?;
            parsed.push(cert);
        }

        for cert in &parsed {
            if !cert.validity().is_valid() {
                return Err(TrustError::CertificateExpired(cert.subject().to_string()));
            }
        }

        let blocked = self.blocked.get();
        for (der, cert) in chain.iter().zip(&parsed) {
            for blocked_der in blocked.iter() {
                if blocked_der == der {
                    return Err(TrustError::CertificateBlocked(cert.subject().to_string()));
                }
                if let Ok((_, blocked_cert)) = X509Certificate::from_der(blocked_der) {
                    if blocked_cert.subject() == cert.issuer()
                        && cert.verify_signature(Some(blocked_cert.public_key())).is_ok()
                    {
                        return Err(TrustError::CertificateBlocked(cert.subject().to_string()));
                    }
                }
            }
        }

        let cas = self.ca.get();
        for cert in &parsed {
            for ca_der in cas.iter() {
                if let Ok((_, ca)) = X509Certificate::from_der(ca_der) {
                    if ca.subject() == cert.issuer()
                        && cert.verify_signature(Some(ca.public_key())).is_ok()
                    {
                        return Ok(());
                    }
                }
            }
        }
        Err(TrustError::UntrustedCertificate(parsed[0].subject().to_string()))
    }

    /// Copy a PEM file into `ca/`, atomically renamed into place.
    pub fn deploy_trusted_ca(&self, source: &Path) -> Result<PathBuf, TrustError> {
        self.deploy(CA_DIR, source)
    }

    /// Copy a PEM file into `blocked/`, atomically renamed into place.
    pub fn deploy_blocked(&self, source: &Path) -> Result<PathBuf, TrustError> {
        self.deploy(BLOCKED_DIR, source)
    }

    fn deploy(&self, subdir: &str, source: &Path) -> Result<PathBuf, TrustError> {
        let dir = self.root.join(subdir);
        std::fs::create_dir_all(&dir)?;

        // Exclusive advisory lock on the subdirectory for the duration of
        // the deployment; released when the handle drops.
        let lock = std::fs::File::create(dir.join(LOCK_FILE))?;
        lock.lock()?;

        let name = source
            .file_name()
            .ok_or_else(|| TrustError::BadCertificate("source has no file name".to_string()))?;
        let data = std::fs::read(source)?;
        let target = dir.join(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&target).map_err(|e| TrustError::Io(e.error))?;
        tracing::debug!(target = %target.display(), "deployed certificate");
        Ok(target)
    }

    /// rustls server config using the own key pair; client certificates are
    /// demanded and pre-verified against `ca/` when `require_client_auth`.
    pub fn server_config(
        &self,
        require_client_auth: bool,
    ) -> Result<Arc<rustls::ServerConfig>, TrustError> {
        let (chain, key) = self.own_identity()?;
        let config = if require_client_auth {
            let verifier = WebPkiClientVerifier::builder(Arc::new(self.root_store()?))
                .build()
                .map_err(|e| TrustError::BadCertificate(e.to_string()))?;
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)?
        } else {
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(chain, key)?
        };
        Ok(Arc::new(config))
    }

    /// rustls client config rooted at `ca/`; presents the own certificate
    /// when key material is loaded.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, TrustError> {
        let builder = rustls::ClientConfig::builder().with_root_certificates(self.root_store()?);
        let config = if self.has_key() {
            let (chain, key) = self.own_identity()?;
            builder.with_client_auth_cert(chain, key)?
        } else {
            builder.with_no_client_auth()
        };
        Ok(Arc::new(config))
    }

    fn own_identity(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TrustError> {
        let key = self.key_pkcs8.as_ref().ok_or(TrustError::MissingKey)?;
        let chain =
            self.chain.iter().map(|der| CertificateDer::from(der.clone())).collect::<Vec<_>>();
        Ok((chain, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.clone()))))
    }

    fn root_store(&self) -> Result<RootCertStore, TrustError> {
        let mut roots = RootCertStore::empty();
        for der in self.trusted_cas().iter() {
            roots.add(CertificateDer::from(der.clone()))?;
        }
        Ok(roots)
    }
}

fn read_pem_certs(pem: &[u8]) -> Result<Vec<Vec<u8>>, TrustError> {
    let certs: Result<Vec<CertificateDer<'static>>, _> =
        rustls_pemfile::certs(&mut &pem[..]).collect();
    let certs = certs.map_err(|_| TrustError::BadCertificate("unreadable PEM".to_string()))?;
    Ok(certs.into_iter().map(|der| der.to_vec()).collect())
}

/// Read every `*.pem` member of a trust directory into DER certificates.
/// Oversized or unparseable files are skipped with a warning.
fn read_cert_dir(files: &[PathBuf]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for path in files {
        if path.extension().and_then(|e| e.to_str()) != Some("pem") {
            continue;
        }
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > MAX_CERT_SIZE_TO_READ => {
                tracing::warn!(
                    path = %path.display(),
                    size = meta.len(),
                    "certificate file exceeds {} bytes, skipping",
                    MAX_CERT_SIZE_TO_READ
                );
                continue;
            }
            Ok(_) => {}
            Err(_) => continue,
        }
        match std::fs::read(path) {
            Ok(pem) => match read_pem_certs(&pem) {
                Ok(certs) if !certs.is_empty() => out.extend(certs),
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "no certificates in file, skipping");
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable file, skipping");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPki {
        ca_pem: String,
        ca_der: Vec<u8>,
        leaf_pem: String,
        leaf_der: Vec<u8>,
        leaf_key_pem: String,
    }

    fn make_pki() -> TestPki {
        let ca_key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("ca key");
        let mut ca_params = rcgen::CertificateParams::new(Vec::new()).expect("ca params");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "asterisque test ca");
        let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

        let leaf_key =
            rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("leaf key");
        let leaf_params =
            rcgen::CertificateParams::new(vec!["node.test".to_string()]).expect("leaf params");
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).expect("leaf cert");

        TestPki {
            ca_pem: ca_cert.pem(),
            ca_der: ca_cert.der().to_vec(),
            leaf_pem: leaf_cert.pem(),
            leaf_der: leaf_cert.der().to_vec(),
            leaf_key_pem: leaf_key.serialize_pem(),
        }
    }

    fn context_with(pki: &TestPki, trusted: bool, blocked_leaf: bool) -> TrustContext {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("ca")).expect("mkdir");
        std::fs::create_dir_all(root.join("blocked")).expect("mkdir");
        if trusted {
            std::fs::write(root.join("ca/ca.pem"), &pki.ca_pem).expect("write ca");
        }
        if blocked_leaf {
            std::fs::write(root.join("blocked/leaf.pem"), &pki.leaf_pem).expect("write blocked");
        }
        std::fs::write(root.join("node.key"), &pki.leaf_key_pem).expect("write key");
        std::fs::write(root.join("node.crt"), format!("{}{}", pki.leaf_pem, pki.ca_pem))
            .expect("write chain");
        // Leak the tempdir so the context outlives this helper.
        std::mem::forget(dir);
        TrustContext::load_with_refresh(&root, 0).expect("load")
    }

    #[test]
    fn verifies_a_ca_signed_leaf() {
        let pki = make_pki();
        let ctx = context_with(&pki, true, false);
        ctx.verify(&[pki.leaf_der.clone()]).expect("verify");
    }

    #[test]
    fn rejects_an_unknown_issuer() {
        let pki = make_pki();
        let ctx = context_with(&pki, false, false);
        match ctx.verify(&[pki.leaf_der.clone()]) {
            Err(TrustError::UntrustedCertificate(_)) => {}
            other => panic!("expected UntrustedCertificate, got {:?}", other),
        }
    }

    #[test]
    fn blocked_leaf_is_rejected_despite_trusted_issuer() {
        let pki = make_pki();
        let ctx = context_with(&pki, true, true);
        match ctx.verify(&[pki.leaf_der.clone()]) {
            Err(TrustError::CertificateBlocked(_)) => {}
            other => panic!("expected CertificateBlocked, got {:?}", other),
        }
    }

    #[test]
    fn block_list_takes_precedence_over_trust() {
        // The same CA certificate deployed to both ca/ and blocked/.
        let pki = make_pki();
        let ctx = context_with(&pki, true, false);
        std::fs::write(ctx.root().join("blocked/ca.pem"), &pki.ca_pem).expect("write");
        match ctx.verify(&[pki.ca_der.clone()]) {
            Err(TrustError::CertificateBlocked(_)) => {}
            other => panic!("expected CertificateBlocked, got {:?}", other),
        }
        // The leaf is also rejected: its issuer is blocked.
        match ctx.verify(&[pki.leaf_der.clone()]) {
            Err(TrustError::CertificateBlocked(_)) => {}
            other => panic!("expected CertificateBlocked, got {:?}", other),
        }
    }

    #[test]
    fn oversized_ca_file_behaves_as_absent() {
        let pki = make_pki();
        let ctx = context_with(&pki, false, false);
        let mut big = pki.ca_pem.clone().into_bytes();
        big.resize(MAX_CERT_SIZE_TO_READ as usize + 1, b'\n');
        std::fs::write(ctx.root().join("ca/big.pem"), &big).expect("write");
        match ctx.verify(&[pki.leaf_der.clone()]) {
            Err(TrustError::UntrustedCertificate(_)) => {}
            other => panic!("expected UntrustedCertificate, got {:?}", other),
        }
    }

    #[test]
    fn deploy_makes_the_ca_visible_to_the_next_verify() {
        let pki = make_pki();
        let ctx = context_with(&pki, false, false);
        assert!(ctx.verify(&[pki.leaf_der.clone()]).is_err());

        let staging = tempfile::tempdir().expect("tempdir");
        let source = staging.path().join("ca.pem");
        std::fs::write(&source, &pki.ca_pem).expect("write");
        let target = ctx.deploy_trusted_ca(&source).expect("deploy");
        assert!(target.is_file());

        ctx.verify(&[pki.leaf_der.clone()]).expect("verify after deploy");
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let ca_key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("key");
        let mut params = rcgen::CertificateParams::new(Vec::new()).expect("params");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.not_before = rcgen::date_time_ymd(1990, 1, 1);
        params.not_after = rcgen::date_time_ymd(1991, 1, 1);
        let ca_cert = params.self_signed(&ca_key).expect("cert");

        let pki = make_pki();
        let ctx = context_with(&pki, true, false);
        std::fs::write(ctx.root().join("ca/old.pem"), ca_cert.pem()).expect("write");
        match ctx.verify(&[ca_cert.der().to_vec()]) {
            Err(TrustError::CertificateExpired(_)) => {}
            other => panic!("expected CertificateExpired, got {:?}", other),
        }
    }

    #[test]
    fn own_identity_and_signing_key_load() {
        let pki = make_pki();
        let ctx = context_with(&pki, true, false);
        assert!(ctx.has_key());
        assert_eq!(ctx.certificate().expect("leaf"), pki.leaf_der.as_slice());
        assert_eq!(ctx.certificate_chain().len(), 2);
        ctx.signing_key().expect("signing key");
    }

    #[test]
    fn tls_configs_build() {
        let pki = make_pki();
        let ctx = context_with(&pki, true, false);
        ctx.client_config().expect("client config");
        ctx.server_config(true).expect("server config with client auth");
        ctx.server_config(false).expect("server config");
    }
}
