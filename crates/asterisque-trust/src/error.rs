use std::fmt;

/// Failures while loading, verifying or deploying trust material.
#[derive(Debug)]
pub enum TrustError {
    Io(std::io::Error),
    /// PEM or DER material could not be parsed.
    BadCertificate(String),
    /// A certificate's validity window does not include the present.
    CertificateExpired(String),
    /// The certificate (or one of its issuers) is on the block-list.
    CertificateBlocked(String),
    /// No trusted CA signs any prefix of the presented path.
    UntrustedCertificate(String),
    /// An envelope seal did not verify, or the envelope is malformed.
    BadEnvelope(&'static str),
    /// A signature did not verify against its certificate.
    BadSignature,
    /// The context has no own key material for the requested operation.
    MissingKey,
    Tls(rustls::Error),
}

impl fmt::Display for TrustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustError::Io(e) => write!(f, "trust store i/o error: {}", e),
            TrustError::BadCertificate(what) => write!(f, "bad certificate: {}", what),
            TrustError::CertificateExpired(subject) => {
                write!(f, "certificate outside its validity window: {}", subject)
            }
            TrustError::CertificateBlocked(subject) => {
                write!(f, "certificate is blocked: {}", subject)
            }
            TrustError::UntrustedCertificate(subject) => {
                write!(f, "no trusted CA signs the certificate path of {}", subject)
            }
            TrustError::BadEnvelope(what) => write!(f, "bad envelope: {}", what),
            TrustError::BadSignature => write!(f, "signature verification failed"),
            TrustError::MissingKey => write!(f, "no private key loaded in this trust context"),
            TrustError::Tls(e) => write!(f, "tls configuration error: {}", e),
        }
    }
}

impl std::error::Error for TrustError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrustError::Io(e) => Some(e),
            TrustError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrustError {
    fn from(e: std::io::Error) -> TrustError {
        TrustError::Io(e)
    }
}

impl From<rustls::Error> for TrustError {
    fn from(e: rustls::Error) -> TrustError {
        TrustError::Tls(e)
    }
}
