//! Signed envelopes over a canonical JSON byte encoding.
//!
//! The canonical form is compact serde_json output with every non-US-ASCII
//! character `\uXXXX`-escaped, so independent implementations hash identical
//! bytes. Seals are ECDSA-P256 signatures over the SHA-512 digest of the
//! canonical payload, in IEEE P1363 (`r || s`) form, each keyed by the DER
//! certificate of its signer.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x509_parser::prelude::*;

use crate::TrustError;

/// One signature over the envelope payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seal {
    /// DER certificate of the signer.
    pub signer: Vec<u8>,
    /// ECDSA-P256/SHA-512 signature, `r || s` fixed form (64 bytes).
    pub signature: Vec<u8>,
}

/// A JSON payload plus one or more certificate-keyed seals.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    payload: serde_json::Value,
    seals: Vec<Seal>,
}

#[derive(Serialize, Deserialize)]
struct WireSeal {
    signer: String,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    payload: serde_json::Value,
    seals: Vec<WireSeal>,
}

impl Envelope {
    pub fn new(payload: serde_json::Value) -> Envelope {
        Envelope { payload, seals: Vec::new() }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn seals(&self) -> &[Seal] {
        &self.seals
    }

    /// Append a seal signed with `key`, keyed by `signer_der`.
    pub fn sign(&mut self, signer_der: &[u8], key: &SigningKey) -> Result<(), TrustError> {
        let digest = Sha512::new_with_prefix(canonical_bytes(&self.payload)).finalize();
        let signature: Signature =
            key.sign_prehash(&digest).map_err(|_| TrustError::BadSignature)?;
        self.seals
            .push(Seal { signer: signer_der.to_vec(), signature: signature.to_bytes().to_vec() });
        Ok(())
    }

    /// Verify every seal against its embedded signer certificate. An
    /// envelope with no seals does not verify.
    pub fn verify(&self) -> Result<(), TrustError> {
        if self.seals.is_empty() {
            return Err(TrustError::BadEnvelope("no seals"));
        }
        let canonical = canonical_bytes(&self.payload);
        for seal in &self.seals {
            let key = verifying_key(&seal.signer)?;
            let signature = Signature::from_slice(&seal.signature)
                .map_err(|_| TrustError::BadEnvelope("malformed signature"))?;
            let digest = Sha512::new_with_prefix(&canonical).finalize();
            key.verify_prehash(&digest, &signature).map_err(|_| TrustError::BadSignature)?;
        }
        Ok(())
    }

    /// Serialized form carried inside `SyncSession.sealed_certificate`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = WireEnvelope {
            payload: self.payload.clone(),
            seals: self
                .seals
                .iter()
                .map(|seal| WireSeal {
                    signer: hex::encode(&seal.signer),
                    signature: hex::encode(&seal.signature),
                })
                .collect(),
        };
        serde_json::to_vec(&wire).expect("envelope serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, TrustError> {
        let wire: WireEnvelope =
            serde_json::from_slice(bytes).map_err(|_| TrustError::BadEnvelope("not json"))?;
        let mut seals = Vec::with_capacity(wire.seals.len());
        for seal in wire.seals {
            seals.push(Seal {
                signer: hex::decode(seal.signer)
                    .map_err(|_| TrustError::BadEnvelope("bad signer hex"))?,
                signature: hex::decode(seal.signature)
                    .map_err(|_| TrustError::BadEnvelope("bad signature hex"))?,
            });
        }
        Ok(Envelope { payload: wire.payload, seals })
    }
}

/// Canonical byte encoding of a JSON value: compact separators, every
/// non-US-ASCII character escaped.
pub fn canonical_bytes(value: &serde_json::Value) -> Vec<u8> {
    let compact = serde_json::to_string(value).expect("json serializes");
    let mut out = Vec::with_capacity(compact.len());
    for c in compact.chars() {
        if c.is_ascii() {
            out.push(c as u8);
        } else {
            // Escape as UTF-16 code units, surrogate pairs above the BMP.
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.extend_from_slice(format!("\\u{:04x}", unit).as_bytes());
            }
        }
    }
    out
}

/// Build the sealed-certificate envelope exchanged during the session
/// handshake: the node's DER certificate, sealed by a CA key.
pub fn seal_certificate(
    node_cert_der: &[u8],
    ca_cert_der: &[u8],
    ca_key: &SigningKey,
) -> Result<Envelope, TrustError> {
    let mut envelope = Envelope::new(serde_json::json!({ "cert": hex::encode(node_cert_der) }));
    envelope.sign(ca_cert_der, ca_key)?;
    Ok(envelope)
}

/// Extract the DER certificate from a sealed-certificate envelope.
pub fn sealed_cert_der(envelope: &Envelope) -> Result<Vec<u8>, TrustError> {
    let cert_hex = envelope
        .payload()
        .get("cert")
        .and_then(|v| v.as_str())
        .ok_or(TrustError::BadEnvelope("no cert field"))?;
    hex::decode(cert_hex).map_err(|_| TrustError::BadEnvelope("bad cert hex"))
}

/// Extract the P-256 verifying key from a DER certificate.
pub fn verifying_key(cert_der: &[u8]) -> Result<VerifyingKey, TrustError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| TrustError::BadCertificate(e.to_string()))?;
    let spki = cert.public_key();
    VerifyingKey::from_sec1_bytes(&spki.subject_public_key.data)
        .map_err(|_| TrustError::BadCertificate("public key is not P-256".to_string()))
}
