//! Server certificate pinning.
//!
//! The client may pin the server's leaf certificate instead of trusting any
//! CA. The pin is the DER of a single PEM certificate; the TLS layer
//! compares the presented leaf against it byte for byte, and logs use the
//! SHA-256 fingerprint. The pinned key also checks the handshake
//! signature, so replaying the public certificate is not enough.

use anyhow::{bail, Context};
use ring::digest;
use rustls_pki_types::{CertificateDer, SignatureVerificationAlgorithm};
use std::path::Path;
use webpki::EndEntityCert;

/// TLS 1.3 signature schemes the pinned key can verify
pub const SIG_RSA_PKCS1_SHA256: u16 = 0x0401;
pub const SIG_RSA_PKCS1_SHA384: u16 = 0x0501;
pub const SIG_RSA_PKCS1_SHA512: u16 = 0x0601;
pub const SIG_ECDSA_SECP256R1_SHA256: u16 = 0x0403;
pub const SIG_ECDSA_SECP384R1_SHA384: u16 = 0x0503;
pub const SIG_RSA_PSS_RSAE_SHA256: u16 = 0x0804;
pub const SIG_RSA_PSS_RSAE_SHA384: u16 = 0x0805;
pub const SIG_RSA_PSS_RSAE_SHA512: u16 = 0x0806;
pub const SIG_ED25519: u16 = 0x0807;

/// Offered to the TLS stack, most preferred first
pub const SUPPORTED_SCHEMES: [u16; 9] = [
    SIG_ED25519,
    SIG_ECDSA_SECP256R1_SHA256,
    SIG_ECDSA_SECP384R1_SHA384,
    SIG_RSA_PSS_RSAE_SHA256,
    SIG_RSA_PSS_RSAE_SHA384,
    SIG_RSA_PSS_RSAE_SHA512,
    SIG_RSA_PKCS1_SHA256,
    SIG_RSA_PKCS1_SHA384,
    SIG_RSA_PKCS1_SHA512,
];

/// How the client verifies the server certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertVerification {
    /// Accept any certificate
    Insecure,
    /// Accept exactly this leaf
    Pinned(CertPin),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPin {
    der: CertificateDer<'static>,
    fingerprint: [u8; 32],
    /// Whether the leaf parses as an end-entity certificate
    has_key: bool,
}

impl CertPin {
    pub fn from_der(der: impl Into<CertificateDer<'static>>) -> Self {
        let der = der.into();
        let hash = digest::digest(&digest::SHA256, der.as_ref());
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(hash.as_ref());
        let has_key = match EndEntityCert::try_from(&der) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Pinned certificate is unreadable ({:?}); handshakes will fail", e);
                false
            }
        };
        Self {
            der,
            fingerprint,
            has_key,
        }
    }

    /// Parse a PEM bundle holding exactly one certificate
    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let mut reader = pem.as_bytes();
        let mut certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to parse certificate PEM")?;
        if certs.len() != 1 {
            bail!(
                "Pinned cert must contain exactly one certificate (found {})",
                certs.len()
            );
        }
        let der = certs.remove(0);
        if der.is_empty() {
            bail!("Certificate is empty");
        }
        Ok(Self::from_der(der))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cert {}", path.display()))?;
        Self::from_pem(&pem).with_context(|| format!("Failed to parse cert {}", path.display()))
    }

    pub fn der(&self) -> &[u8] {
        self.der.as_ref()
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Lowercase hex SHA-256, for logs
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }

    /// Whether a presented leaf certificate is the pinned one
    pub fn matches(&self, leaf_der: &[u8]) -> bool {
        !leaf_der.is_empty() && leaf_der == self.der()
    }

    /// Check a handshake signature against the pinned key
    pub fn verify_signature(&self, scheme: u16, message: &[u8], sig: &[u8]) -> bool {
        if !self.has_key {
            return false;
        }
        let Some(algorithm) = verification_algorithm(scheme) else {
            log::debug!("Unsupported signature scheme 0x{:04x}", scheme);
            return false;
        };
        match EndEntityCert::try_from(&self.der) {
            Ok(cert) => cert.verify_signature(algorithm, message, sig).is_ok(),
            Err(_) => false,
        }
    }
}

fn verification_algorithm(scheme: u16) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    use webpki::ring as alg;

    let algorithm: &'static dyn SignatureVerificationAlgorithm = match scheme {
        SIG_RSA_PKCS1_SHA256 => alg::RSA_PKCS1_2048_8192_SHA256,
        SIG_RSA_PKCS1_SHA384 => alg::RSA_PKCS1_2048_8192_SHA384,
        SIG_RSA_PKCS1_SHA512 => alg::RSA_PKCS1_2048_8192_SHA512,
        SIG_RSA_PSS_RSAE_SHA256 => alg::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
        SIG_RSA_PSS_RSAE_SHA384 => alg::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
        SIG_RSA_PSS_RSAE_SHA512 => alg::RSA_PSS_2048_8192_SHA512_LEGACY_KEY,
        SIG_ECDSA_SECP256R1_SHA256 => alg::ECDSA_P256_SHA256,
        SIG_ECDSA_SECP384R1_SHA384 => alg::ECDSA_P384_SHA384,
        SIG_ED25519 => alg::ED25519,
        _ => return None,
    };
    Some(algorithm)
}

impl CertVerification {
    pub fn accepts(&self, leaf_der: &[u8]) -> bool {
        match self {
            CertVerification::Insecure => true,
            CertVerification::Pinned(pin) => pin.matches(leaf_der),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use rcgen::{CertificateParams, KeyPair, PKCS_ED25519};
    use ring::signature::Ed25519KeyPair;

    fn pem_for(der: &[u8]) -> String {
        format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            STANDARD.encode(der)
        )
    }

    /// Self-signed Ed25519 leaf plus a ring key pair that signs for it
    fn ed25519_leaf() -> (Vec<u8>, Ed25519KeyPair) {
        let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let cert = CertificateParams::new(vec!["tunnel.example.com".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let signer = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&key.serialize_der()).unwrap();
        (cert.der().to_vec(), signer)
    }

    #[test]
    fn test_pin_from_pem() {
        let (der, _) = ed25519_leaf();
        let pin = CertPin::from_pem(&pem_for(&der)).unwrap();
        assert_eq!(pin.der(), der.as_slice());
        assert!(pin.matches(&der));
        assert!(!pin.matches(b"other"));
        assert!(!pin.matches(b""));
        assert_eq!(pin.fingerprint_hex().len(), 64);
    }

    #[test]
    fn test_pem_requires_single_cert() {
        let two = format!("{}{}", pem_for(b"a"), pem_for(b"b"));
        assert!(CertPin::from_pem(&two).is_err());
        assert!(CertPin::from_pem("").is_err());
        assert!(CertPin::from_pem("-----BEGIN CERTIFICATE-----\nAAAA\n").is_err());
    }

    #[test]
    fn test_fingerprint_is_sha256() {
        let pin = CertPin::from_der(b"abc".to_vec());
        assert_eq!(
            pin.fingerprint_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_pinned_key_checks_signatures() {
        let (der, signer) = ed25519_leaf();
        let pin = CertPin::from_der(der);

        let message = b"tls13 certificate verify";
        let sig = signer.sign(message);
        assert!(pin.verify_signature(SIG_ED25519, message, sig.as_ref()));
        assert!(!pin.verify_signature(SIG_ED25519, b"something else", sig.as_ref()));
        assert!(!pin.verify_signature(SIG_ECDSA_SECP256R1_SHA256, message, sig.as_ref()));
        assert!(!pin.verify_signature(0x0808, message, sig.as_ref()));
    }

    #[test]
    fn test_other_leaf_key_rejected() {
        let (der, _) = ed25519_leaf();
        let (_, stranger) = ed25519_leaf();
        let pin = CertPin::from_der(der);
        let sig = stranger.sign(b"m");
        assert!(!pin.verify_signature(SIG_ED25519, b"m", sig.as_ref()));
    }

    #[test]
    fn test_unreadable_cert_never_verifies() {
        let pin = CertPin::from_der(b"abc".to_vec());
        assert!(!pin.verify_signature(SIG_ED25519, b"m", b"s"));
        let truncated = CertPin::from_der(vec![0x30, 0x03, 0x02, 0x01]);
        assert!(!truncated.verify_signature(SIG_ED25519, b"m", b"s"));
    }

    #[test]
    fn test_insecure_accepts_anything() {
        assert!(CertVerification::Insecure.accepts(b"whatever"));
        let pinned = CertVerification::Pinned(CertPin::from_der(b"leaf".to_vec()));
        assert!(pinned.accepts(b"leaf"));
        assert!(!pinned.accepts(b"leaf2"));
    }
}
