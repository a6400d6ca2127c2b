//! TLS material for the MASQUE connection
//!
//! The client authenticates with a leaf certificate derived from the
//! enrolled ECDSA identity key and validates the edge by pinning the
//! endpoint public key handed out at enrollment, instead of walking a CA
//! chain.

use std::sync::Arc;

use base64::Engine as _;
use p256::pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{Error, Result};

/// ALPN offered on the MASQUE connection
pub const ALPN_H3: &[u8] = b"h3";

/// The enrolled client identity: the device's ECDSA private key and the
/// endpoint public key to pin the server against.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    /// SEC1 DER encoding of the ECDSA P-256 private key
    private_key_der: Vec<u8>,
    /// SubjectPublicKeyInfo DER of the enrolled endpoint key
    endpoint_spki: Vec<u8>,
}

impl ClientIdentity {
    /// Build an identity from the configuration encodings: a base64 SEC1
    /// DER private key and a PEM SubjectPublicKeyInfo endpoint key.
    pub fn from_config_keys(private_key_b64: &str, endpoint_pub_key_pem: &str) -> Result<Self> {
        let private_key_der = base64::engine::general_purpose::STANDARD
            .decode(private_key_b64.trim())
            .map_err(|e| Error::Identity(format!("failed to decode private key: {e}")))?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(endpoint_pub_key_pem.as_bytes())
            .map_err(|e| Error::Identity(format!("failed to decode endpoint public key: {e:?}")))?;

        Ok(Self {
            private_key_der,
            endpoint_spki: pem.contents,
        })
    }

    /// Build an identity from raw DER material.
    pub fn from_der(private_key_der: Vec<u8>, endpoint_spki: Vec<u8>) -> Self {
        Self {
            private_key_der,
            endpoint_spki,
        }
    }
}

/// Produce the TLS client configuration for the tunnel: client certificate
/// derived from the identity key, endpoint key pinning, h3 ALPN.
pub fn client_tls_config(identity: &ClientIdentity) -> Result<rustls::ClientConfig> {
    // Normalize the SEC1 key through p256 so the PKCS#8 we hand to the
    // certificate generator always carries the public key.
    let secret = p256::SecretKey::from_sec1_der(&identity.private_key_der)
        .or_else(|_| p256::SecretKey::from_pkcs8_der(&identity.private_key_der))
        .map_err(|e| Error::Identity(format!("failed to parse private key: {e}")))?;
    let pkcs8 = secret
        .to_pkcs8_der()
        .map_err(|e| Error::Identity(format!("failed to encode private key: {e}")))?;

    let key_pair = rcgen::KeyPair::try_from(pkcs8.as_bytes())
        .map_err(|e| Error::Identity(format!("failed to load key pair: {e}")))?;
    let params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::Identity(format!("failed to build certificate params: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Identity(format!("failed to generate cert: {e}")))?;
    let cert_der = cert.der().clone();

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PinnedKeyVerifier {
        pinned_spki: identity.endpoint_spki.clone(),
        algorithms: provider.signature_verification_algorithms,
    };

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Identity(format!("failed to assemble TLS config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![cert_der], key_der)
        .map_err(|e| Error::Identity(format!("failed to assemble TLS config: {e}")))?;
    config.alpn_protocols = vec![ALPN_H3.to_vec()];

    Ok(config)
}

/// Accepts exactly the certificate whose SubjectPublicKeyInfo matches the
/// enrolled endpoint key. Signatures are still verified normally.
#[derive(Debug)]
struct PinnedKeyVerifier {
    pinned_spki: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        if cert.public_key().raw == self.pinned_spki.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use p256::pkcs8::EncodePublicKey as _;

    /// Fixed SEC1 DER P-256 private key (scalar 0x11 repeated), no
    /// embedded public key.
    fn test_key_der() -> Vec<u8> {
        let mut der = vec![0x30, 0x31, 0x02, 0x01, 0x01, 0x04, 0x20];
        der.extend(std::iter::repeat(0x11).take(32));
        der.extend_from_slice(&[
            0xa0, 0x0a, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
        ]);
        der
    }

    fn pem(label: &str, der: &[u8]) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(der);
        let mut out = format!("-----BEGIN {label}-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(chunk).unwrap());
            out.push('\n');
        }
        out.push_str(&format!("-----END {label}-----\n"));
        out
    }

    #[test]
    fn config_builds_from_enrolled_material() {
        let key_der = test_key_der();
        let secret = p256::SecretKey::from_sec1_der(&key_der).unwrap();
        let spki = secret.public_key().to_public_key_der().unwrap();

        let identity = ClientIdentity::from_config_keys(
            &base64::engine::general_purpose::STANDARD.encode(&key_der),
            &pem("PUBLIC KEY", spki.as_bytes()),
        )
        .unwrap();

        let config = client_tls_config(&identity).unwrap();
        assert_eq!(config.alpn_protocols, vec![ALPN_H3.to_vec()]);
    }

    #[test]
    fn garbage_key_is_identity_error() {
        let identity = ClientIdentity::from_der(vec![1, 2, 3], vec![4, 5, 6]);
        match client_tls_config(&identity) {
            Err(Error::Identity(_)) => {}
            other => panic!("expected identity error, got {other:?}"),
        }
    }

    #[test]
    fn bad_base64_is_identity_error() {
        match ClientIdentity::from_config_keys("!!!", "not a pem") {
            Err(Error::Identity(_)) => {}
            other => panic!("expected identity error, got {other:?}"),
        }
    }
}
