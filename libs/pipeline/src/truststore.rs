//! Trust store handling and JWK certificate validation.
//!
//! A JWKS may attach an X.509 chain (`x5c`) to each key. When
//! `validate_jwk` is enabled, the leaf certificate must be within its
//! validity window (with a small leeway against clock skew), must carry the
//! digital-signature key usage, and must chain to a configured trust
//! anchor. Without a configured trust store only the lifetime and key-usage
//! checks apply.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Time deviation tolerated when checking certificate lifetimes, in
/// seconds.
const LIFETIME_LEEWAY_SECS: i64 = 10;

#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("failed to read trust store: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificates found in trust store")]
    Empty,

    #[error("failed to decode certificate: {0}")]
    Decode(String),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate is expired or not yet valid")]
    Lifetime,

    #[error("certificate key usage does not include digital signature")]
    KeyUsage,

    #[error("certificate chain does not terminate in a trusted root")]
    Untrusted,
}

/// A set of trusted root certificates in DER form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrustStore {
    roots: Vec<Vec<u8>>,
}

impl TrustStore {
    /// Loads all certificates from a PEM bundle file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TrustStoreError> {
        let data = std::fs::read(path)?;
        Self::from_pem(&data)
    }

    /// Parses all certificates from PEM encoded data.
    pub fn from_pem(data: &[u8]) -> Result<Self, TrustStoreError> {
        let mut reader = std::io::BufReader::new(data);
        let roots: Vec<Vec<u8>> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TrustStoreError::Io)?
            .into_iter()
            .map(|der| der.to_vec())
            .collect();

        if roots.is_empty() {
            return Err(TrustStoreError::Empty);
        }

        Ok(Self { roots })
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Unix timestamp at which the leaf certificate of the given `x5c` chain
/// expires, if the chain is non-empty and parseable.
pub fn leaf_not_after(chain: &[String]) -> Option<i64> {
    let der = BASE64.decode(chain.first()?).ok()?;
    let (_, cert) = X509Certificate::from_der(&der).ok()?;
    Some(cert.validity().not_after.timestamp())
}

/// Validates the `x5c` chain of a JWK.
///
/// `chain` is the base64 encoded DER chain, leaf first, intermediates
/// after. The leaf must be within its validity window and usable for
/// digital signatures; with a non-empty trust store the chain must
/// terminate in one of its roots.
pub fn validate_certificate_chain(
    chain: &[String],
    trust_store: &TrustStore,
) -> Result<(), TrustStoreError> {
    let ders: Vec<Vec<u8>> = chain
        .iter()
        .map(|entry| {
            BASE64
                .decode(entry)
                .map_err(|err| TrustStoreError::Decode(err.to_string()))
        })
        .collect::<Result<_, _>>()?;

    let certs: Vec<X509Certificate<'_>> = ders
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|err| TrustStoreError::Parse(err.to_string()))
        })
        .collect::<Result<_, _>>()?;

    let Some(leaf) = certs.first() else {
        return Ok(());
    };

    check_lifetime(leaf)?;
    check_key_usage(leaf)?;

    if trust_store.is_empty() {
        return Ok(());
    }

    let roots: Vec<X509Certificate<'_>> = trust_store
        .roots
        .iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|err| TrustStoreError::Parse(err.to_string()))
        })
        .collect::<Result<_, _>>()?;

    verify_chain_to_root(leaf, &certs[1..], &roots)
}

fn check_lifetime(cert: &X509Certificate<'_>) -> Result<(), TrustStoreError> {
    let now = Utc::now().timestamp();
    let not_after = cert.validity().not_after.timestamp();
    let not_before = cert.validity().not_before.timestamp();

    if not_after - now - LIFETIME_LEEWAY_SECS <= 0 || not_before > now + LIFETIME_LEEWAY_SECS {
        return Err(TrustStoreError::Lifetime);
    }
    Ok(())
}

fn check_key_usage(cert: &X509Certificate<'_>) -> Result<(), TrustStoreError> {
    match cert.key_usage() {
        Ok(Some(usage)) if !usage.value.digital_signature() => Err(TrustStoreError::KeyUsage),
        Ok(_) => Ok(()),
        Err(err) => Err(TrustStoreError::Parse(err.to_string())),
    }
}

fn verify_chain_to_root(
    leaf: &X509Certificate<'_>,
    intermediates: &[X509Certificate<'_>],
    roots: &[X509Certificate<'_>],
) -> Result<(), TrustStoreError> {
    let mut current = leaf;
    // bounded by the chain length, which also rules out issuer loops
    for _ in 0..=intermediates.len() {
        let signed_by_root = roots.iter().any(|root| {
            root.subject() == current.issuer()
                && current.verify_signature(Some(root.public_key())).is_ok()
        });
        if signed_by_root {
            return Ok(());
        }

        let issuer = intermediates.iter().find(|candidate| {
            candidate.subject() == current.issuer()
                && current
                    .verify_signature(Some(candidate.public_key()))
                    .is_ok()
        });
        match issuer {
            Some(next) => current = next,
            None => return Err(TrustStoreError::Untrusted),
        }
    }

    Err(TrustStoreError::Untrusted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pem_bundle_is_rejected() {
        assert!(matches!(
            TrustStore::from_pem(b"not a pem"),
            Err(TrustStoreError::Empty)
        ));
    }

    #[test]
    fn garbage_chain_entries_fail_to_decode() {
        let err =
            validate_certificate_chain(&["%%%".to_string()], &TrustStore::default()).unwrap_err();
        assert!(matches!(err, TrustStoreError::Decode(_)));
    }

    #[test]
    fn decoded_but_unparseable_certificates_are_rejected() {
        let bogus = BASE64.encode(b"clearly not DER");
        let err =
            validate_certificate_chain(&[bogus], &TrustStore::default()).unwrap_err();
        assert!(matches!(err, TrustStoreError::Parse(_)));
    }

    #[test]
    fn empty_chain_is_accepted() {
        assert!(validate_certificate_chain(&[], &TrustStore::default()).is_ok());
    }

    #[test]
    fn leaf_not_after_handles_bad_input() {
        assert!(leaf_not_after(&[]).is_none());
        assert!(leaf_not_after(&["%%%".to_string()]).is_none());
    }
}
