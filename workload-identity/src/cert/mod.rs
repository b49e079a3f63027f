//! Validated DER certificate and PKCS#8 private key wrappers.

use pkcs8::PrivateKeyInfo;
use time::OffsetDateTime;
use zeroize::Zeroize;

use crate::cert::error::{CertificateError, PrivateKeyError};
use crate::cert::parsing::{
    extract_single_subject_id, not_after, parse_der_encoded_bytes_as_x509_certificate,
};
use crate::subject_id::SubjectId;

pub mod error;
pub(crate) mod parsing;

/// A single DER-encoded X.509 certificate, validated as parseable on construction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Returns the DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the subject id carried in the URI SAN.
    ///
    /// Exactly one `spiffe://` URI SAN must be present.
    pub fn subject_id(&self) -> Result<SubjectId, CertificateError> {
        subject_id_from_der(&self.0)
    }

    /// Returns the end of the certificate's validity period.
    pub fn not_after(&self) -> Result<OffsetDateTime, CertificateError> {
        let x509 = parse_der_encoded_bytes_as_x509_certificate(&self.0)?;
        Ok(not_after(&x509))
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: &[u8]) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(der_bytes)?;
        Ok(Self(der_bytes.to_vec()))
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = CertificateError;

    fn try_from(der_bytes: Vec<u8>) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(&der_bytes)?;
        Ok(Self(der_bytes))
    }
}

/// An unencrypted PKCS#8 private key. Zeroized on drop; `Debug` prints only its length.
#[derive(Clone, Eq, PartialEq, Zeroize)]
#[zeroize(drop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// Returns the PKCS#8 DER bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PrivateKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(bytes).map_err(PrivateKeyError::DecodePkcs8)?;
        Ok(Self(bytes.to_vec()))
    }
}

impl TryFrom<Vec<u8>> for PrivateKey {
    type Error = PrivateKeyError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        PrivateKeyInfo::try_from(bytes.as_slice()).map_err(PrivateKeyError::DecodePkcs8)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.0.len())
            .finish()
    }
}

/// Extracts the subject id from a DER-encoded certificate.
///
/// Used by the TLS layer on peer certificates that have already been chain-verified.
pub fn subject_id_from_der(der: &[u8]) -> Result<SubjectId, CertificateError> {
    let x509 = parse_der_encoded_bytes_as_x509_certificate(der)?;
    extract_single_subject_id(&x509)
}
