//! Certificate and private key errors.

use x509_parser::asn1_rs::Oid;
use x509_parser::error::X509Error;

use crate::subject_id::SubjectIdError;

/// An error that may arise parsing and validating X.509 certificates.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum CertificateError {
    /// A required X.509 extension is absent.
    #[error("X.509 extension is missing: {0}")]
    MissingX509Extension(Oid<'static>),

    /// An extension was found where a different one was expected.
    #[error("unexpected X.509 extension: {0}")]
    UnexpectedExtension(String),

    /// The bytes are not a DER-encoded X.509 certificate.
    #[error("failed parsing X.509 certificate")]
    ParseX509Certificate(#[from] X509Error),

    /// No URI SAN carries a subject identifier.
    #[error("certificate has no subject id in its URI SAN")]
    MissingSubjectId,

    /// More than one URI SAN carries a subject identifier.
    #[error("certificate has multiple subject ids in its URI SAN")]
    MultipleSubjectIds,

    /// The certificate has more URI SAN entries than are inspected.
    #[error("certificate has too many URI SAN entries (max {max})")]
    TooManyUriSanEntries {
        /// Inspection limit.
        max: usize,
    },

    /// A `spiffe://` URI SAN is not a valid subject identifier.
    #[error("invalid subject id in URI SAN: {0}")]
    InvalidSubjectId(#[from] SubjectIdError),

    /// The chain is longer than accepted.
    #[error("certificate chain has too many certificates (max {max})")]
    TooManyCertificates {
        /// Chain length limit.
        max: usize,
    },
}

/// An error that may arise decoding private keys.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum PrivateKeyError {
    /// The bytes are not an unencrypted PKCS#8 private key.
    #[error("failed decoding PKCS#8 private key")]
    DecodePkcs8(pkcs8::Error),
}
