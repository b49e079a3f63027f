//! The workload's own X.509 identity: certificate chain, private key and subject id.

mod validations;

use time::OffsetDateTime;

use crate::cert::error::{CertificateError, PrivateKeyError};
use crate::cert::parsing::{
    extract_single_subject_id, not_after, parse_der_encoded_bytes_as_x509_certificate,
    to_certificate_vec, MAX_CERT_CHAIN_LENGTH,
};
use crate::cert::{Certificate, PrivateKey};
use crate::error::ErrorKind;
use crate::identity::validations::{validate_leaf, validate_signing_certificates};
use crate::subject_id::SubjectId;

/// A short-lived X.509 identity.
///
/// Instances are immutable. A rotation produces a new `Identity`; handles to the old
/// one stay valid and unchanged.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Identity {
    subject_id: SubjectId,
    cert_chain: Vec<Certificate>,
    private_key: PrivateKey,
    not_after: OffsetDateTime,
    hint: Option<String>,
}

/// An error that may arise parsing an [`Identity`] from DER inputs.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum IdentityError {
    /// The chain holds no certificates.
    #[error("no certificates found in chain")]
    EmptyChain,

    /// The leaf is a CA certificate.
    #[error("leaf certificate must not have CA flag set to true")]
    LeafHasCaFlag,

    /// The leaf allows CRL signing.
    #[error("leaf certificate must not have 'cRLSign' set as key usage")]
    LeafHasCrlSign,

    /// The leaf allows certificate signing.
    #[error("leaf certificate must not have 'keyCertSign' set as key usage")]
    LeafHasKeyCertSign,

    /// The leaf lacks digital signature usage.
    #[error("leaf certificate must have 'digitalSignature' set as key usage")]
    LeafMissingDigitalSignature,

    /// An intermediate is not a CA.
    #[error("signing certificate must have CA flag set to true")]
    SigningCertMissingCa,

    /// An intermediate cannot sign certificates.
    #[error("signing certificate must have 'keyCertSign' set as key usage")]
    SigningCertMissingKeyCertSign,

    /// An extension is present but its content could not be parsed.
    #[error("X.509 extension {extension} could not be parsed")]
    UnparseableExtension {
        /// Extension name.
        extension: &'static str,
    },

    /// The certificate chain is invalid.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// The private key is invalid.
    #[error(transparent)]
    PrivateKey(#[from] PrivateKeyError),
}

impl IdentityError {
    /// Always [`ErrorKind::IdentityFormat`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::IdentityFormat
    }
}

impl Identity {
    /// Parses an identity from a concatenated DER chain (leaf first) and a PKCS#8 key.
    ///
    /// The leaf must carry exactly one subject id, must not be a CA and must allow
    /// digital signatures; intermediates must be CAs allowed to sign certificates.
    pub fn parse_from_der(
        cert_chain_der: &[u8],
        private_key_der: &[u8],
    ) -> Result<Self, IdentityError> {
        let cert_chain = to_certificate_vec(cert_chain_der, Some(MAX_CERT_CHAIN_LENGTH))?;

        let Some(leaf) = cert_chain.first() else {
            return Err(IdentityError::EmptyChain);
        };

        let x509 = parse_der_encoded_bytes_as_x509_certificate(leaf.as_bytes())?;
        validate_leaf(&x509)?;
        let subject_id = extract_single_subject_id(&x509)?;
        let not_after = not_after(&x509);

        validate_signing_certificates(&cert_chain[1..])?;
        let private_key = PrivateKey::try_from(private_key_der)?;

        Ok(Identity {
            subject_id,
            cert_chain,
            private_key,
            not_after,
            hint: None,
        })
    }

    /// Attaches the provider's hint. Empty hints are dropped.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint = hint.into();
        self.hint = (!hint.is_empty()).then_some(hint);
        self
    }

    /// Returns the subject id of the leaf certificate.
    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Returns the chain, leaf first.
    pub fn cert_chain(&self) -> &[Certificate] {
        &self.cert_chain
    }

    /// Returns the leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        // `parse_from_der` rejects empty chains.
        &self.cert_chain[0]
    }

    /// Returns the private key matching the leaf.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Returns the leaf's notAfter.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Returns the provider's hint, if one was given.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Returns `true` once `now` has reached the leaf's notAfter.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }
}
