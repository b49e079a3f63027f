use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::oid::Oid;
use x509_parser::error::X509Error;
use x509_parser::extensions::ParsedExtension;
use x509_parser::nom::Err;
use x509_parser::oid_registry;
use x509_parser::prelude::GeneralName;

use crate::cert::error::CertificateError;
use crate::cert::Certificate;
use crate::subject_id::SubjectId;

const SUBJECT_URI_PREFIX: &str = "spiffe://";
const MAX_URI_SAN_ENTRIES: usize = 32;
const MAX_URI_LENGTH: usize = 2048;

/// Upper bound on the length of an identity chain (leaf plus intermediates).
pub(crate) const MAX_CERT_CHAIN_LENGTH: usize = 16;

/// Splits concatenated DER certificates. `max` bounds the count; bundles pass `None`
/// and rely on the byte-size resource limit instead.
pub(crate) fn to_certificate_vec(
    der: &[u8],
    max: Option<usize>,
) -> Result<Vec<Certificate>, CertificateError> {
    let mut rest = der;
    let mut certs = Vec::new();

    while !rest.is_empty() {
        if let Some(max) = max {
            if certs.len() >= max {
                return Err(CertificateError::TooManyCertificates { max });
            }
        }

        let (new_rest, _) = x509_parser::parse_x509_certificate(rest).map_err(map_nom_err)?;
        let cert_len = rest.len() - new_rest.len();
        certs.push(Certificate(rest[..cert_len].to_vec()));
        rest = new_rest;
    }

    Ok(certs)
}

pub(crate) fn parse_der_encoded_bytes_as_x509_certificate(
    der_bytes: &[u8],
) -> Result<X509Certificate<'_>, CertificateError> {
    x509_parser::parse_x509_certificate(der_bytes)
        .map(|(_, cert)| cert)
        .map_err(map_nom_err)
}

fn map_nom_err(e: Err<X509Error>) -> CertificateError {
    match e {
        Err::Incomplete(_) => CertificateError::ParseX509Certificate(X509Error::InvalidCertificate),
        Err::Error(err) | Err::Failure(err) => CertificateError::ParseX509Certificate(err),
    }
}

pub(crate) fn get_x509_extension<'a>(
    cert: &'a X509Certificate<'_>,
    oid: &Oid<'static>,
) -> Result<&'a ParsedExtension<'a>, CertificateError> {
    match cert.tbs_certificate.get_extension_unique(oid)? {
        None => Err(CertificateError::MissingX509Extension(oid.clone())),
        Some(ext) => Ok(ext.parsed_extension()),
    }
}

pub(crate) fn not_after(cert: &X509Certificate<'_>) -> OffsetDateTime {
    cert.validity().not_after.to_datetime()
}

/// Returns every subject id found in the URI SAN. Any `spiffe://` URI must parse.
pub(crate) fn extract_subject_ids_from_uri_san(
    cert: &X509Certificate<'_>,
) -> Result<Vec<SubjectId>, CertificateError> {
    let ext = get_x509_extension(cert, &oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)?;

    let ParsedExtension::SubjectAlternativeName(san) = ext else {
        return Err(CertificateError::UnexpectedExtension(format!("{ext:?}")));
    };

    let mut ids = Vec::new();
    let mut uri_count = 0usize;

    for name in &san.general_names {
        let GeneralName::URI(uri) = name else {
            continue;
        };

        uri_count += 1;
        if uri_count > MAX_URI_SAN_ENTRIES {
            return Err(CertificateError::TooManyUriSanEntries {
                max: MAX_URI_SAN_ENTRIES,
            });
        }

        if uri.len() > MAX_URI_LENGTH || !has_subject_scheme(uri) {
            continue;
        }

        ids.push(SubjectId::new(uri)?);
    }

    Ok(ids)
}

pub(crate) fn extract_single_subject_id(
    cert: &X509Certificate<'_>,
) -> Result<SubjectId, CertificateError> {
    let mut ids = extract_subject_ids_from_uri_san(cert)?.into_iter();

    let Some(first) = ids.next() else {
        return Err(CertificateError::MissingSubjectId);
    };
    if ids.next().is_some() {
        return Err(CertificateError::MultipleSubjectIds);
    }

    Ok(first)
}

fn has_subject_scheme(uri: &str) -> bool {
    uri.get(..SUBJECT_URI_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(SUBJECT_URI_PREFIX))
}
