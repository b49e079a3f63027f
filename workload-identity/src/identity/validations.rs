use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::oid_registry;

use crate::cert::parsing::{get_x509_extension, parse_der_encoded_bytes_as_x509_certificate};
use crate::cert::Certificate;
use crate::identity::IdentityError;

pub(crate) fn validate_leaf(cert: &X509Certificate<'_>) -> Result<(), IdentityError> {
    match get_x509_extension(cert, &oid_registry::OID_X509_EXT_KEY_USAGE)? {
        ParsedExtension::KeyUsage(k) if !k.digital_signature() => {
            return Err(IdentityError::LeafMissingDigitalSignature);
        }
        ParsedExtension::KeyUsage(k) if k.crl_sign() => {
            return Err(IdentityError::LeafHasCrlSign);
        }
        ParsedExtension::KeyUsage(k) if k.key_cert_sign() => {
            return Err(IdentityError::LeafHasKeyCertSign);
        }
        ParsedExtension::KeyUsage(_) => {}
        // A present but unparseable extension must not bypass the checks.
        _ => return Err(IdentityError::UnparseableExtension { extension: "KeyUsage" }),
    }

    match get_x509_extension(cert, &oid_registry::OID_X509_EXT_BASIC_CONSTRAINTS)? {
        ParsedExtension::BasicConstraints(b) if b.ca => Err(IdentityError::LeafHasCaFlag),
        ParsedExtension::BasicConstraints(_) => Ok(()),
        _ => Err(IdentityError::UnparseableExtension {
            extension: "BasicConstraints",
        }),
    }
}

pub(crate) fn validate_signing_certificates(certs: &[Certificate]) -> Result<(), IdentityError> {
    for cert in certs {
        let x509 = parse_der_encoded_bytes_as_x509_certificate(cert.as_bytes())?;
        validate_signing_certificate(&x509)?;
    }
    Ok(())
}

fn validate_signing_certificate(cert: &X509Certificate<'_>) -> Result<(), IdentityError> {
    match get_x509_extension(cert, &oid_registry::OID_X509_EXT_BASIC_CONSTRAINTS)? {
        ParsedExtension::BasicConstraints(b) if b.ca => {}
        ParsedExtension::BasicConstraints(_) => return Err(IdentityError::SigningCertMissingCa),
        _ => {
            return Err(IdentityError::UnparseableExtension {
                extension: "BasicConstraints",
            })
        }
    }

    match get_x509_extension(cert, &oid_registry::OID_X509_EXT_KEY_USAGE)? {
        ParsedExtension::KeyUsage(k) if k.key_cert_sign() => Ok(()),
        ParsedExtension::KeyUsage(_) => Err(IdentityError::SigningCertMissingKeyCertSign),
        _ => Err(IdentityError::UnparseableExtension { extension: "KeyUsage" }),
    }
}
