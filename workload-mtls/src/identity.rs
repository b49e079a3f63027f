//! The verified peer identity of an established connection.

use rustls::pki_types::CertificateDer;
use workload_identity::cert::subject_id_from_der;
use workload_identity::SubjectId;

use crate::error::HandshakeError;

/// The subject id of a peer that passed verification and authorization.
///
/// This is the only per-connection state kept after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    subject_id: SubjectId,
}

impl PeerIdentity {
    /// Wraps a verified subject id.
    pub fn new(subject_id: SubjectId) -> Self {
        Self { subject_id }
    }

    /// Returns the peer's subject id.
    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Consumes the identity, returning the subject id.
    pub fn into_subject_id(self) -> SubjectId {
        self.subject_id
    }
}

/// Reads the subject id from the leaf of a chain rustls has already verified.
pub(crate) fn peer_identity(
    peer_certs: Option<&[CertificateDer<'_>]>,
) -> Result<PeerIdentity, HandshakeError> {
    let leaf = peer_certs
        .and_then(<[_]>::first)
        .ok_or(HandshakeError::MissingPeerIdentity)?;

    subject_id_from_der(leaf.as_ref())
        .map(PeerIdentity::new)
        .map_err(|_| HandshakeError::MissingPeerIdentity)
}
