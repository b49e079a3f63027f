//! Exact-match authorization over canonical subject ids.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use workload_identity::{ErrorKind, SubjectId, SubjectIdError};

use crate::authorizer::Authorizer;

/// Errors building an [`AuthorizationPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// No subject ids were given.
    #[error("authorization policy must accept at least one subject id")]
    Empty,

    /// One of the accepted ids is not a valid subject id.
    #[error("invalid accepted subject id {input:?}: {source}")]
    InvalidSubjectId {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        #[source]
        source: SubjectIdError,
    },
}

impl PolicyError {
    /// Always [`ErrorKind::Configuration`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// The set of peer subject ids allowed to connect.
///
/// Membership is exact equality of canonical serialisations: the scheme and trust domain
/// compare case-insensitively (they are lowercased on parse), the path is case-sensitive,
/// and there is no prefix or wildcard matching.
///
/// ```
/// use workload_mtls::AuthorizationPolicy;
///
/// let policy = AuthorizationPolicy::from_subject_ids(["spiffe://example.org/client"])?;
/// assert!(policy.accepts("SPIFFE://Example.org/client"));
/// assert!(!policy.accepts("spiffe://example.org/client/admin"));
/// assert!(!policy.accepts("spiffe://example.org/Client"));
/// # Ok::<(), workload_mtls::PolicyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPolicy {
    accepted: Arc<BTreeSet<SubjectId>>,
}

impl AuthorizationPolicy {
    /// Parses every entry as a subject id.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Empty`] for an empty list and
    /// [`PolicyError::InvalidSubjectId`] for the first malformed entry.
    pub fn from_subject_ids<I, S>(ids: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut accepted = BTreeSet::new();
        for id in ids {
            let input = id.as_ref();
            let subject_id =
                SubjectId::new(input).map_err(|source| PolicyError::InvalidSubjectId {
                    input: input.to_string(),
                    source,
                })?;
            accepted.insert(subject_id);
        }

        if accepted.is_empty() {
            return Err(PolicyError::Empty);
        }

        Ok(Self {
            accepted: Arc::new(accepted),
        })
    }

    /// Parses `peer` and checks membership. Unparsable input is never accepted.
    pub fn accepts(&self, peer: &str) -> bool {
        SubjectId::new(peer).is_ok_and(|id| self.accepts_id(&id))
    }

    /// Checks membership of an already-parsed subject id.
    pub fn accepts_id(&self, peer: &SubjectId) -> bool {
        self.accepted.contains(peer)
    }

    /// Iterates the accepted ids in canonical order.
    pub fn accepted(&self) -> impl Iterator<Item = &SubjectId> {
        self.accepted.iter()
    }
}

impl fmt::Display for AuthorizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.accepted.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

impl Authorizer for AuthorizationPolicy {
    fn authorize(&self, peer: &SubjectId) -> bool {
        self.accepts_id(peer)
    }
}
