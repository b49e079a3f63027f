//! Error classification shared by every crate in the workspace.

use std::fmt;

/// Coarse classification of a failure.
///
/// Each error type in this crate (and in `workload-mtls`) exposes a `kind()` method so
/// callers can branch on the category without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The identity provider is unreachable, the stream failed, or the initial fetch timed out.
    Connection,
    /// The provider sent a chain, key, bundle or subject id that cannot be used.
    IdentityFormat,
    /// Operator-supplied configuration is invalid.
    Configuration,
    /// A peer failed verification or authorization during a handshake.
    Authorization,
    /// The identity source was closed.
    Closed,
}

impl ErrorKind {
    /// Stable lowercase name, used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::IdentityFormat => "identity_format",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Closed => "closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
