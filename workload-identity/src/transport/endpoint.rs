//! Identity provider endpoint parsing.
//!
//! Accepted forms:
//!
//! - `unix:///abs/path` and the shorthand `unix:/abs/path`
//! - `tcp://1.2.3.4:8081` and the shorthand `tcp:1.2.3.4:8081`
//! - a bare filesystem path, absolute or relative, meaning a unix socket
//!   (`/run/agent.sock`, `testing/.cache/sockets/backend.sock`)

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::error::ErrorKind;

const TCP_SCHEME: &str = "tcp";
const UNIX_SCHEME: &str = "unix";

/// Parsed identity provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket.
    Unix(PathBuf),

    /// TCP endpoint; the host must be an IP address.
    Tcp {
        /// IP address.
        host: IpAddr,
        /// Port.
        port: u16,
    },
}

/// Errors returned by [`Endpoint::parse`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EndpointError {
    /// The input is empty.
    #[error("endpoint socket is empty")]
    Empty,

    /// The input could not be parsed as a URI.
    #[error("endpoint socket is not a valid URI")]
    Parse(#[from] url::ParseError),

    /// The URI scheme is not supported.
    #[error("endpoint socket URI scheme must be unix: or tcp:")]
    InvalidScheme,

    /// User info is not allowed.
    #[error("endpoint socket URI must not include user info")]
    HasUserInfo,

    /// Query values are not allowed.
    #[error("endpoint socket URI must not include query values")]
    HasQuery,

    /// Fragments are not allowed.
    #[error("endpoint socket URI must not include a fragment")]
    HasFragment,

    /// `unix:` URIs must not include an authority.
    #[error("unix: endpoint socket URI must not include an authority")]
    UnixAuthorityNotAllowed,

    /// `unix:` URIs must include an absolute path.
    #[error("unix: endpoint socket URI must include a path")]
    UnixMissingPath,

    /// `tcp:` hosts must be IP addresses.
    #[error("tcp: endpoint socket URI host must be an IP address")]
    TcpHostNotIp,

    /// `tcp:` URIs must include a port.
    #[error("tcp: endpoint socket URI must include a port")]
    TcpMissingPort,

    /// `tcp:` URIs must not include a path.
    #[error("tcp: endpoint socket URI must not include a path")]
    TcpUnexpectedPath,
}

impl EndpointError {
    /// Always [`ErrorKind::Configuration`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

impl Endpoint {
    /// Parses and validates an endpoint string.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EndpointError::Empty);
        }

        if is_bare_path(input) {
            return Ok(Self::Unix(PathBuf::from(input)));
        }

        let url = Url::parse(&normalize_endpoint_uri(input))?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(EndpointError::HasUserInfo);
        }
        if url.query().is_some() {
            return Err(EndpointError::HasQuery);
        }
        if url.fragment().is_some() {
            return Err(EndpointError::HasFragment);
        }

        match url.scheme() {
            UNIX_SCHEME => {
                if url.host_str().is_some_and(|h| !h.is_empty()) {
                    return Err(EndpointError::UnixAuthorityNotAllowed);
                }

                let path = url.path();
                if path.is_empty() || path == "/" || !path.starts_with('/') {
                    return Err(EndpointError::UnixMissingPath);
                }

                Ok(Self::Unix(PathBuf::from(path)))
            }

            TCP_SCHEME => {
                let host = match url.host() {
                    Some(url::Host::Ipv4(v4)) => IpAddr::V4(v4),
                    Some(url::Host::Ipv6(v6)) => IpAddr::V6(v6),
                    Some(url::Host::Domain(domain)) => {
                        IpAddr::from_str(domain).map_err(|_| EndpointError::TcpHostNotIp)?
                    }
                    None => return Err(EndpointError::TcpHostNotIp),
                };
                let port = url.port().ok_or(EndpointError::TcpMissingPort)?;

                let path = url.path();
                if !path.is_empty() && path != "/" {
                    return Err(EndpointError::TcpUnexpectedPath);
                }

                Ok(Self::Tcp { host, port })
            }

            _ => Err(EndpointError::InvalidScheme),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) if path.is_absolute() => write!(f, "unix://{}", path.display()),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp {
                host: IpAddr::V6(v6),
                port,
            } => write!(f, "tcp://[{v6}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

// Anything without a `scheme:` prefix is a filesystem path.
fn is_bare_path(input: &str) -> bool {
    if input.starts_with('/') || input.starts_with('.') {
        return true;
    }
    match input.split_once(':') {
        None => true,
        Some((scheme, _)) => scheme.contains('/'),
    }
}

fn normalize_endpoint_uri(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("unix:/") {
        if !rest.starts_with('/') {
            return format!("unix:///{rest}");
        }
    }

    if let Some(rest) = input.strip_prefix("tcp:") {
        if !rest.starts_with("//") {
            return format!("tcp://{rest}");
        }
    }

    input.to_owned()
}
