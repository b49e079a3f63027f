//! Identity provider endpoints and the gRPC channel connector.

pub mod connector;
pub mod endpoint;
pub mod error;

pub use connector::connect;
pub use endpoint::{Endpoint, EndpointError};
pub use error::TransportError;
