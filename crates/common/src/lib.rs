//! Common utilities for the USB passthrough client
//!
//! This crate provides functionality shared by the client library and its
//! tests: broker endpoint addressing, the connector abstraction used to open
//! broker streams, logging setup and error types.

pub mod connector;
pub mod endpoint;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use connector::{BoxedStream, BrokerStream, Connector};
pub use endpoint::{DEFAULT_BROKER_CID, DEFAULT_BROKER_PORT, Endpoint};
pub use error::{Error, Result};
pub use logging::setup_logging;
