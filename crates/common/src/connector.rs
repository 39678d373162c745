//! Stream connector abstraction
//!
//! Sessions and the notification listener open their connections through a
//! [`Connector`], so the same code runs over vsock, Unix sockets or an
//! in-memory pipe in tests.

use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream usable as a broker connection
pub trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

/// Type-erased broker stream
pub type BoxedStream = Box<dyn BrokerStream>;

/// Opens new stream connections to one fixed broker endpoint
///
/// Every call to [`connect`](Self::connect) yields a fresh, independent
/// stream. Connectors are cheap to clone so the listener can own one.
pub trait Connector: Clone + Send + Sync + 'static {
    /// Stream type produced by this connector
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new connection
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human-readable address, used in logs and errors
    fn describe(&self) -> String;
}
