//! Request/response session with the broker
//!
//! [`ApiClient`] wraps one [`Transport`] plus a frame decoder. A call sends
//! one request frame and then blocks for the next complete frame on the
//! connection, which it returns unexamined. Faults are reported, never
//! retried; retry policy belongs to the callers.

use common::Connector;
use protocol::{DeviceList, Frame, FrameDecoder, READ_CHUNK_SIZE, Request, encode_frame};
use tracing::{debug, error, info, warn};

use crate::error::{ApiError, Result};
use crate::transport::{ConnectionState, Transport};

/// Session with the broker's control API
pub struct ApiClient<C: Connector> {
    connector: C,
    transport: Option<Transport<C::Stream>>,
    decoder: FrameDecoder,
    max_frame_size: Option<usize>,
}

impl<C: Connector> ApiClient<C> {
    /// Create an unconnected session
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            transport: None,
            decoder: FrameDecoder::new(),
            max_frame_size: None,
        }
    }

    /// Bound the size of a single incoming frame
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self.decoder = FrameDecoder::with_max_frame_size(max_frame_size);
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map_or(ConnectionState::Unconnected, Transport::state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open a fresh connection, unless one is already open
    ///
    /// A closed connection is never reused; this replaces it.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let transport = Transport::connect(&self.connector).await?;
        self.transport = Some(transport);
        self.decoder = match self.max_frame_size {
            Some(max) => FrameDecoder::with_max_frame_size(max),
            None => FrameDecoder::new(),
        };
        Ok(())
    }

    /// Close the connection; safe to call at any time
    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
    }

    /// Send `request` and return the next frame received
    pub async fn call(&mut self, request: &Request) -> Result<Frame> {
        let action = request.action();
        let bytes = encode_frame(request)?;

        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ApiError::NotConnected.during(action))?;

        debug!("-> {}", String::from_utf8_lossy(&bytes).trim_end());
        transport.send(&bytes).await.map_err(|e| e.during(action))?;

        self.read_frame(action).await
    }

    /// Wait for the next frame without sending anything
    ///
    /// Used by the notification listener once subscribed.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        self.read_frame("receive").await
    }

    async fn read_frame(&mut self, action: &'static str) -> Result<Frame> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            while let Some(decoded) = self.decoder.next_frame() {
                match decoded {
                    Ok(frame) => {
                        debug!("<- {}", frame);
                        return Ok(frame);
                    }
                    Err(e) => warn!("Dropping malformed frame from broker: {}", e),
                }
            }

            let transport = self
                .transport
                .as_mut()
                .ok_or_else(|| ApiError::NotConnected.during(action))?;

            let n = transport
                .receive(&mut chunk)
                .await
                .map_err(|e| e.during(action))?;

            if n == 0 {
                info!("API connection closed by broker");
                self.decoder.clear();
                return Err(ApiError::closed_by_peer(action));
            }

            self.decoder.feed(&chunk[..n]);
        }
    }

    /// Subscribe this connection to push notifications
    ///
    /// A non-ok reply is logged, not treated as a failure.
    pub async fn enable_notifications(&mut self) -> Result<Frame> {
        let reply = self.call(&Request::EnableNotifications).await?;
        if !reply.is_ok() {
            error!("Failed to enable notifications: {}", reply);
        }
        Ok(reply)
    }

    /// Fetch the broker's device list
    pub async fn list_devices(&mut self) -> Result<DeviceList> {
        let reply = self.call(&Request::UsbList).await?;
        if !reply.is_ok() {
            return Err(ApiError::Rejected {
                action: Request::UsbList.action(),
                reply,
            });
        }

        let list = DeviceList::from_frame(&reply)?;
        for rejected in &list.rejected {
            warn!("Skipping undecodable device entry: {}", rejected);
        }
        Ok(list)
    }

    /// Ask the broker to pass `device_node` to `vm`; the reply is returned as-is
    pub async fn attach(&mut self, device_node: &str, vm: &str) -> Result<Frame> {
        self.call(&Request::UsbAttach {
            device_node: device_node.to_string(),
            vm: vm.to_string(),
        })
        .await
    }

    /// Ask the broker to take `device_node` back from its VM
    pub async fn detach(&mut self, device_node: &str) -> Result<Frame> {
        self.call(&Request::UsbDetach {
            device_node: device_node.to_string(),
        })
        .await
    }
}
