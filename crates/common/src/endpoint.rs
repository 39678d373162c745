//! Broker endpoint addressing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Context id of the host side of vsock (`VMADDR_CID_HOST`)
pub const DEFAULT_BROKER_CID: u32 = 2;

/// Port the broker listens on
pub const DEFAULT_BROKER_PORT: u32 = 2000;

/// vsock address of the broker: (peer context id, port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub cid: u32,
    pub port: u32,
}

impl Endpoint {
    pub const fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_CID, DEFAULT_BROKER_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vsock://{}:{}", self.cid, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = crate::Error;

    /// Parse `cid:port`, with or without a `vsock://` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| crate::Error::InvalidEndpoint {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let addr = s.strip_prefix("vsock://").unwrap_or(s);
        let (cid, port) = addr
            .split_once(':')
            .ok_or_else(|| invalid("expected <cid>:<port>"))?;

        let cid = cid.parse().map_err(|_| invalid("cid is not a number"))?;
        let port = port.parse().map_err(|_| invalid("port is not a number"))?;

        Ok(Self::new(cid, port))
    }
}
