use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use thiserror::Error;

use crate::constants::DEFAULT_PORT;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("Invalid endpoint port: {0}")]
    InvalidPort(String),
}

/// A remote UDP endpoint. Used as the left half of transaction and exchange
/// keys, so two endpoints naming the same peer must compare equal. Addresses
/// are stored as parsed [`IpAddr`] values, which makes textual IPv6 variants
/// (`::1`, `0:0:0:0:0:0:0:1`) structurally identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    addr: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// The host part as it appears in a URI: IPv6 addresses are expanded to
    /// eight lower-case 4-digit groups and bracketed, IPv4 addresses are kept
    /// verbatim.
    pub fn host(&self) -> String {
        match self.addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => {
                let groups = v6
                    .segments()
                    .iter()
                    .map(|s| format!("{:04x}", s))
                    .collect::<Vec<_>>()
                    .join(":");
                format!("[{}]", groups)
            }
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{}", self.host())
        } else {
            write!(f, "{}:{}", self.host(), self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Accepts `host`, `host:port` and `[v6]:port` forms. A bare host uses
    /// the default port 5683.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let trimmed = s.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(addr) => Ok(Self::new(addr, DEFAULT_PORT)),
            Err(_) => Err(EndpointError::InvalidAddress(s.to_string())),
        }
    }
}
