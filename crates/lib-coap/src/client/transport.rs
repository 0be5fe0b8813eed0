use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Datagram seam between the client runtime and the host's sockets. The
/// default is [`UdpTransport`]; tests and alternative stacks plug their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive one datagram into `buf`, returning its length and source.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `to`.
    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;
}

/// UDP egress/ingress with independent IPv4 and IPv6 sockets; the remote
/// address family picks the socket. Binding either family may fail on
/// single-stack hosts, which only becomes an error when a datagram actually
/// needs the missing family.
pub struct UdpTransport {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
}

impl UdpTransport {
    /// Bind ephemeral sockets for both families. At least one must succeed.
    pub async fn bind() -> io::Result<Self> {
        let v4 = UdpSocket::bind("0.0.0.0:0").await.ok();
        let v6 = UdpSocket::bind("[::]:0").await.ok();

        if v4.is_none() && v6.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "neither an IPv4 nor an IPv6 socket could be bound",
            ));
        }

        Ok(Self { v4, v6 })
    }

    fn socket_for(&self, addr: &SocketAddr) -> io::Result<&UdpSocket> {
        let socket = match addr {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };

        socket.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no socket for the address family of {}", addr),
            )
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            // Wait for readiness on whichever sockets exist, then try a
            // non-blocking read; readiness can be a false positive.
            let socket = match (&self.v4, &self.v6) {
                (Some(v4), Some(v6)) => {
                    tokio::select! {
                        result = v4.readable() => {
                            result?;
                            v4
                        }
                        result = v6.readable() => {
                            result?;
                            v6
                        }
                    }
                }
                (Some(v4), None) => {
                    v4.readable().await?;
                    v4
                }
                (None, Some(v6)) => {
                    v6.readable().await?;
                    v6
                }
                (None, None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "no sockets",
                    ))
                }
            };

            match socket.try_recv_from(buf) {
                Ok(result) => return Ok(result),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn send(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket_for(&to)?.send_to(buf, to).await
    }
}
