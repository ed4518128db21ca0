// UDP transport for DNS messages
//
// One socket per session. A background task drains the socket into a
// bounded channel so the session driver never blocks on recv while it has
// packets to prepare.

use super::Result;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest datagram we accept
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// A received DNS message
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

/// Shared UDP socket for DNS queries or responses
#[derive(Debug, Clone)]
pub struct DnsSocket {
    socket: Arc<UdpSocket>,
}

impl DnsSocket {
    /// Bind UDP socket
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        log::debug!("DNS socket bound on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one message; transient failures are reported as `Ok(false)`
    pub async fn send_to(&self, packet: &[u8], dest: SocketAddr) -> Result<bool> {
        match self.socket.send_to(packet, dest).await {
            Ok(_) => Ok(true),
            Err(e) if is_transient_udp_error(&e) => {
                log::debug!("transient send error to {}: {}", dest, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (len, peer) = self.socket.recv_from(buf).await?;
        Ok((len, normalize_dual_stack_addr(peer)))
    }

    /// Spawn a reader task feeding a bounded channel
    ///
    /// The task exits when the receiver is dropped or the socket fails.
    pub fn spawn_receiver(&self, capacity: usize) -> mpsc::Receiver<Datagram> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let socket = self.socket.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) if is_transient_udp_error(&e) => continue,
                    Err(e) => {
                        log::warn!("DNS socket receive failed: {}", e);
                        break;
                    }
                };
                let datagram = Datagram {
                    data: buf[..len].to_vec(),
                    peer: normalize_dual_stack_addr(peer),
                };
                if tx.send(datagram).await.is_err() {
                    break;
                }
            }
        });

        rx
    }
}

/// Errors worth retrying rather than tearing the session down
///
/// Routing loss (no route to the network or host) is usually brief, so it
/// counts as transient. Refused or reset sockets do not.
pub fn is_transient_udp_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::ENETUNREACH || code == libc::EHOSTUNREACH
    )
}

/// Collapse IPv4-mapped IPv6 addresses so peers compare equal across socket families
pub fn normalize_dual_stack_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mapped_addr() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:53".parse().unwrap();
        assert_eq!(
            normalize_dual_stack_addr(mapped),
            "192.0.2.1:53".parse::<SocketAddr>().unwrap()
        );

        let plain: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(normalize_dual_stack_addr(plain), plain);
    }

    #[test]
    fn test_transient_udp_errors() {
        assert!(is_transient_udp_error(&io::Error::from_raw_os_error(libc::ENETUNREACH)));
        assert!(is_transient_udp_error(&io::Error::from_raw_os_error(libc::EHOSTUNREACH)));
        assert!(is_transient_udp_error(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient_udp_error(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_transient_udp_error(&io::Error::from(io::ErrorKind::Interrupted)));

        assert!(!is_transient_udp_error(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient_udp_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient_udp_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_loopback_receiver() {
        let server = DnsSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = DnsSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut rx = server.spawn_receiver(4);

        let sent = client
            .send_to(b"query", server.local_addr().unwrap())
            .await
            .unwrap();
        assert!(sent);

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.data, b"query");
        assert_eq!(datagram.peer, client.local_addr().unwrap());
    }
}
