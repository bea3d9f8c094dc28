// SPDX-License-Identifier: AGPL-3.0-only

use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use tracing::debug;

use super::Transport;

/// Shortest read timeout handed to the socket; zero means "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// UDP socket connected to one SpiNNaker Ethernet chip or BMP.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved or the socket cannot
    /// be created.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((host, port))?;
        debug!(host, port, local = ?socket.local_addr().ok(), "UDP transport connected");
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        match self.socket.send(datagram) {
            Ok(_) => Ok(()),
            // A refusal of an earlier datagram can surface here; this one is
            // dropped and left to the retry timer.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(error = %e, "Send refused by peer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            // ICMP port unreachable, e.g. while the board reboots.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(error = %e, "Datagram refused by peer");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_round_trip() {
        let peer = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = peer.local_addr().unwrap().port();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();

        transport.send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).unwrap();
        let n = transport.recv(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(n.map(|n| &buf[..n]), Some(&b"pong"[..]));
    }

    #[test]
    fn refused_datagram_reads_as_loss() {
        let port = {
            let closed = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
            closed.local_addr().unwrap().port()
        };
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();
        transport.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(transport.recv(&mut buf, Duration::from_millis(50)).unwrap(), None);
        transport.send(b"ping").unwrap();
        transport.send(b"ping").unwrap();
        assert_eq!(transport.recv(&mut buf, Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    fn silence_is_not_an_error() {
        let peer = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = peer.local_addr().unwrap().port();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(transport.recv(&mut buf, Duration::ZERO).unwrap(), None);
    }
}
