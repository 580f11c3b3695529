//! Tunnel socket setup.
//!
//! One UDP socket per tunnel, connected to the single peer. The client
//! resolves and connects; the server binds and waits for the peer's first
//! datagram (peeked, not consumed) to learn its address before connecting,
//! so the kernel filters every other source from then on.

use std::io::{self, IoSliceMut};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::unix::io::AsRawFd;

use nix::sys::socket::{MsgFlags, SockaddrLike, SockaddrStorage, recvmsg};
use tracing::info;

/// Resolve `host:port` and connect a UDP socket to the first address that
/// accepts one.
pub fn connect(host: &str, port: u16) -> io::Result<UdpSocket> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let bind_addr: SocketAddr = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        };
        let socket = match UdpSocket::bind(bind_addr) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        match socket.connect(addr) {
            Ok(()) => {
                info!(peer = %addr, "connected to tunnel peer");
                return Ok(socket);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {host}"))
    }))
}

/// Bind to `addr:port`, wait for the first datagram to learn the peer, and
/// connect to it.
pub fn listen(addr: &str, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((addr, port))?;
    info!(addr, port, "waiting for initial datagram from peer");
    let peer = peek_peer(&socket)?;
    socket.connect(peer)?;
    info!(peer = %peer, "learned tunnel peer");
    Ok(socket)
}

/// Learn the source address of the next datagram without consuming it.
fn peek_peer(socket: &UdpSocket) -> io::Result<SocketAddr> {
    let mut scratch = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut scratch)];
    let msg = recvmsg::<SockaddrStorage>(socket.as_raw_fd(), &mut iov, None, MsgFlags::MSG_PEEK)?;
    let addr = msg
        .address
        .ok_or_else(|| io::Error::other("datagram carried no source address"))?;
    sockaddr_to_std(&addr)
}

fn sockaddr_to_std(addr: &SockaddrStorage) -> io::Result<SocketAddr> {
    if let Some(sin) = addr.as_sockaddr_in() {
        return Ok(SocketAddr::new(IpAddr::V4(sin.ip()), sin.port()));
    }
    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Ok(SocketAddr::new(IpAddr::V6(sin6.ip()), sin6.port()));
    }
    Err(io::Error::other(format!(
        "unsupported peer address family {:?}",
        addr.family()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        let client = connect("127.0.0.1", port).unwrap();
        client.send(b"hi").unwrap();

        let mut buf = [0u8; 8];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[test]
    fn test_listen_learns_peer_without_consuming() {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();

        // Bind the server first on an ephemeral port.
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        drop(server);

        let handle = std::thread::spawn(move || listen("127.0.0.1", port).unwrap());

        // Give the listener a moment to bind, then send the first frame.
        std::thread::sleep(std::time::Duration::from_millis(50));
        probe.send_to(b"frame-one", ("127.0.0.1", port)).unwrap();

        let server = handle.join().unwrap();
        // The peeked datagram is still there.
        let mut buf = [0u8; 32];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"frame-one");
    }
}
