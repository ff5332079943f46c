//! UDP socket plumbing shared by client and host.
//!
//! Thin wrapper over socket2/std so every socket in the crate gets the same
//! treatment: address reuse, bounded receive timeouts (so `running` flag
//! checks are never more than one timeout late), and enlarged kernel buffers
//! for audio bursts.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Receive timeout used by every polling loop in the crate.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Kernel buffer size requested for streaming sockets.
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// A bound UDP endpoint with a receive timeout.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpEndpoint {
    /// Bind to `local_addr` for receiving.
    ///
    /// The socket gets address reuse (quick restarts), a [`POLL_TIMEOUT`]
    /// receive timeout and 1 MB kernel buffers.
    pub fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let domain = Domain::for_address(local_addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;

        let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
        let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;

        Ok(UdpEndpoint { socket, local_addr })
    }

    /// Create an unbound (OS-assigned port) non-blocking send socket.
    ///
    /// Used by the transmit paths: a send that the OS will not accept
    /// immediately is dropped rather than stalling the audio cadence.
    pub fn sender() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;

        let local: SocketAddr = ([0, 0, 0, 0], 0).into();
        socket.bind(&local.into())?;

        let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;

        Ok(UdpEndpoint { socket, local_addr })
    }

    /// Send one datagram. `Ok(n)` with `n == data.len()` means the OS took
    /// the whole datagram in a single call.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    /// Receive one datagram with the sender address. Times out with
    /// `WouldBlock`/`TimedOut` after [`POLL_TIMEOUT`].
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    /// Bytes still queued in the kernel receive buffer.
    ///
    /// This is the admission-time backpressure signal: a deep backlog after a
    /// read means the pipeline is draining slower than the client sends.
    /// Returns 0 if the ioctl is unavailable.
    pub fn backlog_bytes(&self) -> usize {
        backlog_bytes_impl(&self.socket)
    }

    /// Local address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Clone the endpoint. The clone shares the underlying OS socket.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(UdpEndpoint {
            socket: self.socket.try_clone()?,
            local_addr: self.local_addr,
        })
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(unix)]
fn backlog_bytes_impl(socket: &UdpSocket) -> usize {
    use std::os::unix::io::AsRawFd;

    let mut available: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::FIONREAD, &mut available) };
    if rc < 0 {
        return 0;
    }
    available.max(0) as usize
}

#[cfg(windows)]
fn backlog_bytes_impl(socket: &UdpSocket) -> usize {
    use std::os::windows::io::AsRawSocket;
    use windows_sys::Win32::Networking::WinSock::{ioctlsocket, FIONREAD, SOCKET};

    let mut available: u32 = 0;
    let rc = unsafe {
        ioctlsocket(
            socket.as_raw_socket() as SOCKET,
            FIONREAD,
            &mut available,
        )
    };
    if rc != 0 {
        return 0;
    }
    available as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_assigns_port() {
        let ep = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(ep.local_addr().port(), 0);
    }

    #[test]
    fn test_sender_is_nonblocking_and_routable() {
        let receiver = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let sender = UdpEndpoint::sender().unwrap();

        let sent = sender.send_to(b"hello", receiver.local_addr()).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let (len, _from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn test_recv_times_out() {
        let ep = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let err = ep.recv_from(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_backlog_counts_queued_bytes() {
        let receiver = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let sender = UdpEndpoint::sender().unwrap();

        assert_eq!(receiver.backlog_bytes(), 0);
        sender.send_to(&[0u8; 64], receiver.local_addr()).unwrap();

        // Give the kernel a moment to queue the datagram.
        let mut backlog = 0;
        for _ in 0..50 {
            backlog = receiver.backlog_bytes();
            if backlog > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(backlog >= 64);
    }
}
