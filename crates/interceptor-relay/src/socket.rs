//! Shared socket handle for one side of a live connection.
//!
//! The bridge owns every socket. Workers and plans only borrow a
//! [`PeerSocket`] through an `Arc` to read or send; only the bridge's
//! teardown calls [`PeerSocket::close`].

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use interceptor_core::SocketOptions;
use socket2::SockRef;
use tokio::net::TcpStream;

/// Apply per-socket options to a freshly accepted or connected stream.
pub fn configure(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.nodelay)?;
    SockRef::from(stream).set_linger(options.linger())?;
    Ok(())
}

/// One side (client or target) of a phase's socket pair.
#[derive(Debug)]
pub struct PeerSocket {
    stream: TcpStream,
    peer: SocketAddr,
    phase: u64,
    closed: AtomicBool,
}

impl PeerSocket {
    pub fn new(stream: TcpStream, peer: SocketAddr, phase: u64) -> Self {
        Self {
            stream,
            peer,
            phase,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The bridge phase this socket was committed in.
    pub fn phase(&self) -> u64 {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the socket may be readable.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Non-blocking read. `Ok(0)` means the peer closed its side.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    /// Write all of `data`, waiting for writability as needed.
    ///
    /// Fails with `NotConnected` once the socket has been closed by a
    /// teardown, even if the kernel would still accept the bytes.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.is_closed() {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket closed by teardown",
                ));
            }
            self.stream.writable().await?;
            match self.stream.try_write(rest) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Shut the socket down in both directions.
    ///
    /// Wakes any task blocked in [`readable`](Self::readable). The
    /// descriptor itself is released once the last `Arc` is dropped.
    /// Closing twice reports `NotConnected`.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket already closed",
            ));
        }
        SockRef::from(&self.stream).shutdown(Shutdown::Both)
    }
}
