//! UDP datagram primitives
//!
//! Two primitives, matching the deployed protocol's socket discipline:
//!
//! - [`send`] binds a fresh one-shot socket per datagram (fire-and-forget,
//!   no delivery confirmation);
//! - [`Receiver`] holds one long-lived socket for the life of a receive
//!   loop.
//!
//! Because of that split, a node running both roles must use distinct local
//! ports for sending and receiving; the defaults in
//! [`NetworkConfig`](crate::config::NetworkConfig) keep them disjoint.
//!
//! Receive loops are cancelled cooperatively: a short socket read timeout
//! lets the loop poll both the daemon-wide running flag and its own alive
//! flag between datagrams, and a `STOP` datagram unblocks a loop from the
//! network side.

use crate::error::{Error, Result};
use crate::net::codec;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receive buffer size. Frames are short text; 2KB leaves ample headroom.
const RECV_BUFFER_SIZE: usize = 2048;

/// How long a blocking read waits before re-checking cancellation flags
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Send one frame from `local` to `remote` on a one-shot socket.
///
/// Empty frames are suppressed (an empty field list encodes to an empty
/// frame, and zero-byte datagrams carry no information). Failures are
/// returned for the caller to log and abandon; there is no retry.
pub fn send(local: SocketAddr, remote: SocketAddr, frame: &[u8]) -> Result<()> {
    if frame.is_empty() {
        log::debug!("suppressing empty frame to {}", remote);
        return Ok(());
    }
    let socket = UdpSocket::bind(local)
        .map_err(|e| Error::Transport(format!("bind {}: {}", local, e)))?;
    socket
        .send_to(frame, remote)
        .map_err(|e| Error::Transport(format!("send to {}: {}", remote, e)))?;
    Ok(())
}

/// Why a receive loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    /// A `STOP` sentinel arrived (not dispatched to the handler)
    Stopped,
    /// The running or alive flag was cleared
    Cancelled,
}

/// Blocking per-datagram UDP receive loop
pub struct Receiver {
    socket: UdpSocket,
    /// Daemon-wide shutdown flag
    running: Arc<AtomicBool>,
    /// Per-loop flag; cleared by the handler or owner to end this loop only
    alive: Arc<AtomicBool>,
    /// Post-dispatch pacing delay (deployment parity; tunable)
    throttle: Duration,
}

impl Receiver {
    /// Bind a receive loop to a local address
    pub fn bind(
        local: SocketAddr,
        running: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
        throttle: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .map_err(|e| Error::Transport(format!("bind {}: {}", local, e)))?;
        socket.set_read_timeout(Some(READ_POLL_TIMEOUT))?;
        Ok(Self {
            socket,
            running,
            alive,
            throttle,
        })
    }

    /// Address the socket is actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the loop, invoking `on_message` synchronously per decoded
    /// datagram.
    ///
    /// The termination check precedes dispatch: the handler never sees the
    /// `STOP` sentinel. Undecodable datagrams are dropped and the loop
    /// continues.
    pub fn run<F>(&self, mut on_message: F) -> Result<ReceiverExit>
    where
        F: FnMut(Vec<String>),
    {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        while self.running.load(Ordering::Relaxed) && self.alive.load(Ordering::Relaxed) {
            let (len, from) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(Error::Transport(format!("recv: {}", e))),
            };

            let fields = match codec::decode(&buffer[..len]) {
                Ok(fields) => fields,
                Err(e) => {
                    log::debug!("dropping undecodable datagram from {}: {}", from, e);
                    continue;
                }
            };

            if codec::is_stop(&fields) {
                log::info!("STOP received from {}", from);
                return Ok(ReceiverExit::Stopped);
            }

            on_message(fields);

            if !self.throttle.is_zero() {
                std::thread::sleep(self.throttle);
            }
        }

        Ok(ReceiverExit::Cancelled)
    }
}
