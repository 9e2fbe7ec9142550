// One Session drives one transfer to a terminal state over its own UDP
// endpoint.
//
// A session is created when the dispatcher accepts a read or write request.
// It binds a fresh socket on an OS-assigned port so concurrent transfers
// never share an endpoint with each other or with the control loop, pins the
// requesting peer as its only correspondent, and then runs the packet
// machine it was given:
//
// - On the send side every exchange is send-then-wait. The frame in flight
//   is retransmitted on each failed attempt (timeout, foreign or malformed
//   datagram, non-matching ack) until the attempt budget runs out.
// - On the receive side acks are sent only in response to datagrams, never
//   speculatively on a timeout. The attempt counter tracks consecutive empty
//   waits for the current block and is refreshed whenever the peer is heard
//   from, even if what arrived was corrupt.
//
// Terminal states are completion, retry exhaustion, and local IO failure.
// Reaching any of them releases the endpoint and the open file.

use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp;
use std::error;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How many times one block is attempted before the transfer is abandoned.
pub const MAX_ATTEMPTS: u32 = 3;

/// How long the send side waits for an ack, per attempt.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the receive side waits for a data block, per attempt.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(3);

/// One active transfer and everything it owns.
pub struct Session {
    /// The endpoint dedicated to this transfer.
    sock: tftp::TftpSocket,

    /// The peer this session corresponds with.
    peer: SocketAddr,

    /// Whether `peer` is final. A downloading client learns the server's
    /// session port only from the first block it receives, so it starts
    /// unlocked and pins the first address that sends a decodable datagram.
    peer_locked: bool,

    /// The packet machine for this transfer.
    processor: PacketProcessor,

    /// Per-attempt wait for a peer datagram.
    attempt_timeout: Duration,

    /// The fixed attempt budget.
    max_attempts: u32,

    /// Consecutive failed attempts for the block currently in flight.
    attempts: u32,
}

impl Session {
    /// Binds a fresh endpoint on an ephemeral port for a server-side
    /// session. Bind failures are reported to the caller and nothing is
    /// sent to the peer; there is no session endpoint to answer from yet.
    pub fn open(peer: SocketAddr, processor: PacketProcessor) -> Result<Session, SessionError> {
        let sock = tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())
            .map_err(SessionError::Socket)?;
        Ok(Session::on_socket(sock, peer, true, processor))
    }

    /// Builds a session over an endpoint the caller already owns. The
    /// client uses this so the transfer continues on the socket its request
    /// went out on.
    pub fn on_socket(
        sock: tftp::TftpSocket,
        peer: SocketAddr,
        peer_locked: bool,
        processor: PacketProcessor,
    ) -> Session {
        let attempt_timeout = if processor.is_sender() {
            ACK_TIMEOUT
        } else {
            DATA_TIMEOUT
        };
        Session {
            sock,
            peer,
            peer_locked,
            processor,
            attempt_timeout,
            max_attempts: MAX_ATTEMPTS,
            attempts: 0,
        }
    }

    pub fn with_timing(mut self, attempt_timeout: Duration, max_attempts: u32) -> Session {
        self.attempt_timeout = attempt_timeout;
        self.max_attempts = max_attempts;
        self
    }

    /// Drives the transfer to a terminal state. Consumes the session; the
    /// endpoint and the file close when it returns.
    pub async fn run(self) -> Result<(), SessionError> {
        if self.processor.is_sender() {
            self.run_send().await
        } else {
            self.run_recv().await
        }
    }

    async fn run_send(mut self) -> Result<(), SessionError> {
        let mut action = self.processor.start().await;
        loop {
            let frame = match action {
                ResultAction::SendAndAwait(p) => p,
                ResultAction::SendAndClose(p) => {
                    self.sock.send(&p, self.peer).await?;
                    return Ok(());
                }
                ResultAction::Close => return Ok(()),
                ResultAction::Fail(msg) => return Err(SessionError::Transfer(msg)),
                ResultAction::Await | ResultAction::Retransmit => {
                    return Err(SessionError::Transfer(
                        "send machine produced no frame".to_string(),
                    ))
                }
            };

            self.attempts = 0;
            action = loop {
                if self.attempts == self.max_attempts {
                    log::warn!(
                        "no matching ack from {} after {} attempts, aborting",
                        self.peer,
                        self.attempts
                    );
                    return Err(SessionError::RetryExhausted);
                }
                self.attempts += 1;
                self.sock.send(&frame, self.peer).await?;

                match self.sock.recv_with_timeout(self.attempt_timeout).await {
                    Ok((packet, src)) => {
                        if src != self.peer {
                            log::warn!("ignoring datagram from unexpected peer {}", src);
                            continue;
                        }
                        match self.processor.process(&packet).await {
                            ResultAction::Retransmit => continue,
                            next => break next,
                        }
                    }
                    Err(tftp::SocketError::Timeout(_)) => continue,
                    Err(tftp::SocketError::Decode(e)) => {
                        log::debug!("discarding undecodable datagram: {}", e);
                        continue;
                    }
                    Err(e @ tftp::SocketError::IO(_)) => return Err(SessionError::Socket(e)),
                }
            };
        }
    }

    async fn run_recv(mut self) -> Result<(), SessionError> {
        let mut action = self.processor.start().await;
        loop {
            match action {
                ResultAction::SendAndAwait(ref p) => self.sock.send(p, self.peer).await?,
                ResultAction::SendAndClose(p) => {
                    self.sock.send(&p, self.peer).await?;
                    return Ok(());
                }
                ResultAction::Close => return Ok(()),
                ResultAction::Fail(msg) => return Err(SessionError::Transfer(msg)),
                ResultAction::Await | ResultAction::Retransmit => {}
            }

            self.attempts = 0;
            let packet = loop {
                match self.sock.recv_with_timeout(self.attempt_timeout).await {
                    Ok((packet, src)) => {
                        if self.peer_locked && src != self.peer {
                            log::warn!("ignoring datagram from unexpected peer {}", src);
                            continue;
                        }
                        if !self.peer_locked {
                            self.peer = src;
                            self.peer_locked = true;
                        }
                        break packet;
                    }
                    Err(tftp::SocketError::Timeout(_)) => {
                        self.attempts += 1;
                        if self.attempts == self.max_attempts {
                            log::warn!(
                                "nothing from {} after {} attempts, aborting",
                                self.peer,
                                self.attempts
                            );
                            return Err(SessionError::RetryExhausted);
                        }
                    }
                    Err(tftp::SocketError::Decode(e)) => {
                        // Discarded with no ack so the peer's retry timer
                        // fires and resends. Hearing from the peer at all
                        // refreshes the wait budget.
                        log::debug!("discarding undecodable datagram: {}", e);
                        self.attempts = 0;
                    }
                    Err(e @ tftp::SocketError::IO(_)) => return Err(SessionError::Socket(e)),
                }
            };
            action = self.processor.process(&packet).await;
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// The endpoint failed underneath the transfer.
    Socket(tftp::SocketError),

    /// The transfer itself failed: local IO, or a peer-reported error.
    Transfer(String),

    /// The attempt budget ran out with no usable reply.
    RetryExhausted,
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::Socket(e) => write!(f, "session socket error: {}", e),
            SessionError::Transfer(msg) => write!(f, "transfer failed: {}", msg),
            SessionError::RetryExhausted => {
                write!(f, "retry budget exhausted with no usable reply")
            }
        }
    }
}

impl From<tftp::SocketError> for SessionError {
    fn from(e: tftp::SocketError) -> SessionError {
        SessionError::Socket(e)
    }
}
