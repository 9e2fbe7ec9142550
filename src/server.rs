// The control-port dispatcher.
//
// Requests are first received on one well-known port. The dispatch loop
// never carries a transfer itself: an accepted read or write request gets a
// session with its own ephemeral endpoint, spawned as an independent task,
// so concurrent peers are served simultaneously and a slow transfer cannot
// stall dispatch. Delete requests and rejections are answered directly on
// the control port.

use crate::processor::PacketProcessor;
use crate::session::Session;
use crate::store::FileStore;
use crate::tftp;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

/// Well-known port the server listens on for requests.
pub const CONTROL_PORT: u16 = 6969;

pub struct Server {
    sock: tftp::TftpSocket,
    store: FileStore,
}

impl Server {
    pub fn bind(addr: SocketAddr, store: FileStore) -> Result<Server, tftp::SocketError> {
        Ok(Server {
            sock: tftp::TftpSocket::bind(addr)?,
            store,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Reads one request at a time off the control port and routes it.
    pub async fn run(self) -> Result<(), tftp::SocketError> {
        loop {
            let (datagram, src) = self.sock.recv_datagram().await?;
            if datagram.len() < 4 {
                continue;
            }

            match tftp::Packet::decode(&datagram) {
                Ok(tftp::Packet::ReadReq { filename }) => self.start_download(filename, src).await,
                Ok(tftp::Packet::WriteReq { filename }) => self.start_upload(filename, src).await,
                Ok(tftp::Packet::Delete { filename }) => self.handle_delete(filename, src).await,
                Ok(other) => {
                    log::warn!("unexpected {:?} on the control port from {}", other, src);
                    self.send_error(src, tftp::ERR_ILLEGAL_OP, "Illegal TFTP operation")
                        .await;
                }
                Err(tftp::DecodeError::UnknownOpcode(op)) => {
                    log::warn!("unknown opcode {} from {}", op, src);
                    self.send_error(src, tftp::ERR_ILLEGAL_OP, "Illegal TFTP operation")
                        .await;
                }
                Err(e) => log::debug!("ignoring malformed datagram from {}: {}", src, e),
            }
        }
    }

    async fn start_download(&self, filename: String, peer: SocketAddr) {
        log::info!("read request for '{}' from {}", filename, peer);

        if filename == tftp::PING_NAME {
            // liveness probe: a single empty block from a throwaway
            // endpoint, with no ack wait and no retries
            match tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into()) {
                Ok(sock) => {
                    let probe = tftp::Packet::Data {
                        block: 1,
                        data: vec![],
                    };
                    let _ = sock.send(&probe, peer).await;
                }
                Err(e) => log::error!("could not bind a probe endpoint: {}", e),
            }
            return;
        }

        let file = match self.store.open_for_read(&filename).await {
            Ok((_, len)) if len > tftp::MAX_TRANSFER_SIZE => {
                log::warn!(
                    "refusing '{}': {} bytes does not fit the block space",
                    filename,
                    len
                );
                self.send_error(peer, tftp::ERR_UNDEFINED, "File too large")
                    .await;
                return;
            }
            Ok((file, _)) => file,
            Err(e) => {
                log::warn!("cannot open '{}': {}", filename, e);
                self.send_error(peer, tftp::ERR_FILE_NOT_FOUND, "File not found")
                    .await;
                return;
            }
        };

        let session = match Session::open(peer, PacketProcessor::sender(file)) {
            Ok(s) => s,
            Err(e) => {
                // no session endpoint exists to answer from, so the request
                // is dropped
                log::error!("could not open a session for {}: {}", peer, e);
                return;
            }
        };
        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => log::info!("finished sending '{}' to {}", filename, peer),
                Err(e) => log::warn!("download of '{}' by {} aborted: {}", filename, peer, e),
            }
        });
    }

    async fn start_upload(&self, filename: String, peer: SocketAddr) {
        log::info!("write request for '{}' from {}", filename, peer);

        let file = match self.store.open_for_write(&filename).await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("cannot create '{}': {}", filename, e);
                self.send_error(peer, tftp::ERR_CANNOT_CREATE, "Cannot create file")
                    .await;
                return;
            }
        };

        let session = match Session::open(peer, PacketProcessor::receiver(file, true)) {
            Ok(s) => s,
            Err(e) => {
                log::error!("could not open a session for {}: {}", peer, e);
                return;
            }
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => {
                    log::info!("received and saved '{}' from {}", filename, peer);
                    store.duplicate(&filename).await;
                }
                Err(e) => log::warn!("upload of '{}' from {} aborted: {}", filename, peer, e),
            }
        });
    }

    async fn handle_delete(&self, filename: String, peer: SocketAddr) {
        log::info!("delete request for '{}' from {}", filename, peer);

        // The reply reuses the error frame as a status report; code 0 is
        // success. Peers depend on this convention.
        match self.store.remove(&filename).await {
            Ok(()) => {
                self.send_error(peer, 0, "File deleted successfully").await;
            }
            Err(e) => {
                log::warn!("could not delete '{}': {}", filename, e);
                self.send_error(peer, tftp::ERR_FILE_NOT_FOUND, "Failed to delete file")
                    .await;
            }
        }
    }

    async fn send_error(&self, dst: SocketAddr, code: u16, message: &str) {
        // replies on the control port are a courtesy, not retried
        let reply = tftp::Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(e) = self.sock.send(&reply, dst).await {
            log::warn!("could not answer {}: {}", dst, e);
        }
    }
}
