// Client-side operations. Each one opens its own ephemeral endpoint, sends
// the request to the server's control port, and then, for transfers, runs
// the same packet machines the server does from the other side: an upload
// is the send machine, a download is the receive machine.

use crate::processor::PacketProcessor;
use crate::session::{self, Session, SessionError};
use crate::tftp;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use tokio::fs::File;

pub struct Client {
    server: SocketAddr,
}

impl Client {
    pub fn new(server: SocketAddr) -> Client {
        Client { server }
    }

    fn bind(&self) -> Result<tftp::TftpSocket, tftp::SocketError> {
        tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())
    }

    /// Asks the server whether it is alive. A read request for the probe
    /// name is answered with one empty data block and nothing else.
    pub async fn ping(&self) -> Result<bool, ClientError> {
        let sock = self.bind()?;
        let probe = tftp::Packet::ReadReq {
            filename: tftp::PING_NAME.to_string(),
        };
        sock.send(&probe, self.server).await?;

        match sock.recv_with_timeout(session::DATA_TIMEOUT).await {
            Ok((tftp::Packet::Data { .. }, _)) => Ok(true),
            Ok(_) => Ok(false),
            Err(tftp::SocketError::Timeout(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Downloads `remote` into the local file at `local`.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<(), ClientError> {
        let sock = self.bind()?;
        let file = File::create(local).await?;

        let request = tftp::Packet::ReadReq {
            filename: remote.to_string(),
        };
        sock.send(&request, self.server).await?;

        // The first block arrives from the session endpoint the server just
        // opened, not from the control port, so the peer starts unpinned.
        let session = Session::on_socket(
            sock,
            self.server,
            false,
            PacketProcessor::receiver(file, false),
        );
        session.run().await?;

        log::info!("downloaded '{}' to {}", remote, local.display());
        Ok(())
    }

    /// Uploads the local file at `local` under the name `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<(), ClientError> {
        let file = File::open(local).await?;
        let len = file.metadata().await?.len();
        if len > tftp::MAX_TRANSFER_SIZE {
            return Err(ClientError::TooLarge(len));
        }

        let sock = self.bind()?;
        let request = tftp::Packet::WriteReq {
            filename: remote.to_string(),
        };
        sock.send(&request, self.server).await?;

        // the acceptance ack names the endpoint the transfer continues on
        let (reply, data_addr) = sock.recv_with_timeout(session::DATA_TIMEOUT).await?;
        match reply {
            tftp::Packet::Ack { block: 0 } => {}
            tftp::Packet::Error { code, message } => {
                return Err(ClientError::Rejected { code, message })
            }
            other => return Err(ClientError::Unexpected(format!("{:?}", other))),
        }

        let session = Session::on_socket(sock, data_addr, true, PacketProcessor::sender(file))
            .with_timing(session::DATA_TIMEOUT, session::MAX_ATTEMPTS);
        session.run().await?;

        log::info!("uploaded {} as '{}'", local.display(), remote);
        Ok(())
    }

    /// Asks the server to remove `remote`. The reply arrives as an error
    /// frame whose code is a status: 0 reports success. Both the code and
    /// the human-readable message are handed back.
    pub async fn delete(&self, remote: &str) -> Result<(u16, String), ClientError> {
        let sock = self.bind()?;
        let request = tftp::Packet::Delete {
            filename: remote.to_string(),
        };
        sock.send(&request, self.server).await?;

        match sock.recv_with_timeout(session::DATA_TIMEOUT).await? {
            (tftp::Packet::Error { code, message }, _) => Ok((code, message)),
            (other, _) => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    Socket(tftp::SocketError),
    File(io::Error),
    Session(SessionError),
    TooLarge(u64),
    Rejected { code: u16, message: String },
    Unexpected(String),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::Socket(e) => write!(f, "socket error: {}", e),
            ClientError::File(e) => write!(f, "file error: {}", e),
            ClientError::Session(e) => write!(f, "{}", e),
            ClientError::TooLarge(len) => {
                write!(f, "file of {} bytes does not fit the block space", len)
            }
            ClientError::Rejected { code, message } => {
                write!(f, "server rejected the request (code {}): {}", code, message)
            }
            ClientError::Unexpected(what) => write!(f, "unexpected reply: {}", what),
        }
    }
}

impl From<tftp::SocketError> for ClientError {
    fn from(e: tftp::SocketError) -> ClientError {
        ClientError::Socket(e)
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> ClientError {
        ClientError::File(e)
    }
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> ClientError {
        ClientError::Session(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[tokio::test]
    async fn test_put_refuses_oversized_file_before_sending() {
        let dir = TempDir::new("client").unwrap();
        let path = dir.path().join("huge.bin");

        // sparse file just over the largest transferable size
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(tftp::MAX_TRANSFER_SIZE + 1).unwrap();
        drop(file);

        // the address is never contacted; the refusal is local
        let client = Client::new(([127, 0, 0, 1], 9).into());
        assert!(matches!(
            client.put(&path, "huge.bin").await,
            Err(ClientError::TooLarge(_))
        ));
    }
}
