use async_io::Async;
use crc::{Crc, CRC_8_SMBUS};
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

///////////////////////////////////////////////////////////////
// Protocol constants

/// Maximum payload carried by one DATA block. A shorter payload marks the
/// final block of a transfer.
pub const DATA_BLOCK_SIZE: usize = 512;

/// Largest frame on the wire: opcode, block number, full payload, checksum.
pub const MAX_PACKET_SIZE: usize = 2 + 2 + DATA_BLOCK_SIZE + 1;

/// Block numbers are 16-bit, so sources larger than this cannot be
/// transferred and must be refused before a transfer starts.
pub const MAX_TRANSFER_SIZE: u64 = DATA_BLOCK_SIZE as u64 * u16::MAX as u64;

/// Read requests for this name are liveness probes: the answer is a single
/// empty DATA block with no ack wait.
pub const PING_NAME: &str = "__ping__";

// ERROR packet codes. The code field doubles as a status flag in replies to
// DELETE requests, where 0 reports success.
pub const ERR_UNDEFINED: u16 = 0;
pub const ERR_FILE_NOT_FOUND: u16 = 1;
pub const ERR_CANNOT_CREATE: u16 = 2;
pub const ERR_ILLEGAL_OP: u16 = 4;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_DELETE: u16 = 6;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// CRC-8 (polynomial 0x07, zero seed, no reflection, no final xor) over the
/// payload bytes of a DATA block. The opcode and block number are never
/// covered.
pub fn checksum(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Why a datagram could not be turned into a packet.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    /// The datagram does not form a frame: too short for its kind, or a
    /// filename without its terminating zero byte.
    Malformed(String),

    /// The first two bytes name no known operation.
    UnknownOpcode(u16),

    /// A DATA frame whose trailing checksum does not match its payload.
    /// Soft failure: the block is dropped without a reply and the peer's
    /// retry timer takes care of retransmission.
    Checksum { block: u16 },
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Malformed(msg) => write!(f, "malformed datagram: {}", msg),
            DecodeError::UnknownOpcode(op) => write!(f, "unknown opcode {}", op),
            DecodeError::Checksum { block } => write!(f, "checksum mismatch on block {}", block),
        }
    }
}

/// Represents an error returned from the socket wrapper.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Decode(DecodeError),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "socket IO error: {}", e),
            SocketError::Decode(e) => write!(f, "{}", e),
            SocketError::Timeout(_) => write!(f, "timed out waiting for a datagram"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<DecodeError> for SocketError {
    fn from(e: DecodeError) -> Self {
        SocketError::Decode(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Packet codec

/// A packet of the transfer protocol and its associated data.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// Opens a download of the named file.
    ReadReq { filename: String },

    /// Opens an upload of the named file.
    WriteReq { filename: String },

    /// One block of file content. On the wire the payload is followed by a
    /// one-byte checksum; it is computed on encode and verified on decode,
    /// so it never appears here.
    Data { block: u16, data: Vec<u8> },

    /// Acknowledges the named block.
    Ack { block: u16 },

    /// An error report. Also reused as the status reply to `Delete`, with
    /// code 0 meaning success.
    Error { code: u16, message: String },

    /// Asks the server to remove the named file.
    Delete { filename: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Concatenates bytes from the start of the buffer until a zero byte.
///
/// Returns the extracted string and the position of the zero byte, or the
/// size of the buffer if none was found. The scan never leaves the buffer.
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let mut s = String::new();
    for (i, &c) in buf.iter().enumerate() {
        if c == 0x00 {
            return (s, i);
        }
        s.push(char::from(c));
    }

    (s, buf.len())
}

/// A filename field must be terminated inside the datagram.
fn parse_filename(buf: &[u8]) -> Result<String, DecodeError> {
    let (filename, end) = string_from_buffer(buf);
    if end == buf.len() {
        return Err(DecodeError::Malformed(
            "filename is not zero-terminated".to_string(),
        ));
    }
    Ok(filename)
}

fn parse_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    // opcode + block number + checksum byte at minimum
    if buf.len() < 5 {
        return Err(DecodeError::Malformed(
            "data frame too short to carry a checksum".to_string(),
        ));
    }
    if buf.len() > MAX_PACKET_SIZE {
        return Err(DecodeError::Malformed("data frame oversized".to_string()));
    }

    let block = u16_from_buffer(&buf[2..4]);
    let data = &buf[4..buf.len() - 1];
    if checksum(data) != buf[buf.len() - 1] {
        return Err(DecodeError::Checksum { block });
    }

    Ok(Packet::Data {
        block,
        data: data.to_vec(),
    })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Malformed("ack frame too short".to_string()));
    }
    // bytes past the block number are ignored
    Ok(Packet::Ack {
        block: u16_from_buffer(&buf[2..4]),
    })
}

fn parse_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Malformed("error frame too short".to_string()));
    }
    let code = u16_from_buffer(&buf[2..4]);
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

fn encode_request(op: u16, filename: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + filename.len() + 1);
    buf.extend_from_slice(&op.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0x00);
    buf
}

impl Packet {
    /// Serializes the packet into one datagram. All offset arithmetic for
    /// the wire layout lives here and in `decode`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { filename } => encode_request(OP_RRQ, filename),
            Packet::WriteReq { filename } => encode_request(OP_WRQ, filename),
            Packet::Delete { filename } => encode_request(OP_DELETE, filename),
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(5 + data.len());
                buf.extend_from_slice(&OP_DATA.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                buf.push(checksum(data));
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OP_ACK.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(4 + message.len() + 1);
                buf.extend_from_slice(&OP_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
                buf
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Packet, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Malformed(
                "datagram shorter than an opcode".to_string(),
            ));
        }

        match u16_from_buffer(&buf[..2]) {
            OP_RRQ => Ok(Packet::ReadReq {
                filename: parse_filename(&buf[2..])?,
            }),
            OP_WRQ => Ok(Packet::WriteReq {
                filename: parse_filename(&buf[2..])?,
            }),
            OP_DELETE => Ok(Packet::Delete {
                filename: parse_filename(&buf[2..])?,
            }),
            OP_DATA => parse_data(buf),
            OP_ACK => parse_ack(buf),
            OP_ERROR => parse_error(buf),
            op => Err(DecodeError::UnknownOpcode(op)),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that frames outgoing packets and parses
/// incoming datagrams into structured packets.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }

    /// Receives one raw datagram without interpreting it. The dispatch loop
    /// uses this so it can apply its own minimum-length rule before decoding.
    pub async fn recv_datagram(&self) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..total_written].to_vec(), src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        let packet = Packet::decode(&buf[..total_written])?;
        Ok((packet, src))
    }
}
