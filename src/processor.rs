use crate::tftp;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// The two transfer machines. `Send` streams blocks out and advances on
/// acks; `Recv` accepts blocks and answers with acks. Both are pure
/// packet-in, action-out values with no socket of their own, which is what
/// makes them testable in isolation.
#[derive(Debug)]
pub enum PacketProcessor {
    Send(BlockSender),
    Recv(BlockReceiver),
}

impl PacketProcessor {
    /// A machine that reads the open source and sends it block by block.
    pub fn sender(f: File) -> PacketProcessor {
        PacketProcessor::Send(BlockSender {
            f,
            curr_block: 0,
            last_len: 0,
        })
    }

    /// A machine that persists incoming blocks to the open sink. When
    /// `announce` is set the exchange opens with ack 0, which is how a
    /// server confirms it accepted an upload; a downloading peer opens by
    /// waiting instead.
    pub fn receiver(f: File, announce: bool) -> PacketProcessor {
        PacketProcessor::Recv(BlockReceiver {
            f,
            last_block: 0,
            announce,
        })
    }

    pub fn is_sender(&self) -> bool {
        matches!(self, PacketProcessor::Send(_))
    }

    /// Produces the action that opens the exchange.
    pub async fn start(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => p.next_block().await,
            PacketProcessor::Recv(p) => {
                if p.announce {
                    ResultAction::SendAndAwait(tftp::Packet::Ack { block: 0 })
                } else {
                    ResultAction::Await
                }
            }
        }
    }

    /// Given an incoming packet, advances the machine and describes the
    /// action the caller should take.
    pub async fn process(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => p.process_ack(packet).await,
            PacketProcessor::Recv(p) => p.process_data(packet).await,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Send the packet, then wait for the peer's reply.
    SendAndAwait(tftp::Packet),

    /// Send the packet; the transfer is complete once it is on the wire.
    SendAndClose(tftp::Packet),

    /// Wait for the next peer datagram without sending anything.
    Await,

    /// The datagram did not advance the transfer. Resend the frame in
    /// flight, at the cost of one attempt.
    Retransmit,

    /// The transfer is complete with nothing left to send.
    Close,

    /// Local failure. Abort the session with no further network activity.
    Fail(String),
}

/// Send side of a transfer: frames source blocks, counting from 1, and
/// moves to the next block only on a matching ack.
#[derive(Debug)]
pub struct BlockSender {
    f: File,
    curr_block: u16,
    last_len: usize,
}

impl BlockSender {
    async fn next_block(&mut self) -> ResultAction {
        match read_block(&mut self.f).await {
            Ok(data) => {
                self.curr_block = self.curr_block.wrapping_add(1);
                self.last_len = data.len();
                ResultAction::SendAndAwait(tftp::Packet::Data {
                    block: self.curr_block,
                    data,
                })
            }
            Err(e) => ResultAction::Fail(format!("failed to read source block: {}", e)),
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Ack { block } if *block == self.curr_block => {
                if self.last_len < tftp::DATA_BLOCK_SIZE {
                    ResultAction::Close
                } else {
                    // A full block leaves the end of the source ambiguous.
                    // The next read yields either more payload or the empty
                    // block that marks end of file.
                    self.next_block().await
                }
            }
            _ => ResultAction::Retransmit,
        }
    }
}

async fn read_block(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BLOCK_SIZE];
    let mut cursor = 0;

    // A single read may return less than a full block even mid-file, so keep
    // filling until the block is complete or the source runs out.
    loop {
        match f.read(&mut buf[cursor..]).await {
            Ok(n) => {
                if cursor + n == buf.len() {
                    return Ok(buf);
                } else if n == 0 {
                    buf.truncate(cursor);
                    return Ok(buf);
                }
                cursor += n;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Receive side of a transfer: accepts only the next expected block and
/// acknowledges whatever block number actually arrived.
#[derive(Debug)]
pub struct BlockReceiver {
    f: File,
    last_block: u16,
    announce: bool,
}

impl BlockReceiver {
    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => {
                if *block == self.last_block.wrapping_add(1) {
                    if let Err(e) = write_block(&mut self.f, data).await {
                        return ResultAction::Fail(format!(
                            "failed to persist block {}: {}",
                            block, e
                        ));
                    }
                    self.last_block = *block;
                    if data.len() < tftp::DATA_BLOCK_SIZE {
                        if let Err(e) = self.f.flush().await {
                            return ResultAction::Fail(format!(
                                "failed to persist block {}: {}",
                                block, e
                            ));
                        }
                        return ResultAction::SendAndClose(tftp::Packet::Ack { block: *block });
                    }
                } else {
                    log::debug!(
                        "not persisting block {} while expecting {}",
                        block,
                        self.last_block.wrapping_add(1)
                    );
                }
                // Duplicates and strays are acked with the block number that
                // was received, not the last accepted one. A peer that missed
                // an ack sees confirmation for the block it just resent and
                // resynchronizes.
                ResultAction::SendAndAwait(tftp::Packet::Ack { block: *block })
            }
            tftp::Packet::Error { code, message } => {
                ResultAction::Fail(format!("peer reported error {}: {}", code, message))
            }
            _ => ResultAction::Await,
        }
    }
}

async fn write_block(f: &mut File, buf: &[u8]) -> Result<(), io::Error> {
    let mut cursor = 0;
    while cursor < buf.len() {
        match f.write(&buf[cursor..]).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted no bytes",
                ))
            }
            Ok(n) => cursor += n,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempdir::TempDir;

    async fn source_file(dir: &TempDir, contents: &[u8]) -> File {
        let path = dir.path().join("source.bin");
        let mut f = File::create(&path).await.unwrap();
        f.write_all(contents).await.unwrap();
        f.flush().await.unwrap();
        drop(f);
        File::open(&path).await.unwrap()
    }

    async fn sink_file(dir: &TempDir) -> (File, PathBuf) {
        let path = dir.path().join("sink.bin");
        (File::create(&path).await.unwrap(), path)
    }

    #[tokio::test]
    async fn test_sender_splits_source_into_blocks() {
        let dir = TempDir::new("processor").unwrap();
        let mut contents = vec![0x78; 512];
        contents.extend_from_slice(&[0x01; 488]);
        let mut processor = PacketProcessor::sender(source_file(&dir, &contents).await);

        assert_eq!(
            processor.start().await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 1,
                data: vec![0x78; 512]
            })
        );

        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 2,
                data: vec![0x01; 488]
            })
        );

        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::Close
        );
    }

    #[tokio::test]
    async fn test_sender_appends_empty_block_for_exact_multiple() {
        let dir = TempDir::new("processor").unwrap();
        let mut processor = PacketProcessor::sender(source_file(&dir, &[0x42; 1024]).await);

        assert_eq!(
            processor.start().await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 1,
                data: vec![0x42; 512]
            })
        );

        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 2,
                data: vec![0x42; 512]
            })
        );

        // the source ended exactly on a block boundary, so one zero-length
        // block disambiguates end of file
        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 2 }).await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 3,
                data: vec![]
            })
        );

        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 3 }).await,
            ResultAction::Close
        );
    }

    #[tokio::test]
    async fn test_sender_sends_one_empty_block_for_empty_source() {
        let dir = TempDir::new("processor").unwrap();
        let mut processor = PacketProcessor::sender(source_file(&dir, &[]).await);

        assert_eq!(
            processor.start().await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 1,
                data: vec![]
            })
        );

        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::Close
        );
    }

    #[tokio::test]
    async fn test_sender_retransmits_on_anything_but_a_matching_ack() {
        let dir = TempDir::new("processor").unwrap();
        let mut processor = PacketProcessor::sender(source_file(&dir, &[0x55; 600]).await);

        let _ = processor.start().await;

        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 0 }).await,
            ResultAction::Retransmit
        );
        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 5 }).await,
            ResultAction::Retransmit
        );
        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 1,
                    data: vec![0x01]
                })
                .await,
            ResultAction::Retransmit
        );

        // still on block 1 after all of that
        assert_eq!(
            processor.process(&tftp::Packet::Ack { block: 1 }).await,
            ResultAction::SendAndAwait(tftp::Packet::Data {
                block: 2,
                data: vec![0x55; 88]
            })
        );
    }

    #[tokio::test]
    async fn test_receiver_announces_and_persists_blocks() {
        let dir = TempDir::new("processor").unwrap();
        let (sink, path) = sink_file(&dir).await;
        let mut processor = PacketProcessor::receiver(sink, true);

        assert_eq!(
            processor.start().await,
            ResultAction::SendAndAwait(tftp::Packet::Ack { block: 0 })
        );

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 1,
                    data: vec![0x78; 512]
                })
                .await,
            ResultAction::SendAndAwait(tftp::Packet::Ack { block: 1 })
        );

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 2,
                    data: vec![0x01; 488]
                })
                .await,
            ResultAction::SendAndClose(tftp::Packet::Ack { block: 2 })
        );

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 1000);
        assert_eq!(&written[..512], &[0x78; 512][..]);
        assert_eq!(&written[512..], &[0x01; 488][..]);
    }

    #[tokio::test]
    async fn test_receiver_acks_duplicate_without_writing_twice() {
        let dir = TempDir::new("processor").unwrap();
        let (sink, path) = sink_file(&dir).await;
        let mut processor = PacketProcessor::receiver(sink, true);
        let _ = processor.start().await;

        let block_one = tftp::Packet::Data {
            block: 1,
            data: vec![0x78; 512],
        };
        assert_eq!(
            processor.process(&block_one).await,
            ResultAction::SendAndAwait(tftp::Packet::Ack { block: 1 })
        );

        // the replay is acked again but its payload goes nowhere
        assert_eq!(
            processor.process(&block_one).await,
            ResultAction::SendAndAwait(tftp::Packet::Ack { block: 1 })
        );

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 2,
                    data: vec![0x01; 4]
                })
                .await,
            ResultAction::SendAndClose(tftp::Packet::Ack { block: 2 })
        );

        assert_eq!(std::fs::read(&path).unwrap().len(), 516);
    }

    #[tokio::test]
    async fn test_receiver_acks_out_of_order_block_without_writing() {
        let dir = TempDir::new("processor").unwrap();
        let (sink, path) = sink_file(&dir).await;
        let mut processor = PacketProcessor::receiver(sink, true);
        let _ = processor.start().await;

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 5,
                    data: vec![0xFF; 100]
                })
                .await,
            ResultAction::SendAndAwait(tftp::Packet::Ack { block: 5 })
        );

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 1,
                    data: vec![0x0A; 3]
                })
                .await,
            ResultAction::SendAndClose(tftp::Packet::Ack { block: 1 })
        );

        assert_eq!(std::fs::read(&path).unwrap(), vec![0x0A; 3]);
    }

    #[tokio::test]
    async fn test_receiver_handles_trailing_empty_block() {
        let dir = TempDir::new("processor").unwrap();
        let (sink, path) = sink_file(&dir).await;
        let mut processor = PacketProcessor::receiver(sink, true);
        let _ = processor.start().await;

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 1,
                    data: vec![0x42; 512]
                })
                .await,
            ResultAction::SendAndAwait(tftp::Packet::Ack { block: 1 })
        );

        assert_eq!(
            processor
                .process(&tftp::Packet::Data {
                    block: 2,
                    data: vec![]
                })
                .await,
            ResultAction::SendAndClose(tftp::Packet::Ack { block: 2 })
        );

        assert_eq!(std::fs::read(&path).unwrap().len(), 512);
    }

    #[tokio::test]
    async fn test_receiver_waits_quietly_in_download_mode() {
        let dir = TempDir::new("processor").unwrap();
        let (sink, _path) = sink_file(&dir).await;
        let mut processor = PacketProcessor::receiver(sink, false);

        assert_eq!(processor.start().await, ResultAction::Await);
    }

    #[tokio::test]
    async fn test_receiver_aborts_on_peer_error() {
        let dir = TempDir::new("processor").unwrap();
        let (sink, _path) = sink_file(&dir).await;
        let mut processor = PacketProcessor::receiver(sink, false);
        let _ = processor.start().await;

        assert!(matches!(
            processor
                .process(&tftp::Packet::Error {
                    code: 1,
                    message: "File not found".to_string()
                })
                .await,
            ResultAction::Fail(_)
        ));
    }
}
