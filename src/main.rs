// A file-transfer server and client for a TFTP-derived protocol over UDP.
//
// The protocol keeps TFTP's shape but is not RFC 1350: requests carry no
// mode field, every DATA block ends in a one-byte CRC-8 of its payload, and
// two operations were added on top of the classic five.
//
// Opcodes:
//  1  RRQ     | 0x00 0x01 | filename | 0x00 |
//  2  WRQ     | 0x00 0x02 | filename | 0x00 |
//  3  DATA    | 0x00 0x03 | block# (2 bytes) | 0-512 payload bytes | crc8 |
//  4  ACK     | 0x00 0x04 | block# (2 bytes) |
//  5  ERROR   | 0x00 0x05 | code (2 bytes) | message | 0x00 |
//  6  DELETE  | 0x00 0x06 | filename | 0x00 |
//
// Requests arrive on the well-known control port (6969). Each accepted
// transfer moves to a fresh ephemeral port, one per session, so concurrent
// peers never share an endpoint. Within a session exactly one block is in
// flight: data blocks start at number 1 and each must be acked before the
// next is sent, with a budget of three attempts per block.
//
// A block shorter than 512 bytes ends the transfer. A file that is an exact
// multiple of 512 is closed out with one zero-length block so the end is
// unambiguous. A DATA block whose checksum does not match is dropped
// without an ack, which leaves retransmission to the sender's timer.
//
// Two quirks are part of the wire contract:
// - An RRQ for the name "__ping__" is a liveness probe. It is answered with
//   a single empty DATA block and nothing else.
// - The reply to DELETE reuses the ERROR frame as a status report, code 0
//   meaning success.

mod client;
mod processor;
mod server;
mod session;
mod store;
mod tftp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use client::Client;
use server::Server;
use store::FileStore;

use anyhow::{bail, Context, Result};

const USAGE: &str =
    "usage: tftpx serve [root] | ping <host> | get <host> <file> | put <host> <file> | rm <host> <file>";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("serve") => {
            let root = args.get(1).map(String::as_str).unwrap_or(".");
            let server = Server::bind(
                (Ipv4Addr::UNSPECIFIED, server::CONTROL_PORT).into(),
                FileStore::new(root),
            )
            .context("could not bind the control port")?;
            log::info!("serving '{}' on {}", root, server.local_addr()?);
            server.run().await?;
            Ok(())
        }
        Some("ping") => {
            if Client::new(server_addr(&args)?).ping().await? {
                println!("server is alive");
                Ok(())
            } else {
                bail!("server did not respond");
            }
        }
        Some("get") => {
            let name = file_arg(&args)?;
            Client::new(server_addr(&args)?)
                .get(name, Path::new(name))
                .await?;
            println!("downloaded '{}'", name);
            Ok(())
        }
        Some("put") => {
            let name = file_arg(&args)?;
            Client::new(server_addr(&args)?)
                .put(Path::new(name), name)
                .await?;
            println!("uploaded '{}'", name);
            Ok(())
        }
        Some("rm") => {
            let name = file_arg(&args)?;
            let (code, message) = Client::new(server_addr(&args)?).delete(name).await?;
            if code == 0 {
                println!("{}", message);
                Ok(())
            } else {
                bail!("{}", message);
            }
        }
        _ => bail!("{}", USAGE),
    }
}

fn server_addr(args: &[String]) -> Result<SocketAddr> {
    let host = args.get(1).with_context(|| USAGE.to_string())?;
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("'{}' is not an IP address", host))?;
    Ok(SocketAddr::new(ip, server::CONTROL_PORT))
}

fn file_arg(args: &[String]) -> Result<&str> {
    Ok(args.get(2).with_context(|| USAGE.to_string())?.as_str())
}
