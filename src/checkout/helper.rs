//! Helper-side command loop.
//!
//! Reads commands from the foreground on stdin, drives the [`ItemServer`],
//! and writes result records on stdout. Per-item failures are data; protocol
//! violations are fatal and end the loop with an error.

use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use log::debug;
use zerocopy::IntoBytes;

use crate::convert::Converter;
use crate::odb::ObjectStore;
use crate::pkt;
use crate::pkt::Frame;

use super::item::ErrorClass;
use super::item::ItemResult;
use super::server::ItemDone;
use super::server::ItemServer;
use super::server::ServerConfig;
use super::wire;
use super::wire::Command;
use super::wire::ProtocolError;

/// Result record sent for a `get1`/`mget` slot that does not exist.
fn invalid_slot(helper_nr: usize) -> ItemDone {
    ItemDone {
        pc_nr: u32::MAX,
        helper_nr: helper_nr as u32,
        result: ItemResult::error(ErrorClass::InvalidItem, 0),
    }
}

/// Serve one foreground connection until stdin reaches EOF.
///
/// EOF at a command boundary is the normal shutdown signal: the server joins
/// its threads and the helper exits cleanly.
pub fn serve<R, W, S, C>(
    input: &mut R,
    output: &mut W,
    config: ServerConfig,
    store: Arc<S>,
    convert: Arc<C>,
) -> Result<(), ProtocolError>
where
    R: Read,
    W: Write,
    S: ObjectStore + 'static,
    C: Converter + 'static,
{
    let caps = wire::server_handshake(input, output)?;
    debug!("handshake complete, honoring {caps:?}");

    let server = ItemServer::spawn(config, store, convert)?;

    loop {
        let frame = match pkt::read_frame(input)? {
            Some(frame) => frame,
            None => break,
        };
        if frame == Frame::Flush {
            continue;
        }
        let name = match frame.text().and_then(|t| t.strip_prefix("command=")) {
            Some(name) => name.to_string(),
            None => {
                return Err(ProtocolError::UnknownCommand(
                    frame.text().unwrap_or("<binary>").to_string(),
                ));
            }
        };

        let args = match name.as_str() {
            // queue's payload is binary records, consumed below.
            "queue" => Vec::new(),
            _ => wire::read_section(input)?,
        };

        match wire::parse_command(&name, &args)? {
            Command::Queue => loop {
                match pkt::expect_frame(input)? {
                    Frame::Flush => break,
                    Frame::Data(payload) => {
                        let item = wire::decode_queue_item(&payload)?;
                        server.enqueue(item).map_err(|mismatch| {
                            ProtocolError::BadField(
                                "helper_nr",
                                format!(
                                    "{} (expected {})",
                                    mismatch.claimed, mismatch.expected
                                ),
                            )
                        })?;
                    }
                }
            },
            Command::Write(end) => server.authorize(end),
            Command::Get1(nr) => {
                let done = server.wait_done(nr).unwrap_or_else(|| invalid_slot(nr));
                send_result(output, &done)?;
                pkt::write_flush(output)?;
                output.flush()?;
            }
            Command::Mget(begin, end) => {
                for nr in begin..end {
                    let done = server.wait_done(nr).unwrap_or_else(|| invalid_slot(nr));
                    send_result(output, &done)?;
                }
                pkt::write_flush(output)?;
                output.flush()?;
            }
        }
    }

    server.shutdown();
    Ok(())
}

fn send_result<W: Write>(output: &mut W, done: &ItemDone) -> io::Result<()> {
    let record = wire::ResultRecord::from_result(done.pc_nr, done.helper_nr, &done.result);
    pkt::write_frame(output, record.as_bytes())
}
