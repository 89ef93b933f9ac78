//! Per-connection driver.
//!
//! Reads bytes into a buffer, parses as many complete frames as arrived
//! (pipelining), dispatches each through the backend, and writes all the
//! replies in one batch. Recoverable protocol faults answer with an error
//! and resynchronize at the next line boundary instead of dropping the
//! connection.

use bytes::{Buf, BytesMut};
use cinder_protocol::{parse_reply, resync_offset, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::debug;

use crate::server::Backend;

/// Initial buffer capacity; covers typical pipelined batches.
const BUF_CAPACITY: usize = 4096;

/// Ceiling on buffered-but-incomplete input from one client.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Drives one client connection until EOF, socket error, or shutdown.
pub async fn drive(
    mut stream: TcpStream,
    peer: String,
    backend: Backend,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut client = backend.new_client(peer.clone());
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);

    'conn: loop {
        tokio::select! {
            _ = shutdown.recv() => break 'conn,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break 'conn,
                Ok(_) => {}
                Err(e) => {
                    debug!(peer, "socket read failed: {e}");
                    break 'conn;
                }
            },
        }

        if buf.len() > MAX_BUF_SIZE {
            let mut err = BytesMut::new();
            Reply::error("ERR max buffer size exceeded, closing connection").serialize(&mut err);
            let _ = stream.write_all(&err).await;
            break 'conn;
        }

        out.clear();
        loop {
            match parse_reply(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.advance(consumed);
                    match frame.into_cmd_line() {
                        Some(argv) if !argv.is_empty() => {
                            let reply = backend.exec(&mut client, &argv).await;
                            reply.serialize(&mut out);
                        }
                        _ => {
                            Reply::error("ERR protocol error: expected array of bulk strings")
                                .serialize(&mut out);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    Reply::error(format!("ERR protocol error: {e}")).serialize(&mut out);
                    // drop input up to the next line boundary and carry on
                    match resync_offset(&buf) {
                        Some(n) => buf.advance(n),
                        None => buf.clear(),
                    }
                }
            }
        }

        if !out.is_empty() {
            if let Err(e) = stream.write_all(&out).await {
                debug!(peer, "socket write failed: {e}");
                break 'conn;
            }
        }
    }

    backend.after_client_close(&mut client);
    debug!(peer, "connection closed");
}
