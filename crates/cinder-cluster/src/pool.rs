//! Pooled RESP clients for node-to-node forwarding.
//!
//! A peer client is a TCP stream speaking the same wire protocol as any
//! other client, authenticated on connect when the cluster runs with
//! `requirepass`. Round trips carry a dial/read timeout; a timed-out or
//! errored client is discarded rather than returned to the pool, since its
//! stream may hold a half-read reply.

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Buf, Bytes, BytesMut};
use cinder_protocol::{parse_reply, serialize_cmd_line, CmdLine, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ClusterError;

/// Idle clients kept per peer.
const MAX_IDLE_PER_PEER: usize = 4;

/// One connection to a peer node.
pub struct PeerClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl PeerClient {
    /// Dials `addr` within `timeout`, authenticating when a password is
    /// required.
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClusterError::PeerTimeout)??;
        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        if let Some(password) = password {
            let auth = vec![
                Bytes::from_static(b"AUTH"),
                Bytes::copy_from_slice(password.as_bytes()),
            ];
            match client.round_trip(&auth, timeout).await? {
                Reply::Ok => {}
                other => {
                    return Err(ClusterError::BadDump(format!(
                        "peer auth rejected: {other:?}"
                    )))
                }
            }
        }
        Ok(client)
    }

    /// Sends one command and reads exactly one reply.
    pub async fn round_trip(
        &mut self,
        argv: &CmdLine,
        timeout: Duration,
    ) -> Result<Reply, ClusterError> {
        let mut out = BytesMut::new();
        serialize_cmd_line(argv, &mut out);
        tokio::time::timeout(timeout, self.stream.write_all(&out))
            .await
            .map_err(|_| ClusterError::PeerTimeout)??;

        loop {
            if let Some((reply, consumed)) = parse_reply(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(reply);
            }
            let n = tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| ClusterError::PeerTimeout)??;
            if n == 0 {
                return Err(ClusterError::PeerClosed);
            }
        }
    }
}

/// Pool of idle peer clients keyed by address.
pub struct PeerPool {
    idle: Mutex<AHashMap<String, VecDeque<PeerClient>>>,
    password: Option<String>,
    timeout: Duration,
}

impl PeerPool {
    /// Builds a pool. `password` is sent on every fresh connection when
    /// set; `timeout` bounds dials, writes, and reads.
    pub fn new(password: Option<String>, timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(AHashMap::new()),
            password,
            timeout,
        }
    }

    /// Sends `argv` to `addr` and returns the peer's reply. The client is
    /// pooled on success and dropped on failure.
    pub async fn round_trip(&self, addr: &str, argv: &CmdLine) -> Result<Reply, ClusterError> {
        let mut client = match self.take_idle(addr).await {
            Some(client) => client,
            None => PeerClient::connect(addr, self.password.as_deref(), self.timeout).await?,
        };

        match client.round_trip(argv, self.timeout).await {
            Ok(reply) => {
                self.put_idle(addr, client).await;
                Ok(reply)
            }
            Err(e) => {
                debug!(addr, "discarding peer client after error: {e}");
                Err(e)
            }
        }
    }

    async fn take_idle(&self, addr: &str) -> Option<PeerClient> {
        self.idle.lock().await.get_mut(addr)?.pop_front()
    }

    async fn put_idle(&self, addr: &str, client: PeerClient) {
        let mut idle = self.idle.lock().await;
        let queue = idle.entry(addr.to_owned()).or_default();
        if queue.len() < MAX_IDLE_PER_PEER {
            queue.push_back(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal RESP echo peer: answers every command array with +OK.
    async fn spawn_ok_peer() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        let Ok(n) = sock.read_buf(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        while let Ok(Some((_, consumed))) = parse_reply(&buf) {
                            buf.advance(consumed);
                            if sock.write_all(b"+OK\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn line(parts: &[&str]) -> CmdLine {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[tokio::test]
    async fn round_trip_against_live_peer() {
        let addr = spawn_ok_peer().await;
        let pool = PeerPool::new(None, Duration::from_secs(1));
        let reply = pool.round_trip(&addr, &line(&["SET", "k", "v"])).await.unwrap();
        assert_eq!(reply, Reply::Ok);

        // second call reuses the pooled client
        let reply = pool.round_trip(&addr, &line(&["PING"])).await.unwrap();
        assert_eq!(reply, Reply::Ok);
    }

    #[tokio::test]
    async fn dial_failure_surfaces_io_error() {
        let pool = PeerPool::new(None, Duration::from_millis(300));
        let err = pool
            .round_trip("127.0.0.1:1", &line(&["PING"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Io(_) | ClusterError::PeerTimeout
        ));
    }
}
