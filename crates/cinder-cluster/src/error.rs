//! Cluster-layer errors.

use cinder_protocol::ProtocolError;
use thiserror::Error;

/// Failures talking to peers or decoding their replies.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster peer io: {0}")]
    Io(#[from] std::io::Error),

    #[error("cluster peer timeout")]
    PeerTimeout,

    #[error("cluster peer closed the connection")]
    PeerClosed,

    #[error("cluster peer protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no address known for node '{0}'")]
    UnknownNode(String),

    #[error("malformed key dump from peer: {0}")]
    BadDump(String),
}
