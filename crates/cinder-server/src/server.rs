//! TCP accept loop and orderly shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cinder_cluster::{ClusterConfig, ClusterNode, SeedTopology};
use cinder_core::engine::{AofConfig, Engine, EngineConfig, EngineError};
use cinder_core::ClientState;
use cinder_protocol::{CmdLine, Reply};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection;

/// Startup failures. Each maps to a non-zero exit in `main`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("persistence directory {0} is not usable: {1}")]
    DataDir(String, std::io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The dispatch target a connection drives: a bare engine, or a cluster
/// node wrapping one.
#[derive(Clone)]
pub enum Backend {
    Standalone(Arc<Engine>),
    Cluster(Arc<ClusterNode>),
}

impl Backend {
    pub fn new_client(&self, peer: String) -> ClientState {
        match self {
            Backend::Standalone(engine) => engine.new_client(peer),
            Backend::Cluster(node) => node.engine().new_client(peer),
        }
    }

    pub async fn exec(&self, client: &mut ClientState, argv: &CmdLine) -> Reply {
        match self {
            Backend::Standalone(engine) => engine.exec(client, argv),
            Backend::Cluster(node) => node.exec(client, argv).await,
        }
    }

    pub fn after_client_close(&self, client: &mut ClientState) {
        match self {
            Backend::Standalone(engine) => engine.after_client_close(client),
            Backend::Cluster(node) => node.after_client_close(client),
        }
    }

    fn close(&self) {
        match self {
            Backend::Standalone(engine) => engine.close(),
            Backend::Cluster(node) => node.close(),
        }
    }
}

/// Builds the backend from config: engine config, optional AOF, optional
/// cluster wrapper.
pub fn build_backend(config: &ServerConfig) -> Result<Backend, ServerError> {
    let aof = if config.appendonly {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| ServerError::DataDir(config.dir.display().to_string(), e))?;
        Some(AofConfig {
            path: config.aof_path(),
            fsync: config.appendfsync,
        })
    } else {
        None
    };

    let engine_config = EngineConfig {
        databases: if config.cluster_enable { 1 } else { config.databases },
        requirepass: config.requirepass.clone(),
        node_name: config.announce_addr(),
        tcp_port: config.port,
        aof,
    };

    if config.cluster_enable {
        let self_addr = config.announce_addr();
        let topology = if config.cluster_as_seed || config.cluster_seed.is_empty() {
            Arc::new(SeedTopology::single(self_addr.clone()))
        } else {
            Arc::new(SeedTopology::new(
                self_addr.clone(),
                vec![self_addr.clone(), config.cluster_seed.clone()],
            ))
        };
        let node = ClusterNode::new(
            engine_config,
            ClusterConfig {
                self_addr,
                peer_timeout: config.peer_timeout,
                allow_fast_transaction: true,
            },
            topology,
        )?;
        Ok(Backend::Cluster(node))
    } else {
        Ok(Backend::Standalone(Engine::new(engine_config, None)?))
    }
}

/// Binds, accepts, and serves until a shutdown signal arrives.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let backend = build_backend(&config)?;
    let addr = config.announce_addr();
    let listener = TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind {
        addr: addr.clone(),
        source,
    })?;
    info!(%addr, cluster = config.cluster_enable, "listening");

    let closing = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, _) = broadcast::channel(1);
    let active = Arc::new(AtomicUsize::new(0));
    let mut drivers = JoinSet::new();

    let signal_closing = Arc::clone(&closing);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_closing.store(true, Ordering::SeqCst);
        let _ = signal_tx.send(());
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                if closing.load(Ordering::SeqCst) {
                    continue; // refuse new work during shutdown
                }
                if active.load(Ordering::SeqCst) >= config.maxclients {
                    let mut out = bytes::BytesMut::new();
                    Reply::error("ERR max number of clients reached").serialize(&mut out);
                    let _ = stream.write_all(&out).await;
                    continue;
                }

                active.fetch_add(1, Ordering::SeqCst);
                let backend = backend.clone();
                let active = Arc::clone(&active);
                let shutdown = shutdown_tx.subscribe();
                drivers.spawn(async move {
                    connection::drive(stream, peer.to_string(), backend, shutdown).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }

    // stop accepting, let drivers observe the shutdown broadcast
    drop(listener);
    while drivers.join_next().await.is_some() {}

    backend.close();
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
