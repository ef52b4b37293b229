//! Receiving side: accept connections and serve replication sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use failover_store::Inventory;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handshake::server_handshake;
use crate::fs::ExclusionRegistry;
use crate::sync::{receive_tree, ReceiveOptions};
use crate::transfer::stats::format_bytes;
use crate::transfer::{CodecStage, Layer, LayerStack};
use crate::utils::errors::{AgentError, Result};

/// Everything a destination needs to apply incoming runs.
pub struct ReceiverContext {
    pub inventory: Arc<dyn Inventory>,
    pub codec: Arc<dyn CodecStage>,
    /// Local no-copy list, as wire prefixes below each destination root.
    pub exclusions: ExclusionRegistry,
    /// The agent's own state directory, never deleted by reconciliation.
    pub data_dir: PathBuf,
    pub verify_content: bool,
}

enum SessionEnd {
    /// The peer closed the connection between sessions.
    Closed,
    Completed { reusable: bool },
}

/// Accept connections until `shutdown` fires. Each connection runs on its own task.
pub async fn serve(listener: TcpListener, context: Arc<ReceiverContext>, shutdown: CancellationToken) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Replication listener started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Replication listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let context = context.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, context, shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ReceiverContext>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Could not disable Nagle");
    }
    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return,
            outcome = serve_session(&mut stream, peer, &context) => outcome,
        };
        match outcome {
            Ok(SessionEnd::Completed { reusable: true }) => continue,
            Ok(SessionEnd::Completed { reusable: false }) | Ok(SessionEnd::Closed) => return,
            Err(AgentError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(peer = %peer, "Sender disconnected mid-run");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Replication session failed");
                return;
            }
        }
    }
}

async fn serve_session(stream: &mut TcpStream, peer: SocketAddr, context: &ReceiverContext) -> Result<SessionEnd> {
    let (read, write) = stream.split();
    let mut layers = LayerStack::new(read, write);

    let session = {
        let (reader, writer) = layers.halves();
        match server_handshake(reader, writer, context.inventory.clone()).await? {
            Some(session) => session,
            None => return Ok(SessionEnd::Closed),
        }
    };
    if session.compress {
        layers = layers.push(Layer::Compression(context.codec.clone()))?;
    }

    let root = session.grant.to_path.clone();
    let options = ReceiveOptions {
        verify_content: context.verify_content,
        exclusions: Arc::new(
            context
                .exclusions
                .clone()
                .with_local_paths(&root, [&context.data_dir]),
        ),
    };
    info!(
        peer = %peer,
        target_id = %session.grant.target_id,
        source = %session.grant.source,
        root = %root.display(),
        compressed = session.compress,
        "Receiving replication run"
    );

    let stats = {
        let (reader, writer) = layers.halves();
        receive_tree(reader, writer, &root, &options).await?
    };
    info!(
        target_id = %session.grant.target_id,
        entries = stats.entries,
        changed = stats.changed,
        removed = stats.removed,
        content = %format_bytes(stats.content_bytes),
        "Replication run applied"
    );

    let reusable = !layers.is_compressed();
    layers.close().await?;
    Ok(SessionEnd::Completed { reusable })
}
