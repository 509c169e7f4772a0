//! Splices a client connection onto a live backend.

use crate::players::PlayerGuard;
use crate::server::ServerDescriptor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Dial the backend and copy bytes both ways until the client side ends.
///
/// The player count is raised once the backend accepted and lowered exactly
/// once when the splice is over, whichever side closed first.
pub async fn splice(
    client: TcpStream,
    server: &Arc<ServerDescriptor>,
    connect_timeout: Duration,
) -> std::io::Result<SpliceStats> {
    let backend_addr = server.backend_addr();
    let backend = match tokio::time::timeout(connect_timeout, TcpStream::connect(&backend_addr)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {} timed out", backend_addr),
            ))
        }
    };
    let _ = backend.set_nodelay(true);
    let _ = client.set_nodelay(true);

    let _player = PlayerGuard::join(server);

    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let downstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let upstream = tokio::io::copy(&mut client_read, &mut backend_write).await;
    let _ = backend_write.shutdown().await;

    // Client is done: tear down the other direction too
    downstream.abort();
    let backend_to_client = match downstream.await {
        Ok(Ok(n)) => n,
        _ => 0,
    };

    let client_to_backend = match upstream {
        Ok(n) => n,
        Err(e) => {
            debug!(server = %server.name, error = %e, "Client stream ended with error");
            0
        }
    };

    debug!(
        server = %server.name,
        client_to_backend,
        backend_to_client,
        "Connection closed"
    );

    Ok(SpliceStats {
        client_to_backend,
        backend_to_client,
    })
}
