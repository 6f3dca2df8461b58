use log::{debug, error, info, trace, warn};
use std::{
    future::{pending, Future},
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Notify,
    time::timeout,
};

use crate::{balancer::Balancer, target::Target};

const BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOptions {
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

pub(crate) async fn handle_client(
    client: TcpStream,
    peer: SocketAddr,
    balancer: Arc<Balancer>,
    options: RelayOptions,
    connection_id: u64,
) {
    let target = Arc::clone(balancer.select(peer.ip()));

    let connect = TcpStream::connect((target.host(), target.port()));
    let backend = match with_connect_timeout(connect, options.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            target.record_error();
            warn!(
                "Error connecting to remote target {} for connection {}: {}",
                target, connection_id, e
            );
            return;
        }
    };
    let _active = target.track_session();

    info!(
        "Forwarding connection {} from {} to target {}",
        connection_id, peer, target
    );
    let start_time = Instant::now();

    if let Err(e) = client.set_nodelay(true).and(backend.set_nodelay(true)) {
        debug!("Failed to set TCP_NODELAY on connection {}: {}", connection_id, e);
    }

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();
    let stop_upstream = Arc::new(Notify::new());

    let upstream = tokio::spawn(forward(
        client_read,
        backend_write,
        format!("client->target({})", target),
        options.idle_timeout,
        Some(Arc::clone(&stop_upstream)),
    ));
    let downstream = tokio::spawn(forward(
        backend_read,
        client_write,
        format!("target({})->client", target),
        options.idle_timeout,
        None,
    ));

    // Once the target stops sending the client has nothing left to wait for:
    // stop reading from it so its socket closes. A client that finishes
    // sending first only half-closes, and still gets the rest of the response.
    let received = downstream.await;
    stop_upstream.notify_one();
    let sent = upstream.await;

    let sent = finish_direction(sent, &target, "client", connection_id);
    let received = finish_direction(received, &target, "remote target", connection_id);

    info!(
        "Connection {} completed in {:.2}ms (target: {}, sent: {} bytes, received: {} bytes)",
        connection_id,
        start_time.elapsed().as_secs_f64() * 1000.0,
        target,
        sent,
        received
    );
}

async fn with_connect_timeout<F, T>(connect: F, limit: Option<Duration>) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
        None => connect.await,
    }
}

fn finish_direction(
    result: Result<io::Result<u64>, tokio::task::JoinError>,
    target: &Target,
    peer_name: &str,
    connection_id: u64,
) -> u64 {
    match result {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) if is_closed_connection(&e) => {
            debug!(
                "Connection {} closed by {} ({})",
                connection_id, peer_name, e
            );
            0
        }
        Ok(Err(e)) => {
            target.record_error();
            error!(
                "Connection {} error with {} via {}: {}",
                connection_id, peer_name, target, e
            );
            0
        }
        Err(e) => {
            target.record_error();
            error!("Relay task for connection {} failed: {}", connection_id, e);
            0
        }
    }
}

/// Peer or self-initiated close, not a real failure.
pub fn is_closed_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Copies `from` into `to` until end of stream, idle timeout or `stop`, then
/// shuts down the write side of `to`.
async fn forward<R, W>(
    mut from: R,
    mut to: W,
    direction: String,
    idle_timeout: Option<Duration>,
    stop: Option<Arc<Notify>>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    let mut total_bytes = 0u64;

    trace!("Starting data forwarding: {}", direction);

    loop {
        let copied = tokio::select! {
            copied = copy_chunk(&mut from, &mut to, &mut buffer, idle_timeout) => copied?,
            _ = stopped(stop.as_deref()) => {
                trace!(
                    "Other direction finished ({}), forwarded {} bytes",
                    direction,
                    total_bytes
                );
                break;
            }
        };

        match copied {
            Some(0) => {
                trace!(
                    "Connection closed by source ({}), forwarded {} bytes",
                    direction,
                    total_bytes
                );
                break;
            }
            Some(n) => {
                total_bytes += n as u64;
                trace!("Forwarded {} bytes ({})", n, direction);
            }
            None => {
                debug!(
                    "Idle for {:?} ({}), forwarded {} bytes",
                    idle_timeout, direction, total_bytes
                );
                break;
            }
        }
    }

    to.shutdown().await?;
    Ok(total_bytes)
}

/// `None` means nothing arrived within `idle_timeout`.
async fn copy_chunk<R, W>(
    from: &mut R,
    to: &mut W,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = match idle_timeout {
        Some(limit) => match timeout(limit, from.read(buffer)).await {
            Ok(read) => read?,
            Err(_) => return Ok(None),
        },
        None => from.read(buffer).await?,
    };
    to.write_all(&buffer[..n]).await?;
    Ok(Some(n))
}

async fn stopped(stop: Option<&Notify>) {
    match stop {
        Some(stop) => stop.notified().await,
        None => pending().await,
    }
}
