use log::{debug, error, info, warn};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::{
    balancer::Balancer,
    config::ServerConfig,
    error::{ConfigError, ServerError},
    relay::{self, RelayOptions},
    target::{TargetStatus, Targets},
};

/// Construction validates the whole configuration, so a `Server` can always
/// pick a target for any connection.
#[derive(Debug)]
pub struct Server {
    listen_addr: String,
    balancer: Arc<Balancer>,
    options: RelayOptions,
    status_interval: Option<Duration>,
}

impl Server {
    pub fn new(config: &ServerConfig) -> Result<Self, ConfigError> {
        let targets = Targets::from_config(&config.targets)?;
        info!(
            "Initializing load balancer with {} targets using {} mode",
            targets.len(),
            config.mode
        );

        Ok(Self {
            listen_addr: config.listen_addr.clone(),
            balancer: Arc::new(Balancer::new(targets, config.mode)),
            options: config.relay_options(),
            status_interval: config.status_interval(),
        })
    }

    /// Returns once the listener is bound; connections are served in the
    /// background until [`RunningServer::close`].
    pub async fn run(self, workers: usize) -> Result<RunningServer, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: self.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(
            "Load balancer started on {} ({} mode, {} accept workers)",
            local_addr,
            self.balancer.mode(),
            workers.max(1)
        );
        self.balancer.targets().log_status();

        let listener = Arc::new(listener);
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown, _) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for worker in 0..workers.max(1) {
            tasks.spawn(accept_loop(AcceptWorker {
                id: worker,
                listener: Arc::clone(&listener),
                balancer: Arc::clone(&self.balancer),
                options: self.options,
                connections: Arc::clone(&connections),
                shutdown: shutdown.clone(),
            }));
        }

        if let Some(interval) = self.status_interval {
            tasks.spawn(report_status(
                self.balancer.targets().clone(),
                interval,
                shutdown.subscribe(),
            ));
        }

        Ok(RunningServer {
            local_addr,
            targets: self.balancer.targets().clone(),
            shutdown,
            tasks,
        })
    }
}

/// Dropping the handle leaves the server running detached.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    targets: Targets,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<Result<(), ServerError>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn status(&self) -> Vec<TargetStatus> {
        self.targets.snapshot()
    }

    /// Stops accepting and releases the listener. Sessions already in flight
    /// keep running until their sockets close.
    pub async fn close(&mut self) -> Result<(), ServerError> {
        self.shutdown.send_replace(true);
        self.wait().await
    }

    /// Returns the fatal accept error, if that is what stopped the server.
    pub async fn wait(&mut self) -> Result<(), ServerError> {
        let mut result = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = joined.map_err(ServerError::Worker).and_then(|r| r);
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!("Load balancer on {} closed", self.local_addr);
        result
    }
}

struct AcceptWorker {
    id: usize,
    listener: Arc<TcpListener>,
    balancer: Arc<Balancer>,
    options: RelayOptions,
    connections: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
}

async fn accept_loop(worker: AcceptWorker) -> Result<(), ServerError> {
    let mut stop = worker.shutdown.subscribe();
    debug!("Accept worker {} started", worker.id);

    loop {
        let accepted = tokio::select! {
            _ = stop.wait_for(|&closed| closed) => break,
            accepted = worker.listener.accept() => accepted,
        };

        match accepted {
            Ok((client, peer)) => {
                let connection_id = worker.connections.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Worker {} received connection #{} from {}",
                    worker.id, connection_id, peer
                );
                tokio::spawn(relay::handle_client(
                    client,
                    peer,
                    Arc::clone(&worker.balancer),
                    worker.options,
                    connection_id,
                ));
            }
            // The client gave up between SYN and accept; nothing is wrong with
            // the listener.
            Err(e) if relay::is_closed_connection(&e) => {
                warn!("Worker {} dropped an aborted connection: {}", worker.id, e);
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                worker.shutdown.send_replace(true);
                return Err(ServerError::Accept(e));
            }
        }
    }

    debug!("Accept worker {} stopped", worker.id);
    Ok(())
}

async fn report_status(
    targets: Targets,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.wait_for(|&closed| closed) => break,
            _ = ticker.tick() => {
                info!("=== Periodic Status Update ===");
                targets.log_status();
            }
        }
    }
    Ok(())
}
