use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;
use tcplb::{init_logger, run_backend, Mode, Server, ServerConfig, TargetConfig};
use tokio::{net::TcpListener, signal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent TCP load balancer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts local demo backends and balances across them.
    Demo {
        /// Address the balancer listens on.
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        /// Number of demo backends to start on ephemeral ports.
        #[arg(long, default_value_t = 3)]
        backends: usize,
        /// least-conn, round-robin or ip-hash.
        #[arg(long, default_value = "round-robin")]
        mode: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON config file; overrides the other flags.
    #[arg(long, env = "TCPLB_CONFIG")]
    config: Option<PathBuf>,
    /// Address to listen on.
    #[arg(long, env = "TCPLB_LISTEN", default_value = "0.0.0.0:7000")]
    listen: String,
    /// Backend as host:port. Repeat for each target, order matters.
    #[arg(long = "target", env = "TCPLB_TARGETS", value_delimiter = ',')]
    targets: Vec<String>,
    /// least-conn, round-robin or ip-hash.
    #[arg(long, env = "TCPLB_MODE", default_value = "least-conn")]
    mode: String,
    /// Number of accept loops sharing the listener.
    #[arg(long, env = "TCPLB_WORKERS", default_value_t = 1)]
    workers: usize,
    /// Backend connect timeout in milliseconds.
    #[arg(long, env = "TCPLB_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,
    /// Close a relay direction after this many idle milliseconds.
    #[arg(long, env = "TCPLB_IDLE_TIMEOUT_MS")]
    idle_timeout_ms: Option<u64>,
    /// Log target counters every N seconds.
    #[arg(long, env = "TCPLB_STATUS_INTERVAL_SECS")]
    status_interval_secs: Option<u64>,
}

impl RunArgs {
    fn server_config(&self) -> Result<ServerConfig> {
        if let Some(path) = &self.config {
            return Ok(ServerConfig::from_file(path)?);
        }

        let targets = self
            .targets
            .iter()
            .map(|t| t.parse::<TargetConfig>())
            .collect::<Result<Vec<_>, _>>()?;
        let mode: Mode = self.mode.parse()?;

        let mut config = ServerConfig::new(self.listen.clone(), targets, mode);
        config.connect_timeout_ms = self.connect_timeout_ms;
        config.idle_timeout_ms = self.idle_timeout_ms;
        config.status_interval_secs = self.status_interval_secs;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();

    let (config, workers) = match cli.command {
        Some(Command::Demo {
            listen,
            backends,
            mode,
        }) => (demo_config(listen, backends, &mode).await?, 1),
        None => (cli.run.server_config()?, cli.run.workers),
    };

    let server = Server::new(&config).context("invalid load balancer configuration")?;
    let mut running = server.run(workers).await?;

    let interrupted = tokio::select! {
        result = running.wait() => {
            if let Err(e) = &result {
                error!("Load balancer stopped: {}", e);
            }
            result?;
            false
        }
        _ = signal::ctrl_c() => true,
    };

    if interrupted {
        info!("Interrupted, closing listener");
        running.close().await?;
    }
    Ok(())
}

async fn demo_config(listen: String, backends: usize, mode: &str) -> Result<ServerConfig> {
    let mut targets = Vec::with_capacity(backends);
    for _ in 0..backends {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = run_backend(listener).await {
                error!("Backend {} error: {}", addr, e);
            }
        });
        targets.push(TargetConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        });
    }

    let mut config = ServerConfig::new(listen, targets, mode.parse()?);
    config.status_interval_secs = Some(30);
    Ok(config)
}
