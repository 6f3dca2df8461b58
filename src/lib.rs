//! A transparent TCP load balancer.
//!
//! Accepted connections are relayed byte for byte to one of a fixed set of
//! targets, picked by round-robin, least-connections or source IP hash.

pub mod balancer;
pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod target;

pub use balancer::{Balancer, Mode};
pub use config::ServerConfig;
pub use error::{ConfigError, ServerError};
pub use relay::RelayOptions;
pub use server::{RunningServer, Server};
pub use target::{Target, TargetConfig, TargetStatus, Targets};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

pub async fn run_backend(listener: TcpListener) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!("Backend server started on {}", addr);

    let mut connection_count = 0u64;
    loop {
        let (mut stream, client_addr) = listener.accept().await?;
        connection_count += 1;
        info!(
            "Backend {} handling connection #{} from {}",
            addr, connection_count, client_addr
        );

        tokio::spawn(async move {
            // Only the first chunk of the request is read; the body is fixed.
            let mut request = [0u8; 1024];
            if let Err(e) = stream.read(&mut request).await {
                warn!("Backend {} failed to read request: {}", addr, e);
                return;
            }

            let body = format!("Response from backend {}\n", addr);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );

            match stream.write_all(response.as_bytes()).await {
                Ok(()) => {
                    let _ = stream.shutdown().await;
                    debug!(
                        "Backend {} responded to connection #{}",
                        addr, connection_count
                    );
                }
                Err(e) => warn!(
                    "Backend {} failed to write response to connection #{}: {}",
                    addr, connection_count, e
                ),
            }
        });
    }
}

pub fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    debug!("Logger initialized");
}
