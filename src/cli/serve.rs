use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::{signal, sync::watch};

use crate::gateway::TranscodeGateway;
use crate::probe;
use crate::tunnel::{TunnelConfig, TunnelManager};

const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
pub struct ServeCommand {
    /// Config file path
    #[arg(short, long, default_value = "camgate.json")]
    pub config: PathBuf,

    /// Serve locally only, without the reverse tunnel
    #[arg(long)]
    pub no_tunnel: bool,
}

impl Default for ServeCommand {
    fn default() -> Self {
        Self {
            config: PathBuf::from("camgate.json"),
            no_tunnel: false,
        }
    }
}

impl ServeCommand {
    pub async fn run(self) -> Result<()> {
        let config = super::load_or_init(&self.config)?;

        // Shutdown signal
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let gateway = Arc::new(TranscodeGateway::new(
            config.sources.clone(),
            config.transcoder.clone(),
            config.max_streams,
            shutdown_rx.clone(),
        ));

        println!(
            "Serving {} camera(s), up to {} concurrent stream(s)",
            config.sources.len(),
            config.max_streams
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], config.local_http_port));
        println!("HTTP server listening on http://localhost:{}", config.local_http_port);

        let server_handle = {
            let gateway = Arc::clone(&gateway);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::server::run_server(addr, gateway, shutdown_rx).await {
                    eprintln!("[server] error: {}", e);
                }
            })
        };

        // Prove the front door answers before publishing it through the tunnel
        tokio::time::sleep(Duration::from_millis(200)).await;
        match probe::check_local_http(config.local_http_port).await {
            Ok(()) => println!("Local server check passed"),
            Err(e) => eprintln!("Local server check failed: {}", e),
        }

        let tunnel_handle = if self.no_tunnel {
            println!("Tunnel disabled (--no-tunnel)");
            None
        } else {
            let manager = TunnelManager::new(
                TunnelConfig {
                    host: config.vps_host.clone(),
                    port: config.vps_port,
                    user: config.vps_user.clone(),
                    key_path: config.key_path(),
                    passphrase: config.ssh_passphrase.clone(),
                    remote_port: config.vps_http_port,
                    local_addr: config.local_http_addr(),
                },
                shutdown_rx.clone(),
            );
            Some(tokio::spawn(async move {
                if let Err(e) = manager.run().await {
                    eprintln!("[tunnel] error: {}", e);
                }
            }))
        };

        // Wait for Ctrl+C
        signal::ctrl_c().await?;
        println!("\nShutting down...");
        let _ = shutdown_tx.send(true);

        gateway.wait_idle(DRAIN_GRACE).await;
        if let Some(handle) = tunnel_handle {
            let _ = handle.await;
        }
        let _ = server_handle.await;

        println!("Done.");
        Ok(())
    }
}
