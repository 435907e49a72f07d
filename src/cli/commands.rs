use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{expand_path, Mode, TunnelConfig};
use crate::tunnel;

use super::cert;
use super::config::{check_config, check_config_file_permissions};
use super::{Commands, RunArgs};

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    match &cli.command {
        Commands::Server(args) => run_mode(Mode::Server, args).await?,
        Commands::Client(args) => run_mode(Mode::Client, args).await?,
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name.as_deref(), alt_names)?;
        }
        Commands::Check {
            config,
            mode,
            format,
        } => {
            check_config(config, *mode, format)?;
        }
    }

    Ok(())
}

/// Run the tunnel in the given mode until Ctrl+C or a listener failure
async fn run_mode(mode: Mode, args: &RunArgs) -> Result<()> {
    if let Some(ref path) = args.config {
        info!("Loading configuration from: {}", path);
        check_config_file_permissions(&expand_path(path))?;
    }

    let file_config = args.load_file_config()?;
    let config = TunnelConfig::from_file_config(mode, &file_config)?;

    let listen_addr = file_config.listen_socket_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Unable to listen on {}", listen_addr))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
        signal.cancel();
    });

    tunnel::run_tunnel(listener, config, shutdown)
        .await
        .context("Relay engine stopped")?;

    info!("Shutdown complete");
    Ok(())
}
