use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use radiowo_host::{Cli, ControlCommand, ControlResponse, Host};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings().context("invalid configuration")?;

    let default_filter = if settings.debug { "radiowo_host=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        hub = %settings.ws_server,
        api = %settings.api_server,
        turn = settings.ice_server.as_deref().unwrap_or("none"),
        "radiowo host starting"
    );
    let host = Host::from_settings(&settings).context("building host")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading control input")? else {
                    debug!("control input closed");
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<ControlCommand>(line) {
                    Ok(command) => host.rooms().handle_command(command).await,
                    Err(e) => {
                        warn!("ignoring malformed control command: {}", e);
                        ControlResponse::ActionResponse { success: false }
                    }
                };
                let mut reply = serde_json::to_string(&response)?;
                reply.push('\n');
                stdout.write_all(reply.as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    host.shutdown().await;
    info!("radiowo host stopped");
    Ok(())
}
