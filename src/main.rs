use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use courier::{init_logging, Messenger, MessengerConfig, StartOptions};

#[derive(Debug, Parser)]
#[command(name = "agent-courier")]
#[command(about = "Supervised messaging worker for agent CLI panes")]
struct Cli {
    /// Log filter, e.g. "info" or "courier::supervisor=debug".
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the host in the foreground: start the worker, report its broker
    /// port, and keep it supervised until Ctrl-C.
    Serve(ServeCommand),
    /// Internal: the worker process hosting the message broker.
    /// Spawned by the host over stdio; not for direct invocation.
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, clap::Args)]
struct ServeCommand {
    /// Broker listen port; 0 picks an ephemeral one.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Scope token clients must present to connect.
    #[arg(long)]
    scope: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Serve(cmd) => run_serve(cmd).await,
        Commands::Worker => courier::worker::run().await,
    }
}

async fn run_serve(cmd: ServeCommand) -> Result<()> {
    let messenger = Messenger::new(MessengerConfig::from_env());

    // Log surfaced client traffic, so `serve` doubles as a wire debugger.
    messenger.on_message(|data| async move {
        tracing::info!(target = "courier", data = %data, "client message");
        Ok(serde_json::json!({ "seen": true }))
    });

    let options = StartOptions {
        port: cmd.port,
        callback_timeout_ms: None,
        session_scope_id: cmd.scope,
    };
    let port = messenger
        .start(options)
        .await
        .context("failed to start messaging worker")?;
    tracing::info!(target = "courier", port, "worker up; broker accepting clients");

    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for ctrl-c")?;
    tracing::info!(target = "courier", "shutting down");
    messenger.stop().await?;
    Ok(())
}
