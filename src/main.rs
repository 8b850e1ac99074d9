use clap::Parser;
use osmosis_feed::{App, AppResult, LogFormat, Settings, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Streams Osmosis spot prices to websocket subscribers"
)]
struct Cli {
    /// REST endpoint of the chain node to query
    chain_endpoint: String,
    #[arg(short, long, default_value = "configs/default.toml")]
    config: String,
    /// Logging level or filter directive; overrides the config file
    #[arg(long)]
    log_level: Option<String>,
    /// Logging format; overrides the config file
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        settings.telemetry.log_level = level;
    }
    if let Some(format) = cli.log_format {
        settings.telemetry.format = format;
    }
    telemetry::init(&settings.telemetry)?;

    let shutdown = CancellationToken::new();
    trap_signals(shutdown.clone());

    App::new(settings, cli.chain_endpoint).run(shutdown).await
}

fn trap_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "caught signal, shutting down");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
