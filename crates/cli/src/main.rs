use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    wapi_whatsapp::SidecarConnector,
};

#[derive(Parser)]
#[command(name = "wapi", about = "wapi: multi-session WhatsApp gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file. Defaults to one found in the working directory or `~/.config/wapi/`.
    #[arg(long, global = true, env = "WAPI_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default).
    Serve,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "wapi starting");

    let config = wapi_config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let connector = Arc::new(SidecarConnector::from_config(&config.whatsapp));
            wapi_gateway::start_gateway(&config, connector).await
        },
        Commands::CheckConfig => {
            let tls = config.tls_paths()?.is_some();
            println!(
                "config ok: {}:{} (tls: {tls}), webhook base {}, bridge {}",
                config.server.bind,
                config.server.port,
                config.webhook.base_url,
                config.whatsapp.sidecar_url,
            );
            Ok(())
        },
    }
}
