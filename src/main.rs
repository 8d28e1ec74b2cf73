use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use galileo::config::Config;
use galileo::state::Gateway;
use galileo::tmpl::{DefaultTemplates, Templates};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "galileo")]
#[command(about = "Gemini proxy for the WWW", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'f', long = "config", default_value = "galileo.toml")]
    config: PathBuf,

    /// Check that the configuration is valid, then exit
    #[arg(short = 'n', long)]
    configtest: bool,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if cli.configtest {
        println!("configuration OK");
        return Ok(());
    }
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.workers)
        .enable_all()
        .build()?;
    runtime.block_on(run(config, cli.config))
}

async fn run(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let listen_addr = config.server.listen_addr.clone();
    info!("Starting galileo...");
    info!("  Listen: {}", listen_addr);
    info!("  Proxies: {}", config.proxies.len());

    let gateway = Arc::new(Gateway::new(config));
    let templates: Arc<dyn Templates> = Arc::new(DefaultTemplates);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Gateway ready!");

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let serve = galileo::fcgi::serve(listener, gateway.clone(), templates);
    tokio::pin!(serve);

    loop {
        tokio::select! {
            result = &mut serve => {
                result?;
                return Ok(());
            }
            _ = hangup.recv() => {
                match Config::load(&config_path) {
                    Ok(next) => {
                        info!(proxies = next.proxies.len(), "configuration reloaded");
                        gateway.reload(next);
                    }
                    Err(err) => warn!(error = %err, "reload failed, keeping old configuration"),
                }
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
        }
    }
}
