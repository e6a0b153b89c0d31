use anyhow::{Context, Result};
use clap::Parser;
use markovbot_backend::config::BotConfig;
use markovbot_backend::runtime::BackendRuntime;
use markovbot_backend::server::serve_backend;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Run the channel simulator and its control API.
#[derive(Debug, Parser)]
#[command(name = "markovbot_backend", version)]
struct Args {
    /// Use the short debug delays and frequent embeds.
    #[arg(long)]
    debug: bool,
    /// Mean seconds between simulated posts.
    #[arg(long)]
    avg: Option<f64>,
    /// Standard deviation of the delay, in seconds.
    #[arg(long)]
    stddev: Option<f64>,
    /// Fraction of posts with an image embed.
    #[arg(long)]
    embed: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,markovbot_backend=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = BotConfig::load();
    if args.debug {
        config.simulator.debug_values = true;
        config.simulator.apply_debug_values();
    }
    if let Some(avg) = args.avg {
        config.simulator.post_avg_secs = avg;
    }
    if let Some(stddev) = args.stddev {
        config.simulator.post_stddev_secs = stddev;
    }
    if let Some(embed) = args.embed {
        config.simulator.embed_rate = embed;
    }

    let mut runtime =
        BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Starting backend service (set MARKOVBOT_BACKEND_TOKEN + optional MARKOVBOT_BACKEND_BIND; auth mode via MARKOVBOT_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let simulator = runtime.spawn_simulator(shutdown_rx.clone());
        let events = runtime.events();

        let server = serve_backend(&runtime, events, shutdown_rx);
        tokio::pin!(server);
        let served = tokio::select! {
            result = &mut server => result,
            _ = wait_for_ctrl_c() => {
                tracing::info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
                server.await
            }
        };

        // Also stops the simulator when the server exits on its own.
        let _ = shutdown_tx.send(true);
        if let Some(simulator) = simulator {
            if let Err(e) = simulator.await {
                tracing::error!("Simulator task panicked: {}", e);
            }
        }
        served
    })
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
