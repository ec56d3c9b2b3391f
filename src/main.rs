use clap::Parser;
use dockerdns::{Agent, Config, Error};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Base domain records are published under.
    #[arg(long)]
    base_domain: Option<String>,
}

async fn run(args: Args) -> Result<i32, Error> {
    let config = Config::from_env(args.base_domain)?;
    let agent = Agent::new(config).await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let code = select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
            0
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
            130
        }
    };

    agent.shutdown().await;

    Ok(code)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    };

    std::process::exit(code);
}
