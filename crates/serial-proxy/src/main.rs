mod cli;
mod relay;
mod server;

use crate::cli::Args;
use crate::server::{router, ProxyState, SerialPorts};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr)?;

    let state = ProxyState::new(Arc::new(SerialPorts));
    if let Some(port) = &args.port {
        state
            .connect(port)
            .await
            .with_context(|| format!("failed to open {port}"))?;
    }

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "serial proxy listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;
    info!("serial proxy shutting down");
    Ok(())
}

fn init_tracing(log_to_stderr: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
