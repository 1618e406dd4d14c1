mod cli;
mod config;
mod logging;
mod store;

use crate::cli::{Args, Command};
use crate::config::{load_kiosk_config, KioskConfig};
use crate::logging::init_tracing;
use crate::store::JsonlStore;
use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use intake_engine::{
    DeviceSession, FeedContext, IntakeError, ProgressEvent, RetryPolicy, SequenceExecutor,
    TriggerReport,
};
use protocol::SequenceStatus;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _file_guard = init_tracing(&args.log_dir, args.log_to_stderr)?;

    let config = load_kiosk_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    if let Command::Triggers = args.command {
        for trigger in &config.triggers {
            println!("{} ({} steps)", trigger.name, trigger.steps.len());
        }
        return Ok(());
    }

    let store = Arc::new(
        JsonlStore::open(&args.data_dir)
            .await
            .with_context(|| format!("failed to open data dir {}", args.data_dir.display()))?,
    );
    let session = build_session(&config, store)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let result = dispatch(&config, &session, args.command, &cancel).await;
    session.disconnect().await;
    result
}

fn build_session(config: &KioskConfig, store: Arc<JsonlStore>) -> anyhow::Result<DeviceSession> {
    let transport = serial_link::build_transport(&config.transport, &config.simulator)
        .context("failed to build transport")?;
    let executor = SequenceExecutor::new(transport, RetryPolicy::from(&config.executor));
    Ok(DeviceSession::from_config(
        config,
        executor,
        store.clone(),
        store,
    ))
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(event = "kiosk.interrupted");
            cancel.cancel();
        }
    });
}

async fn dispatch(
    config: &KioskConfig,
    session: &DeviceSession,
    command: Command,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Run { trigger, user } => {
            let trigger = config
                .trigger(&trigger)
                .with_context(|| format!("unknown trigger {trigger}"))?;
            let feed = user.map(FeedContext::today);
            run_trigger(session, trigger, feed.as_ref(), cancel).await
        }
        Command::Health => {
            let report = session.check_health(cancel).await.map_err(surface)?;
            match (report.temperature, report.reason.as_deref()) {
                (_, Some(reason)) => println!("{}: {reason}", report.status),
                (Some(celsius), None) => println!("{} ({celsius} C)", report.status),
                (None, None) => println!("{}", report.status),
            }
            Ok(())
        }
        Command::Status => {
            let state = session.current_state().await.map_err(surface)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::ResetBuckets => {
            let state = session.reset_buckets().await.map_err(surface)?;
            println!("buckets reset on {} at {}", state.robot_code, state.recorded_at);
            Ok(())
        }
        Command::Ports => {
            for port in session.ports().await.map_err(surface)? {
                println!("{}\t{}", port.device, port.description);
            }
            Ok(())
        }
        Command::Stats { user, date } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let stats = session.user_stats(&user, date).await.map_err(surface)?;
            println!(
                "{user} on {date}: {:.3} kg in {} feeds, {} points total",
                stats.today_kg, stats.today_count, stats.total_points
            );
            Ok(())
        }
        Command::Triggers => Ok(()),
    }
}

async fn run_trigger(
    session: &DeviceSession,
    trigger: &protocol::Trigger,
    feed: Option<&FeedContext>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            print_progress(&event);
        }
    });

    let result = session
        .run_trigger(trigger, feed, Some(&progress_tx), cancel)
        .await;
    drop(progress_tx);
    let _ = printer.await;

    let report = result.map_err(surface)?;
    print_report(&report);
    match report.sequence.status {
        SequenceStatus::Completed => Ok(()),
        SequenceStatus::Cancelled => {
            println!("cancelled");
            Ok(())
        }
        SequenceStatus::Failed => Err(anyhow::anyhow!(
            "{} failed: {}",
            report.trigger,
            report.sequence.error().unwrap_or("unknown error")
        )),
    }
}

fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Send {
            index,
            total,
            command,
        } => println!("[{index}/{total}] send {command}"),
        ProgressEvent::Receive {
            index,
            total,
            received: Some(received),
        } => println!("[{index}/{total}] recv {received}"),
        ProgressEvent::Receive {
            index,
            total,
            received: None,
        } => println!("[{index}/{total}] no response expected"),
    }
}

fn print_report(report: &TriggerReport) {
    for receipt in &report.receipts {
        println!(
            "recorded {:.3} kg, {} points ({:.3} kg today)",
            receipt.recorded_kg, receipt.points, receipt.today_total_kg
        );
        if let Some(err) = &receipt.points_error {
            println!("points not saved: {err}");
        }
    }
    for err in &report.accounting_errors {
        println!("accounting error: {err}");
    }
    println!(
        "active {} [{:.3}, {:.3}, {:.3}, {:.3}] kg, status {}",
        report.state.active_bucket,
        report.state.bucket1,
        report.state.bucket2,
        report.state.bucket3,
        report.state.bucket4,
        report.state.device_status
    );
}

fn surface(err: IntakeError) -> anyhow::Error {
    if matches!(err, IntakeError::Cancelled) {
        tracing::info!(event = "kiosk.cancelled");
    } else if err.is_business() {
        tracing::warn!(event = "kiosk.refused", error = %err);
    }
    anyhow::Error::new(err)
}
