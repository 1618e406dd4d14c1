use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "kiosk",
    version,
    about = "Drives a coffee-bean collection unit over its serial command protocol"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "config/kiosk.toml")]
    pub(crate) config: PathBuf,
    /// Directory holding the equipment, intake and point ledgers.
    #[arg(long, default_value = "data")]
    pub(crate) data_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    pub(crate) log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Run a configured trigger, crediting the feed to a user when one is given.
    Run {
        #[arg(long)]
        trigger: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Probe liveness and temperature and record the device status.
    Health,
    /// Show the latest recorded equipment state.
    Status,
    /// Record that an operator emptied every bucket.
    ResetBuckets,
    /// List serial ports visible to the configured transport.
    Ports,
    /// List configured triggers.
    Triggers,
    /// Show a user's intake for a day and lifetime points.
    Stats {
        #[arg(long)]
        user: String,
        /// Calendar day (YYYY-MM-DD), today in UTC by default.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}
