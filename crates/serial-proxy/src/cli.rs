use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "serial-proxy",
    version,
    about = "Shares a collection unit's serial port over HTTP"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub(crate) listen_addr: String,
    /// Open this port at startup instead of waiting for `POST /connect`.
    #[arg(long)]
    pub(crate) port: Option<String>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
