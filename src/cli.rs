use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use sandterm::DisconnectPolicy;

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_buffer(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "sandterm",
    version,
    about = "Sandboxed terminal sessions: one Docker container per submission, streamed over WebSocket."
)]
pub(crate) struct Cli {
    /// Debug-level logging for sandterm (RUST_LOG still wins)
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,

    /// Data directory holding sessions.json and projects/ (default: $SANDTERM_DATA_DIR or ./data)
    #[arg(long, global = true)]
    pub(crate) data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Run the terminal server
    Serve(ServeArgs),
    /// Print resolved configuration and check the container runtime
    Doctor,
    /// Start (or look up) the session for a project and operator
    Start {
        #[arg(long)]
        project: String,
        #[arg(long)]
        operator: String,
    },
    /// Terminate a session: stop and remove its container
    Terminate {
        session: String,
    },
    /// List active sessions of an operator
    List {
        #[arg(long)]
        operator: String,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub(crate) struct ServeArgs {
    /// Listen address (default: $SANDTERM_BIND or 127.0.0.1:5000)
    #[arg(long)]
    pub(crate) bind: Option<SocketAddr>,

    /// Base image for session containers
    #[arg(long)]
    pub(crate) image: Option<String>,

    /// What to do with a session when its client disconnects
    #[arg(long = "on-disconnect", value_enum)]
    pub(crate) on_disconnect: Option<DisconnectPolicy>,

    /// Outbound events queued per client before backpressure applies
    #[arg(long = "output-buffer", value_parser = parse_buffer)]
    pub(crate) output_buffer: Option<usize>,

    /// Disconnect a client whose queue stays full this long (e.g. 5s, 750ms)
    #[arg(long = "slow-client-timeout", value_parser = parse_duration)]
    pub(crate) slow_client_timeout: Option<Duration>,
}
