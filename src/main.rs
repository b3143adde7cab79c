//! Purpose: `linespool` CLI entry point.
//! Role: Binary crate root; parses args, initializes logging, runs the server.
//! Invariants: Errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::io;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

use linespool::api::{
    DEFAULT_CAPACITY, DEFAULT_PORT, Error, ErrorKind, ServeConfig, Server, to_exit_code,
};

#[derive(Parser)]
#[command(
    name = "linespool",
    version,
    about = "Bounded in-memory spool of newline-delimited records served over TCP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the log server.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Listening port; 0 picks an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of record slots retained before eviction begins.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Append a timestamp record every N seconds (0 disables).
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    timestamp_secs: u64,

    /// Fork to the background after binding.
    #[arg(short = 'd', long)]
    daemon: bool,
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Command::Serve(args) => run_serve(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<(), Error> {
    let config = ServeConfig {
        port: args.port,
        capacity: args.capacity,
        timestamp_interval: (args.timestamp_secs > 0)
            .then(|| Duration::from_secs(args.timestamp_secs)),
    };

    let server = Server::bind(config)?;
    if args.daemon {
        daemonize()?;
    }

    let handle = server.shutdown_handle();
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to install signal handlers")
            .with_source(err)
    })?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("caught signal, shutting down");
            handle.shutdown();
        }
    });

    server.run()
}

/// Forks after a successful bind so the child owns the listener; the parent
/// exits immediately. Runs before any worker thread exists.
fn daemonize() -> Result<(), Error> {
    match unsafe { libc::fork() } {
        -1 => Err(Error::new(ErrorKind::Io)
            .with_message("fork failed")
            .with_source(io::Error::last_os_error())),
        0 => {
            if unsafe { libc::setsid() } == -1 {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("setsid failed")
                    .with_source(io::Error::last_os_error()));
            }
            Ok(())
        }
        _ => std::process::exit(0),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

fn emit_error(err: &Error) {
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            peer: err.peer().map(|peer| peer.to_string()),
            offset: err.offset(),
        },
    };
    let json = serde_json::to_string(&envelope).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}
