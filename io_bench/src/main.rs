use std::fmt;

use clap::Parser;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use io_bench::client::Client;
use io_bench::opts::{Cli, Opts};
use io_bench::server::Server;
use io_bench::status::{RunStatus, StatusLatch};

/// Epoch-seconds timestamps, the default log format.
struct EpochTime;

impl FormatTime for EpochTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        write!(w, "[{}.{:06}]", now.as_secs(), now.subsec_micros())
    }
}

fn init_logging(opts: &Opts) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if opts.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if opts.human_time {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_timer(EpochTime)
            .init();
    }
}

fn print_info() {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "<unknown>".to_string());
    tracing::info!("Starting io_bench pid {} on {}", std::process::id(), host);

    let cmdline: Vec<String> = std::env::args().collect();
    tracing::info!("Command line: {}", cmdline.join(" "));
}

fn do_server(opts: Opts, latch: StatusLatch) -> i32 {
    let mut server = Server::new(opts, latch);
    server.run();
    0
}

fn do_client(opts: Opts, latch: StatusLatch) -> i32 {
    let mut client = Client::new(opts, latch);
    let status = client.run();
    tracing::info!("Client exit with status '{}'", status.as_str());
    match status {
        RunStatus::Ok | RunStatus::RuntimeExceeded => 0,
        _ => -1,
    }
}

fn main() {
    let cli = Cli::parse();
    let opts = match Opts::from_cli(cli) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(-1);
        }
    };

    init_logging(&opts);
    print_info();

    let latch = StatusLatch::new();
    {
        let latch = latch.clone();
        ctrlc::set_handler(move || {
            latch.set(RunStatus::TerminateSignaled);
        })
        .expect("failed to set signal handler");
    }

    let code = if opts.servers.is_empty() {
        do_server(opts, latch)
    } else {
        do_client(opts, latch)
    };
    std::process::exit(code);
}
