use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use market_feed::record::Recorder;
use market_feed::{JsonFileSink, Session, SessionConfig, SessionError, SessionReport, TcpConnector};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn, Level};

#[derive(Debug, Parser)]
#[command(version, about = "Fetch, gap-fill and export a market data packet stream")]
struct Args {
    /// Feed server host
    #[arg(long, env = "FEED_HOST", default_value = "localhost")]
    host: String,

    /// Feed server port
    #[arg(long, env = "FEED_PORT", default_value_t = 3000)]
    port: u16,

    /// Output JSON file
    #[arg(long, short = 'o', env = "OUT_FILE", default_value = "output.json")]
    out: PathBuf,

    /// Resend passes over the gap list before giving up
    #[arg(long, env = "MAX_RESEND_PASSES", default_value_t = 5)]
    max_resend_passes: u32,

    /// Delay before the second resend pass, doubled for each later pass (ms)
    #[arg(long, env = "RESEND_BACKOFF_MS", default_value_t = 100)]
    backoff_ms: u64,

    /// Upper bound on the resend backoff (ms)
    #[arg(long, env = "RESEND_BACKOFF_MAX_MS", default_value_t = 5000)]
    max_backoff_ms: u64,

    /// Fail the session when more sequences than this are missing at once
    #[arg(long, env = "MAX_GAPS", default_value_t = 1024)]
    max_gaps: usize,

    /// Fail a round when the server sends nothing for this long (ms); waits forever if unset
    #[arg(long, env = "READ_TIMEOUT_MS")]
    read_timeout_ms: Option<u64>,

    /// Record raw frames to this capture file
    #[arg(long, env = "CAPTURE_FILE", conflicts_with = "capture_dir")]
    capture: Option<PathBuf>,

    /// Record raw frames to DIR/HOST_PORT_YYYY_MM_DD.bin
    #[arg(long, env = "CAPTURE_DIR")]
    capture_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

fn default_capture_path(dir: PathBuf, host: &str, port: u16) -> PathBuf {
    let now = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let d = now.date();
    let fname = format!(
        "{}_{}_{}_{:02}_{:02}.bin",
        host.replace(['.', ':'], "-"),
        port,
        d.year(),
        d.month() as u8,
        d.day()
    );
    dir.join(fname)
}

fn run(args: Args) -> Result<()> {
    let connector = TcpConnector::new(args.host.clone(), args.port)
        .with_read_timeout(args.read_timeout_ms.map(Duration::from_millis));
    let config = SessionConfig {
        max_resend_passes: args.max_resend_passes,
        initial_backoff: Duration::from_millis(args.backoff_ms),
        max_backoff: Duration::from_millis(args.max_backoff_ms),
        max_gaps_per_pass: args.max_gaps,
    };

    let capture = match (args.capture, args.capture_dir) {
        (Some(p), _) => Some(p),
        (None, Some(dir)) => Some(default_capture_path(dir, &args.host, args.port)),
        (None, None) => None,
    };

    let mut session = Session::new(connector, config);
    if let Some(path) = &capture {
        let endpoint = format!("{}:{}", args.host, args.port);
        let rec = Recorder::spawn(path.clone(), &endpoint)
            .with_context(|| format!("start capture {path:?}"))?;
        info!(path = %path.display(), "recording capture");
        session = session.with_recorder(rec);
    }

    let mut sink = JsonFileSink::new(&args.out);
    let outcome = session.run(&mut sink);
    // Flush the capture whether or not the session succeeded.
    let capture_flush = session.take_recorder().map(Recorder::finish);

    let report = settle(outcome, capture_flush)?;
    info!(
        packets = report.packets,
        resend_rounds = report.resend_rounds,
        discarded = report.discarded,
        duplicates = report.duplicates,
        "all packets received and saved"
    );
    Ok(())
}

/// Combine the session outcome with the capture flush. A session failure
/// always wins and carries its reason code; a capture error is then only logged.
fn settle(
    outcome: Result<SessionReport, SessionError>,
    capture_flush: Option<Result<()>>,
) -> Result<SessionReport> {
    match (outcome, capture_flush) {
        (Err(e), flush) => {
            if let Some(Err(ce)) = flush {
                warn!("capture not flushed: {ce:#}");
            }
            let reason = e.reason_code();
            Err(anyhow::Error::new(e).context(format!("session failed ({reason})")))
        }
        (Ok(_), Some(Err(ce))) => Err(ce.context("flush capture")),
        (Ok(report), _) => Ok(report),
    }
}

fn main() -> ExitCode {
    // Load environment variables from .env if present
    let _ = dotenv();
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    // No cancellation mid-session: Ctrl+C ends the process without exporting.
    ctrlc::set_handler(|| {
        error!("interrupted; exiting without export");
        std::process::exit(130);
    })
    .ok();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
