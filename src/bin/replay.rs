use anyhow::Result;
use clap::Parser;
use market_feed::replay::replay_capture;
use market_feed::sink::{JsonFileSink, PacketSink};
use market_feed::store::Ingested;
use std::path::PathBuf;
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(about = "Replay a feed capture through validation, gap check and integrity check")]
struct Args {
    /// Input capture file (recorded .bin)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Export the replayed packets as JSON if the capture is complete
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,

    /// Print every frame as it is read
    #[arg(long, default_value_t = false)]
    dump: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
    let args = Args::parse();

    let (header, replay) = replay_capture(&args.input, |fr, outcome| match outcome {
        Ingested::Stored(p) | Ingested::Duplicate(p) => {
            if args.dump {
                println!(
                    "seq={} round={:?} {:?} {:?} qty={} price={}",
                    p.sequence(),
                    fr.round,
                    p.symbol(),
                    p.side(),
                    p.quantity(),
                    p.price()
                );
            }
        }
        Ingested::Malformed(e) => warn!(record = fr.seq, round = ?fr.round, "{e}"),
    })?;
    info!(
        endpoint = %header.endpoint,
        created_unix_ns = header.created_unix_ns,
        "capture replayed"
    );

    let c = &replay.counts;
    eprintln!(
        "Read {} frames ({} from resend rounds): \
         {} stored, {} malformed, {} duplicates, {} missing.",
        c.frames,
        c.resend_frames,
        replay.store.len(),
        c.discarded,
        c.duplicates,
        replay.store.gap_count()
    );

    let packets = replay.verified_packets()?;
    if let Some(out) = args.out {
        JsonFileSink::new(out).write_packets(&packets)?;
    }
    Ok(())
}
