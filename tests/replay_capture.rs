use market_feed::packet::{encode_frame, Frame};
use market_feed::record::{Recorder, RoundKind};
use market_feed::replay::{replay_capture, ReplayCounts};
use market_feed::sink::{JsonFileSink, PacketSink};
use market_feed::store::Ingested;
use std::path::Path;

fn frame(seq: i32) -> Frame {
    encode_frame(b"AMZN", b'S', 5 + seq, 18_000 + seq, seq)
}

fn write_capture(path: &Path, frames: &[(RoundKind, Frame)]) {
    let mut rec = Recorder::spawn(path.to_path_buf(), "127.0.0.1:3000").unwrap();
    for (round, f) in frames {
        rec.record(*round, f);
    }
    rec.finish().unwrap();
}

#[test]
fn complete_capture_replays_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feed.bin");

    // Initial stream loses 2 to a bad symbol and repeats 3; a resend heals 2.
    write_capture(
        &path,
        &[
            (RoundKind::Initial, frame(1)),
            (RoundKind::Initial, encode_frame(b"ZZZZ", b'B', 1, 1, 2)),
            (RoundKind::Initial, frame(3)),
            (RoundKind::Initial, frame(3)),
            (RoundKind::Initial, frame(4)),
            (RoundKind::Resend { target: 2 }, frame(2)),
        ],
    );

    let mut seen = Vec::new();
    let (header, replay) = replay_capture(&path, |fr, outcome| {
        seen.push((fr.seq, matches!(outcome, Ingested::Stored(_))));
    })
    .unwrap();

    assert_eq!(header.endpoint, "127.0.0.1:3000");
    assert_eq!(
        replay.counts,
        ReplayCounts { frames: 6, resend_frames: 1, discarded: 1, duplicates: 1 }
    );
    assert_eq!(
        seen,
        vec![(0, true), (1, false), (2, true), (3, false), (4, true), (5, true)]
    );

    let packets = replay.verified_packets().unwrap();
    let seqs: Vec<i32> = packets.iter().map(|p| p.sequence()).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    let out = dir.path().join("output.json");
    JsonFileSink::new(&out).write_packets(&packets).unwrap();
    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(doc.as_array().unwrap().len(), 4);
    assert_eq!(doc[1]["sequence"], 2);
    assert_eq!(doc[1]["side"], "S");
}

#[test]
fn incomplete_capture_reports_missing_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gappy.bin");
    write_capture(
        &path,
        &[
            (RoundKind::Initial, frame(1)),
            (RoundKind::Initial, frame(2)),
            (RoundKind::Initial, frame(4)),
            (RoundKind::Initial, frame(6)),
        ],
    );

    let (_, replay) = replay_capture(&path, |_, _| {}).unwrap();
    assert_eq!(replay.store.missing_sequences(), vec![3, 5]);
    let err = replay.verified_packets().unwrap_err();
    assert_eq!(err.to_string(), "capture is incomplete; missing sequences [3, 5]");
}

#[test]
fn truncated_capture_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.bin");
    write_capture(&path, &[(RoundKind::Initial, frame(1)), (RoundKind::Initial, frame(2))]);

    // Chop the last record mid-payload.
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let err = replay_capture(&path, |_, _| {}).unwrap_err();
    assert!(format!("{err:#}").contains("truncated payload"));
}
