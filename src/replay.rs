//! Offline replay of a capture through the same validation and store the
//! live session uses.
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::integrity;
use crate::packet::{Frame, Packet, PACKET_SIZE};
use crate::record::{open_capture, read_frame, CaptureHeader, FrameRecord, RecordFrame, RoundKind};
use crate::store::{Ingested, PacketStore};

/// Gap lists longer than this are summarized instead of printed.
const MAX_LISTED_GAPS: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayCounts {
    pub frames: usize,
    /// Frames received in answer to a resend request.
    pub resend_frames: usize,
    pub discarded: usize,
    pub duplicates: usize,
}

#[derive(Debug)]
pub struct Replay {
    pub store: PacketStore,
    pub counts: ReplayCounts,
}

impl Replay {
    /// Sorted packets, provided the capture holds a complete, duplicate-free run.
    pub fn verified_packets(&self) -> Result<Vec<Packet>> {
        let gaps = self.store.gap_count();
        if gaps > MAX_LISTED_GAPS {
            bail!(
                "capture is incomplete; {} sequences missing below {}",
                gaps,
                self.store.max_sequence()
            );
        }
        if gaps > 0 {
            bail!("capture is incomplete; missing sequences {:?}", self.store.missing_sequences());
        }
        let packets = self.store.export_sorted();
        integrity::verify(&packets)?;
        Ok(packets)
    }
}

/// Feed every frame record from `rdr` into a fresh store. `rdr` must be
/// positioned after the capture header. `on_frame` sees each record with the
/// outcome of ingesting it.
pub fn replay_frames<R: Read>(
    rdr: &mut R,
    mut on_frame: impl FnMut(&FrameRecord, &Ingested),
) -> Result<Replay> {
    let mut store = PacketStore::new();
    let mut counts = ReplayCounts::default();
    let mut index = 1;
    while let Some(rec) = read_frame(rdr, index)? {
        let RecordFrame::Frame(fr) = rec else {
            bail!("unexpected header at record {index}");
        };
        index += 1;
        let raw: Frame = fr.bytes.as_slice().try_into().with_context(|| {
            let len = fr.bytes.len();
            format!("record {}: frame is {len} bytes, expected {PACKET_SIZE}", fr.seq)
        })?;
        counts.frames += 1;
        if matches!(fr.round, RoundKind::Resend { .. }) {
            counts.resend_frames += 1;
        }
        let outcome = store.ingest(&raw);
        match &outcome {
            Ingested::Stored(_) => {}
            Ingested::Duplicate(_) => counts.duplicates += 1,
            Ingested::Malformed(_) => counts.discarded += 1,
        }
        on_frame(&fr, &outcome);
    }
    Ok(Replay { store, counts })
}

/// Open a capture file and replay all of it.
pub fn replay_capture(
    path: &Path,
    on_frame: impl FnMut(&FrameRecord, &Ingested),
) -> Result<(CaptureHeader, Replay)> {
    let (header, mut rdr) = open_capture(path)?;
    let replay = replay_frames(&mut rdr, on_frame)?;
    Ok((header, replay))
}
