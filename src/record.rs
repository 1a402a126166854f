//! On-disk capture of raw frames as they arrive.
//!
//! Each record is `[len:u32 LE][crc32:u32 LE][payload]` where the payload is a
//! bincode-encoded [`RecordFrame`]. The first record is always a
//! [`CaptureHeader`]. Frames are recorded before validation, so a capture
//! replays malformed packets exactly as the server sent them.
use anyhow::{bail, Context, Result};
use crc32fast::Hasher as Crc32;
use crossbeam_channel::{bounded, Sender};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::error;

pub const CAPTURE_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    pub endpoint: String,
}

/// Which request a frame was received in response to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundKind {
    Initial,
    Resend { target: i32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub seq: u64,                      // monotonic per capture
    pub recv_unix_ns: u128,            // SystemTime::now()
    pub recv_mono_ns_from_start: u128, // Instant since recorder start
    pub round: RoundKind,
    pub bytes: Vec<u8>,                // one raw 17-byte frame
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(CaptureHeader),
    Frame(FrameRecord),
}

pub fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

pub fn write_frame<W: Write>(w: &mut W, frame: &RecordFrame) -> Result<()> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read the next record; `Ok(None)` at a clean end of file.
pub fn read_frame<R: Read>(r: &mut R, index: usize) -> Result<Option<RecordFrame>> {
    let len = match read_u32(r) {
        Ok(v) => v as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let crc_on_file = read_u32(r).with_context(|| format!("record {index}: truncated header"))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).with_context(|| format!("record {index}: truncated payload"))?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc_calc = hasher.finalize();
    if crc_calc != crc_on_file {
        bail!("CRC mismatch at record {}: file={:#x}, calc={:#x}", index, crc_on_file, crc_calc);
    }
    let frame = bincode::deserialize(&payload).context("bincode decode")?;
    Ok(Some(frame))
}

/// Open a capture and return its header plus a reader positioned after it.
pub fn open_capture(path: &Path) -> Result<(CaptureHeader, BufReader<File>)> {
    let mut rdr = BufReader::new(File::open(path).with_context(|| format!("open {path:?}"))?);
    match read_frame(&mut rdr, 0)? {
        Some(RecordFrame::Header(h)) => {
            if h.version != CAPTURE_VERSION {
                bail!("unsupported capture version {}", h.version);
            }
            Ok((h, rdr))
        }
        Some(RecordFrame::Frame(_)) => bail!("capture does not start with a header"),
        None => bail!("capture is empty"),
    }
}

fn create_capture(out: &Path) -> Result<File> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create capture directory {parent:?}"))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(out)
        .with_context(|| format!("open capture {out:?}"))
}

fn writer_thread(file: File, rx: crossbeam_channel::Receiver<RecordFrame>) -> Result<()> {
    let mut w = BufWriter::with_capacity(1 << 16, file);
    for frame in rx {
        write_frame(&mut w, &frame)?;
    }
    w.flush()?;
    Ok(())
}

/// Background capture writer. Recording never blocks the session on disk I/O
/// beyond the bounded channel.
#[derive(Debug)]
pub struct Recorder {
    tx: Sender<RecordFrame>,
    handle: JoinHandle<Result<()>>,
    seq: u64,
    start: Instant,
}

impl Recorder {
    /// Create the capture file and start the writer thread.
    pub fn spawn(out: PathBuf, endpoint: &str) -> Result<Self> {
        let file = create_capture(&out)?;
        let (tx, rx) = bounded::<RecordFrame>(8192);
        let handle = std::thread::Builder::new()
            .name("capture-writer".into())
            .spawn(move || writer_thread(file, rx))
            .context("spawn capture writer")?;
        let header = RecordFrame::Header(CaptureHeader {
            version: CAPTURE_VERSION,
            created_unix_ns: now_unix_ns(),
            endpoint: endpoint.to_string(),
        });
        tx.send(header).context("capture writer exited")?;
        Ok(Self { tx, handle, seq: 0, start: Instant::now() })
    }

    pub fn record(&mut self, round: RoundKind, frame: &[u8]) {
        let rec = FrameRecord {
            seq: self.seq,
            recv_unix_ns: now_unix_ns(),
            recv_mono_ns_from_start: self.start.elapsed().as_nanos(),
            round,
            bytes: frame.to_vec(),
        };
        self.seq += 1;
        if self.tx.send(RecordFrame::Frame(rec)).is_err() {
            error!("capture writer is gone; frame not recorded");
        }
    }

    /// Close the channel and wait for the file to be flushed.
    pub fn finish(self) -> Result<()> {
        drop(self.tx);
        match self.handle.join() {
            Ok(res) => res.context("capture writer"),
            Err(_) => bail!("capture writer panicked"),
        }
    }
}
