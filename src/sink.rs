//! Persistence sinks for the final, ordered dataset.
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::ExportError;
use crate::packet::Packet;

/// Receives the validated packets, ascending by sequence, once per session.
pub trait PacketSink {
    fn write_packets(&mut self, packets: &[Packet]) -> Result<(), ExportError>;
}

/// Collects packets in memory.
impl PacketSink for Vec<Packet> {
    fn write_packets(&mut self, packets: &[Packet]) -> Result<(), ExportError> {
        self.extend_from_slice(packets);
        Ok(())
    }
}

/// Writes a pretty-printed JSON array, one object per packet.
///
/// The document goes to a `.tmp` sibling first and is renamed into place, so
/// readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PacketSink for JsonFileSink {
    fn write_packets(&mut self, packets: &[Packet]) -> Result<(), ExportError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut w, packets)?;
        w.write_all(b"\n")?;
        w.flush()?;
        drop(w);
        fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), count = packets.len(), "packets exported");
        Ok(())
    }
}
