//! Sequence-indexed packet collection.
//!
//! "Complete" means every sequence from 1 to the highest one seen is present.
//! Sequences above the highest seen are unknown and never reported missing.
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::error::MalformedPacket;
use crate::packet::{Frame, Packet};

/// Outcome of feeding one raw frame into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Stored(Packet),
    Duplicate(Packet),
    Malformed(MalformedPacket),
}

#[derive(Debug, Default, Clone)]
pub struct PacketStore {
    packets: BTreeMap<i32, Packet>,
}

impl PacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the sequence is already held (first writer wins).
    /// Returns `true` when the packet was new.
    pub fn insert(&mut self, packet: Packet) -> bool {
        match self.packets.entry(packet.sequence()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(packet);
                true
            }
        }
    }

    /// Validate a raw frame and insert it if it is new.
    pub fn ingest(&mut self, frame: &Frame) -> Ingested {
        match Packet::from_frame(frame) {
            Ok(packet) if self.insert(packet) => Ingested::Stored(packet),
            Ok(packet) => Ingested::Duplicate(packet),
            Err(e) => Ingested::Malformed(e),
        }
    }

    pub fn contains(&self, sequence: i32) -> bool {
        self.packets.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Highest sequence held, 0 when empty.
    pub fn max_sequence(&self) -> i32 {
        self.packets.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of sequences in `1..=max_sequence()` not held. Constant time, so
    /// it is safe to call before materializing a huge gap list.
    pub fn gap_count(&self) -> usize {
        (self.max_sequence() as usize).saturating_sub(self.len())
    }

    /// Every sequence in `1..=max_sequence()` not held, ascending.
    pub fn missing_sequences(&self) -> Vec<i32> {
        let max = self.max_sequence();
        let mut missing = Vec::with_capacity(self.gap_count());
        let mut held = self.packets.keys().copied().peekable();
        for seq in 1..=max {
            if held.peek() == Some(&seq) {
                held.next();
            } else {
                missing.push(seq);
            }
        }
        missing
    }

    /// All packets ascending by sequence.
    pub fn export_sorted(&self) -> Vec<Packet> {
        self.packets.values().copied().collect()
    }
}
