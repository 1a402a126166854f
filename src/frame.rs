//! Fixed-length framing over a byte stream.
//!
//! The decoder never looks inside a frame. It only buffers bytes and cuts
//! [`PACKET_SIZE`]-byte slices off the front in arrival order.
use bytes::{Buf, BytesMut};

use crate::packet::{Frame, PACKET_SIZE};

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4 * 1024) }
    }

    /// Append a received chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Cut the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < PACKET_SIZE {
            return None;
        }
        let mut frame = [0u8; PACKET_SIZE];
        self.buf.copy_to_slice(&mut frame);
        Some(frame)
    }

    /// Drain every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// End of stream: drop any partial frame and return how many bytes were lost.
    pub fn finish(mut self) -> usize {
        let leftover = self.buf.len();
        self.buf.clear();
        leftover
    }
}

pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.decoder.next_frame()
    }
}
