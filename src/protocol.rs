//! Client request encoding: `[callType:u8][resendSeq:u8]`.
use tracing::warn;

pub const REQUEST_SIZE: usize = 2;

const CALL_STREAM_ALL: u8 = 1;
const CALL_RESEND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Stream every packet from the beginning.
    StreamAll,
    /// Resend the single packet with this sequence number.
    Resend(i32),
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        match *self {
            Request::StreamAll => [CALL_STREAM_ALL, 0],
            Request::Resend(seq) => {
                // The wire field is one byte wide.
                if !(0..=u8::MAX as i32).contains(&seq) {
                    warn!(seq, wire = seq as u8, "resend sequence truncated to 8 bits");
                }
                [CALL_RESEND, seq as u8]
            }
        }
    }
}
