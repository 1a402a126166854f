//! Error taxonomy for the feed client.
//!
//! Per-frame problems ([`MalformedPacket`]) never escape the session; they are
//! logged and counted. Everything else ends the session through
//! [`SessionError`].
use std::fmt;
use std::io;

use thiserror::Error;

/// Field of a wire packet that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketField {
    Symbol,
    Side,
    Quantity,
    Price,
    Sequence,
}

impl fmt::Display for PacketField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketField::Symbol => "symbol",
            PacketField::Side => "side",
            PacketField::Quantity => "quantity",
            PacketField::Price => "price",
            PacketField::Sequence => "sequence",
        };
        f.write_str(name)
    }
}

/// A 17-byte frame whose fields decode but break an invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed packet: invalid {field} {value:?}")]
pub struct MalformedPacket {
    pub field: PacketField,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("write to {endpoint} failed")]
    Write {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("read from {endpoint} failed")]
    Read {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("duplicate sequence number {sequence}")]
    DuplicateSequence { sequence: i32 },

    #[error("missing sequences: expected {expected} packets, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export i/o error")]
    Io(#[from] io::Error),

    #[error("export encoding error")]
    Json(#[from] serde_json::Error),
}

/// Terminal failure of a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("sequences still missing after {passes} resend passes: {missing:?}")]
    StillMissing { missing: Vec<i32>, passes: u32 },

    #[error("{gaps} sequences missing, more than the {limit} a resend pass may request")]
    TooManyGaps { gaps: usize, limit: usize },

    #[error("integrity check failed")]
    Integrity(#[from] IntegrityViolation),

    #[error("export failed")]
    Export(#[from] ExportError),
}

impl SessionError {
    /// Stable, machine-readable reason for the failure.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Transport(_) => "transport",
            SessionError::StillMissing { .. } => "still_missing",
            SessionError::TooManyGaps { .. } => "too_many_gaps",
            SessionError::Integrity(_) => "integrity",
            SessionError::Export(_) => "export",
        }
    }
}
