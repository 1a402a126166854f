//! Wire packet model and validation.
//!
//! A [`Packet`] can only be obtained from [`Packet::from_frame`], which decodes
//! the fixed 17-byte big-endian layout and checks, in order: symbol, side,
//! quantity, price and sequence. The first failing check is reported as a
//! [`MalformedPacket`] carrying the field and its decoded value.
//!
//! Layout: `[symbol:4 ascii][side:1 ascii][quantity:i32][price:i32][sequence:i32]`.
use serde::Serialize;

use crate::error::{MalformedPacket, PacketField};

/// Size in bytes of one wire packet.
pub const PACKET_SIZE: usize = 17;

/// One raw frame as cut by the frame decoder.
pub type Frame = [u8; PACKET_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Symbol {
    #[serde(rename = "AAPL")]
    Aapl,
    #[serde(rename = "MSFT")]
    Msft,
    #[serde(rename = "AMZN")]
    Amzn,
    #[serde(rename = "META")]
    Meta,
}

impl Symbol {
    pub const ALL: [Symbol; 4] = [Symbol::Aapl, Symbol::Msft, Symbol::Amzn, Symbol::Meta];

    pub fn code(&self) -> &'static [u8; 4] {
        match self {
            Symbol::Aapl => b"AAPL",
            Symbol::Msft => b"MSFT",
            Symbol::Amzn => b"AMZN",
            Symbol::Meta => b"META",
        }
    }

    fn from_code(code: &[u8]) -> Option<Symbol> {
        Symbol::ALL.into_iter().find(|s| s.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Side {
    #[serde(rename = "B")]
    Buy,
    #[serde(rename = "S")]
    Sell,
}

impl Side {
    pub fn indicator(&self) -> u8 {
        match self {
            Side::Buy => b'B',
            Side::Sell => b'S',
        }
    }

    fn from_indicator(b: u8) -> Option<Side> {
        match b {
            b'B' => Some(Side::Buy),
            b'S' => Some(Side::Sell),
            _ => None,
        }
    }
}

/// A validated market-data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Packet {
    symbol: Symbol,
    side: Side,
    quantity: i32,
    /// Fixed-point price units as sent by the server.
    price: i32,
    sequence: i32,
}

impl Packet {
    /// Decode and validate one frame.
    pub fn from_frame(frame: &Frame) -> Result<Packet, MalformedPacket> {
        let read_i32 = |off: usize| -> i32 {
            let mut tmp = [0u8; 4];
            tmp.copy_from_slice(&frame[off..off + 4]);
            i32::from_be_bytes(tmp)
        };
        let raw_symbol = &frame[0..4];
        let raw_side = frame[4];
        let quantity = read_i32(5);
        let price = read_i32(9);
        let sequence = read_i32(13);

        let symbol = Symbol::from_code(raw_symbol).ok_or_else(|| MalformedPacket {
            field: PacketField::Symbol,
            value: String::from_utf8_lossy(raw_symbol).into_owned(),
        })?;
        let side = Side::from_indicator(raw_side).ok_or_else(|| MalformedPacket {
            field: PacketField::Side,
            value: char::from(raw_side).to_string(),
        })?;
        positive(PacketField::Quantity, quantity)?;
        positive(PacketField::Price, price)?;
        positive(PacketField::Sequence, sequence)?;

        Ok(Packet { symbol, side, quantity, price, sequence })
    }

    /// Encode back into the 17-byte wire form.
    pub fn to_frame(&self) -> Frame {
        let mut out = [0u8; PACKET_SIZE];
        out[0..4].copy_from_slice(self.symbol.code());
        out[4] = self.side.indicator();
        out[5..9].copy_from_slice(&self.quantity.to_be_bytes());
        out[9..13].copy_from_slice(&self.price.to_be_bytes());
        out[13..17].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn quantity(&self) -> i32 {
        self.quantity
    }

    pub fn price(&self) -> i32 {
        self.price
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }
}

fn positive(field: PacketField, value: i32) -> Result<(), MalformedPacket> {
    if value > 0 {
        Ok(())
    } else {
        Err(MalformedPacket { field, value: value.to_string() })
    }
}

/// Build a raw frame from loose parts; used by tests and mock servers to craft
/// both valid and invalid payloads.
pub fn encode_frame(symbol: &[u8; 4], side: u8, quantity: i32, price: i32, sequence: i32) -> Frame {
    let mut out = [0u8; PACKET_SIZE];
    out[0..4].copy_from_slice(symbol);
    out[4] = side;
    out[5..9].copy_from_slice(&quantity.to_be_bytes());
    out[9..13].copy_from_slice(&price.to_be_bytes());
    out[13..17].copy_from_slice(&sequence.to_be_bytes());
    out
}
