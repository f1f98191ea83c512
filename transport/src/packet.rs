//! Wire Packet Layout
//!
//! One UDP datagram carries one (frame, symbol, antenna) worth of IQ:
//! a 16-byte little-endian header followed by int16 I/Q pairs.
//!
//! ```text
//! offset  size  field
//! 0       4     frame_id
//! 4       4     symbol_id
//! 8       4     cell_id
//! 12      4     antenna_id
//! 16      4*N   IQ samples (int16 I, int16 Q) x samples_per_symbol
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed packet header.
pub const HEADER_BYTES: usize = 16;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub symbol_id: u32,
    pub cell_id: u32,
    pub antenna_id: u32,
}

impl PacketHeader {
    /// Parse the fixed header from the front of a datagram. Returns None
    /// when the buffer is too short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_BYTES {
            return None;
        }
        let word = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        Some(Self {
            frame_id: word(0),
            symbol_id: word(4),
            cell_id: word(8),
            antenna_id: word(12),
        })
    }

    /// Append the header to `buf` in wire order.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.frame_id);
        buf.put_u32_le(self.symbol_id);
        buf.put_u32_le(self.cell_id);
        buf.put_u32_le(self.antenna_id);
    }
}

/// Serialize a complete packet: header plus interleaved int16 IQ.
pub fn serialize(header: &PacketHeader, iq: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_BYTES + iq.len() * 2);
    header.write(&mut buf);
    for &s in iq {
        buf.put_i16_le(s);
    }
    buf.freeze()
}

/// Borrow a packet's IQ payload as raw bytes (after the header).
pub fn payload(buf: &[u8]) -> &[u8] {
    &buf[HEADER_BYTES..]
}

/// Decode a payload of little-endian int16 pairs.
pub fn payload_samples(buf: &[u8]) -> impl Iterator<Item = i16> + '_ {
    payload(buf)
        .chunks_exact(2)
        .map(|p| i16::from_le_bytes([p[0], p[1]]))
}
