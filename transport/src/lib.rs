//! Packet Transport
//!
//! The socket-facing substrate: wire packet layout, per-receive-thread
//! packet rings, and the pinned receive and transmit loops. Everything
//! here is deliberately narrow: IQ lands in a ring, an event names the
//! landing, and the baseband core never sees a socket.

pub mod packet;
pub mod ring;
pub mod rx;
pub mod tx;

use thiserror::Error;

/// Fatal transport setup errors. These terminate startup with exit code 2.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },
}

/// Seam between the transmit thread and whoever owns the downlink IQ.
///
/// The baseband runtime implements this over its windowed buffer pool;
/// the transmit thread only ever sees the trait.
pub trait TxIqSource: Send + Sync {
    /// Copy the time-domain IQ for (frame, symbol, antenna) into `out`
    /// as interleaved int16 pairs.
    fn fetch(&self, frame_id: u32, symbol_id: usize, antenna_id: usize, out: &mut Vec<i16>);
}
