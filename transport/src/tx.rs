//! Transmit Thread
//!
//! Drains the `PacketTx` queue, pulls the IFFT'd time-domain IQ for each
//! (frame, symbol, antenna) through the `TxIqSource` seam, and sends one
//! UDP datagram per task to the downlink sink. On shutdown the queue is
//! flushed before the thread exits so nothing already precoded is lost.

use crate::packet::{serialize, PacketHeader};
use crate::{TransportError, TxIqSource};
use common::config::Config;
use common::event::{EventKind, EventQueue};
use common::types::ThreadType;
use common::utils::pin_to_core_with_offset;
use crossbeam::utils::Backoff;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the transmit thread needs; constructed by the runtime.
pub struct TxContext {
    pub cfg: Arc<Config>,
    pub queue: Arc<EventQueue>,
    pub source: Arc<dyn TxIqSource>,
    pub running: Arc<AtomicBool>,
    pub sent: Arc<AtomicU64>,
    pub core: usize,
}

/// Bind the transmit socket (ephemeral local port).
pub fn bind_tx_socket() -> Result<UdpSocket, TransportError> {
    UdpSocket::bind("0.0.0.0:0").map_err(|source| TransportError::BindFailed {
        addr: "0.0.0.0:0".into(),
        source,
    })
}

/// The transmit loop.
pub fn run_tx_thread(ctx: TxContext, socket: UdpSocket) {
    let cfg = &ctx.cfg;
    if cfg.pin_threads {
        let _ = pin_to_core_with_offset(ThreadType::Tx, ctx.core, 0, false);
    }
    let dest = format!("{}:{}", cfg.tx_addr, cfg.tx_port_base);
    info!("tx thread sending to {dest}");

    let mut iq = Vec::with_capacity(cfg.samples_per_symbol * 2);
    let backoff = Backoff::new();

    loop {
        match ctx.queue.try_dequeue() {
            Some(event) => {
                debug_assert_eq!(event.kind, EventKind::PacketTx);
                backoff.reset();

                let tag = event.tag;
                ctx.source
                    .fetch(tag.frame_id(), tag.symbol_id(), tag.antenna_id(), &mut iq);
                let header = PacketHeader {
                    frame_id: tag.frame_id(),
                    symbol_id: tag.symbol_id() as u32,
                    cell_id: cfg.cell_id.0,
                    antenna_id: tag.antenna_id() as u32,
                };
                let pkt = serialize(&header, &iq);
                match socket.send_to(&pkt, &dest) {
                    Ok(_) => {
                        ctx.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => debug!("tx send failed: {e}"),
                }
            }
            None => {
                // Flush everything already enqueued before exiting
                if !ctx.running.load(Ordering::Relaxed) {
                    break;
                }
                backoff.snooze();
            }
        }
    }
    info!(
        "tx thread exiting, {} packets sent",
        ctx.sent.load(Ordering::Relaxed)
    );
}
