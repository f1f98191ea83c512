//! Receive Threads
//!
//! One pinned thread per contiguous antenna range. The loop lands one
//! datagram per iteration: wait for the next ring landing to free up
//! (this stall is the socket-side backpressure that transitively
//! throttles the radio), receive, validate the header, publish the
//! landing and post a `PacketRx` event through this thread's producer
//! token. Receive threads never touch the counter matrix.

use crate::packet::PacketHeader;
use crate::ring::PacketRing;
use crate::TransportError;
use common::config::Config;
use common::event::{CompletionProducer, Event, EventKind};
use common::tag::Tag;
use common::types::ThreadType;
use common::utils::pin_to_core_with_offset;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Everything one receive thread needs; constructed by the runtime.
pub struct RxContext {
    pub tid: usize,
    pub cfg: Arc<Config>,
    pub socket: UdpSocket,
    pub ring: Arc<PacketRing>,
    pub producer: CompletionProducer,
    pub running: Arc<AtomicBool>,
    pub malformed: Arc<AtomicU64>,
    /// First core of the receive-thread range
    pub core_base: usize,
}

/// Bind the socket for receive thread `tid`. Port 0 requests an
/// ephemeral port; the caller reads the bound address back for tests.
pub fn bind_rx_socket(cfg: &Config, tid: usize) -> Result<UdpSocket, TransportError> {
    let port = if cfg.rx_port_base == 0 {
        0
    } else {
        cfg.rx_port_base + tid as u16
    };
    let addr = format!("{}:{}", cfg.rx_addr, port);
    let socket = UdpSocket::bind(&addr).map_err(|source| TransportError::BindFailed {
        addr: addr.clone(),
        source,
    })?;
    socket
        .set_read_timeout(Some(Duration::from_millis(10)))
        .map_err(|source| TransportError::BindFailed { addr, source })?;
    Ok(socket)
}

/// The receive loop. Runs until the process-wide `running` flag clears.
pub fn run_rx_thread(ctx: RxContext) {
    let cfg = &ctx.cfg;
    if cfg.pin_threads {
        // Strict pin failures were already surfaced by startup probing
        let _ = pin_to_core_with_offset(ThreadType::Rx, ctx.core_base, ctx.tid, false);
    }
    info!(
        "rx thread {} listening on {:?}",
        ctx.tid,
        ctx.socket.local_addr().ok()
    );

    let packet_bytes = cfg.packet_bytes();
    let mut landing = 0usize;

    while ctx.running.load(Ordering::Relaxed) {
        // Backpressure: do not overwrite a landing still in flight
        if !ctx.ring.is_landing_empty(landing) {
            std::thread::yield_now();
            continue;
        }

        let buf = unsafe { ctx.ring.landing_mut(landing) };
        let n = match ctx.socket.recv_from(buf) {
            Ok((n, _)) => n,
            // Timeout: re-check the running flag
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                debug!("rx thread {} recv error: {e}", ctx.tid);
                continue;
            }
        };

        match validate(cfg, buf, n, packet_bytes) {
            Ok(header) => {
                trace!(
                    "rx {} landed frame {} symbol {} ant {} at {}",
                    ctx.tid,
                    header.frame_id,
                    header.symbol_id,
                    header.antenna_id,
                    landing
                );
                ctx.ring.publish(landing);
                let tag = Tag::rx(ctx.tid, landing).expect("ring depth fits the rx tag");
                if !ctx
                    .producer
                    .send(Event::new(EventKind::PacketRx, tag), &ctx.running)
                {
                    break; // shutting down
                }
                landing = (landing + 1) % ctx.ring.depth();
            }
            Err(reason) => {
                // Malformed input: count, drop, reuse the landing
                ctx.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("rx thread {} dropped malformed packet ({reason})", ctx.tid);
            }
        }
    }
    info!("rx thread {} exiting", ctx.tid);
}

/// Header and size validation. Returns the parsed header or the reason
/// the datagram was dropped.
fn validate(
    cfg: &Config,
    buf: &[u8],
    n: usize,
    packet_bytes: usize,
) -> Result<PacketHeader, &'static str> {
    if n != packet_bytes {
        return Err("bad size");
    }
    let header = PacketHeader::parse(buf).ok_or("short header")?;
    if header.cell_id != cfg.cell_id.0 {
        return Err("wrong cell");
    }
    let kind = cfg
        .frame
        .kind_checked(header.symbol_id as usize)
        .ok_or("symbol out of range")?;
    if !kind.is_received() {
        return Err("not a receive symbol");
    }
    if header.antenna_id as usize >= cfg.antennas {
        return Err("antenna out of range");
    }
    Ok(header)
}
