//! OFDM Transform Kernels
//!
//! The FFT kernel turns one landed packet into frequency-domain data
//! (CSI for pilot symbols, equalizer input for uplink data) and frees
//! the ring landing. The IFFT kernel is its downlink dual, producing
//! time-domain TX IQ with the cyclic prefix prepended. One `FftEngine`
//! per worker keeps the plans and scratch out of the hot path.

use super::KernelCtx;
use common::tag::Tag;
use common::types::SymbolKind;
use common::utils::IQ_SCALE;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use transport::packet::{payload, PacketHeader};

/// Per-worker FFT plans and scratch buffer.
pub struct FftEngine {
    size: usize,
    fwd: Arc<dyn Fft<f32>>,
    inv: Arc<dyn Fft<f32>>,
    pub buf: Vec<Complex32>,
}

impl FftEngine {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            fwd: planner.plan_fft_forward(size),
            inv: planner.plan_fft_inverse(size),
            buf: vec![Complex32::default(); size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// In-place forward transform of the scratch buffer.
    pub fn forward(&mut self) {
        self.fwd.process(&mut self.buf);
    }

    /// In-place inverse transform with 1/N scaling, so that
    /// forward(inverse(x)) == x.
    pub fn inverse_scaled(&mut self) {
        self.inv.process(&mut self.buf);
        let scale = 1.0 / self.size as f32;
        for v in &mut self.buf {
            *v *= scale;
        }
    }
}

/// OFDM-modulate one symbol: place `data` on the data subcarriers,
/// inverse transform, prepend the cyclic prefix. Used by the IFFT
/// kernel and by signal generators feeding the uplink.
pub fn ofdm_modulate(
    engine: &mut FftEngine,
    data: &[Complex32],
    data_start: usize,
    cp_len: usize,
) -> Vec<Complex32> {
    engine.buf.fill(Complex32::default());
    engine.buf[data_start..data_start + data.len()].copy_from_slice(data);
    engine.inverse_scaled();

    let n = engine.size;
    let mut time = Vec::with_capacity(cp_len + n);
    time.extend_from_slice(&engine.buf[n - cp_len..]);
    time.extend_from_slice(&engine.buf);
    time
}

/// Run the FFT task named by an rx tag. Reads the packet from its ring
/// landing, writes CSI or frequency-domain data, releases the landing,
/// and returns the (frame, symbol, antenna) tag for the completion.
pub fn do_fft(ctx: &KernelCtx, engine: &mut FftEngine, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let ring = &ctx.rings[tag.rx_tid()];
    let landing = tag.rx_offset();
    let buf = ring.landing(landing);
    let header = PacketHeader::parse(buf).expect("published landings hold a validated header");
    let frame_id = header.frame_id;
    let symbol_id = header.symbol_id as usize;
    let antenna_id = header.antenna_id as usize;

    // Time samples with the cyclic prefix stripped
    engine.buf.clear();
    engine.buf.extend(
        payload(buf)
            .chunks_exact(4)
            .skip(cfg.cp_len)
            .take(cfg.ofdm_ca)
            .map(|p| {
                Complex32::new(
                    i16::from_le_bytes([p[0], p[1]]) as f32 / IQ_SCALE,
                    i16::from_le_bytes([p[2], p[3]]) as f32 / IQ_SCALE,
                )
            }),
    );
    engine.forward();

    let slot = ctx.pool.slot(frame_id);
    let ants = cfg.antennas;
    let start = cfg.ofdm_data_start;
    match cfg.frame.kind(symbol_id) {
        SymbolKind::Pilot => {
            // One pilot symbol per user: divide by the known pilot.
            // Concurrent antenna tasks interleave into the same row
            let ue = cfg.frame.kind_index(symbol_id);
            let csi = unsafe { ctx.pool.csi_ptr(slot, ue) };
            for sc in 0..cfg.ofdm_data_num {
                unsafe {
                    *csi.add(sc * ants + antenna_id) = engine.buf[start + sc] / ctx.pilots[sc];
                }
            }
        }
        SymbolKind::UplinkData => {
            let ul_idx = cfg.frame.kind_index(symbol_id);
            let row = unsafe { ctx.pool.ul_data_ptr(slot, ul_idx) };
            for sc in 0..cfg.ofdm_data_num {
                unsafe {
                    *row.add(sc * ants + antenna_id) = engine.buf[start + sc];
                }
            }
        }
        // Calibration symbols are transformed but feed nothing downstream
        _ => {}
    }

    ring.release(landing);
    Tag::frame_symbol_antenna(frame_id, symbol_id, antenna_id)
        .expect("header fields validated against startup limits")
}

/// Run the IFFT task for one (frame, symbol, antenna): inverse-transform
/// the precoded subcarriers and write CP + body into the TX IQ buffer.
pub fn do_ifft(ctx: &KernelCtx, engine: &mut FftEngine, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let antenna_id = tag.antenna_id();
    let dl_idx = cfg.frame.kind_index(symbol_id);
    let slot = ctx.pool.slot(frame_id);
    let ants = cfg.antennas;
    let start = cfg.ofdm_data_start;

    engine.buf.fill(Complex32::default());
    {
        let freq = unsafe { ctx.pool.dl_freq(slot, dl_idx) };
        for sc in 0..cfg.ofdm_data_num {
            engine.buf[start + sc] = freq[sc * ants + antenna_id];
        }
    }
    engine.inverse_scaled();

    // This antenna's disjoint region of the shared TX row
    let out = unsafe {
        std::slice::from_raw_parts_mut(
            ctx.pool
                .tx_iq_ptr(slot, dl_idx)
                .add(antenna_id * cfg.samples_per_symbol),
            cfg.samples_per_symbol,
        )
    };
    let n = cfg.ofdm_ca;
    out[..cfg.cp_len].copy_from_slice(&engine.buf[n - cfg.cp_len..]);
    out[cfg.cp_len..cfg.cp_len + n].copy_from_slice(&engine.buf);

    tag
}
