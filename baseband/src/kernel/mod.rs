//! Numeric Kernels
//!
//! The compute side of the pipeline: OFDM (de)modulation, channel
//! estimation, zero-forcing, soft demodulation and the LDPC pair. Each
//! kernel is a plain function taking the shared kernel context and the
//! unpacked tag; all are deterministic in their inputs, which is what
//! makes replayed runs bit-identical.

pub mod demul;
pub mod fft;
pub mod ldpc;
pub mod modulation;
pub mod pilot;
pub mod precode;
pub mod zf;

use crate::buffer::{BufferPool, DlBits};
use common::config::Config;
use num_complex::Complex32;
use self::ldpc::LdpcCode;
use self::modulation::ModTable;
use std::sync::Arc;
use transport::ring::PacketRing;

/// Read-only world every kernel runs against. Cloned into each worker.
#[derive(Clone)]
pub struct KernelCtx {
    pub cfg: Arc<Config>,
    pub pool: Arc<BufferPool>,
    pub rings: Vec<Arc<PacketRing>>,
    pub pilots: Arc<Vec<Complex32>>,
    pub dl_bits: Arc<DlBits>,
    pub mod_table: Arc<ModTable>,
    pub ldpc: LdpcCode,
}

impl KernelCtx {
    pub fn new(
        cfg: Arc<Config>,
        pool: Arc<BufferPool>,
        rings: Vec<Arc<PacketRing>>,
        dl_bits: Arc<DlBits>,
    ) -> Self {
        let pilots = Arc::new(pilot::pilot_sequence(cfg.ofdm_data_num));
        let mod_table = Arc::new(ModTable::new(cfg.modulation));
        let ldpc = LdpcCode::new(&cfg.ldpc);
        Self {
            cfg,
            pool,
            rings,
            pilots,
            dl_bits,
            mod_table,
            ldpc,
        }
    }
}
