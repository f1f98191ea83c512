//! Windowed Buffer Pool
//!
//! One allocation at startup holds every per-frame buffer for the W
//! in-flight frames; `slot(frame_id) = frame_id % W` and two frames
//! share a slot iff they are congruent mod W. There are no locks:
//! the master's dependency ordering guarantees at most one writer per
//! (slot, stage, index) region at any instant, so the tables hand out
//! raw slices through a small unsafe surface.

use common::config::Config;
use num_complex::Complex32;
use std::cell::UnsafeCell;

/// A flat rows x cols table with interior mutability.
///
/// Backed by `UnsafeCell` elements so that every view (shared,
/// exclusive, or raw) derives from a shared borrow and regions owned
/// by different tasks never alias through an intermediate reference.
///
/// # Safety
/// Callers must uphold the scheduler's single-writer discipline: a row
/// (or disjoint parts of it) is written by exactly one task at a time,
/// and readers of a region only run after the writing task's completion
/// event has been observed by the master.
pub struct Table<T> {
    rows: usize,
    cols: usize,
    data: Box<[UnsafeCell<T>]>,
}

unsafe impl<T: Send> Sync for Table<T> {}

impl<T: Default> Table<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: (0..rows * cols).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Shared view of one row.
    ///
    /// # Safety
    /// No task may be writing this row concurrently (see type docs).
    pub unsafe fn row(&self, r: usize) -> &[T] {
        std::slice::from_raw_parts(self.row_ptr(r), self.cols)
    }

    /// Exclusive view of one row.
    ///
    /// # Safety
    /// The caller must be the row's unique writer for the duration of
    /// the borrow (see type docs).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, r: usize) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.row_ptr(r), self.cols)
    }

    /// Raw pointer to the start of one row, for buffers written by
    /// several tasks at once (one antenna, block or codeblock each).
    ///
    /// # Safety
    /// Accesses derived from this pointer must stay inside the caller's
    /// own disjoint region of the row.
    pub unsafe fn row_ptr(&self, r: usize) -> *mut T {
        debug_assert!(r < self.rows);
        self.data[r * self.cols].get()
    }
}

/// Static downlink information bits, one codeblock per (symbol, user,
/// block), generated once from the configured MAC payload pattern.
pub struct DlBits {
    info_bytes: usize,
    blocks_per_ue: usize,
    ues: usize,
    data: Vec<u8>,
}

impl DlBits {
    pub fn new(cfg: &Config) -> Self {
        let info_bytes = cfg.ldpc.info_bytes();
        let blocks_per_ue = cfg.codeblocks_per_ue;
        let ues = cfg.ues;
        let total = cfg.frame.num_dl_symbols() * ues * blocks_per_ue * info_bytes;
        let data = cfg
            .dl_payload
            .iter()
            .copied()
            .cycle()
            .take(total)
            .collect();
        Self {
            info_bytes,
            blocks_per_ue,
            ues,
            data,
        }
    }

    /// Information bytes for one downlink codeblock.
    pub fn info(&self, dl_idx: usize, ue: usize, block: usize) -> &[u8] {
        let cb = (dl_idx * self.ues + ue) * self.blocks_per_ue + block;
        &self.data[cb * self.info_bytes..(cb + 1) * self.info_bytes]
    }
}

/// All windowed per-frame buffers, from FFT output to TX IQ.
///
/// Raw received packets live in the transport rings, not here; this
/// pool starts where the frequency domain starts.
pub struct BufferPool {
    window: usize,
    antennas: usize,
    ues: usize,
    ofdm_data: usize,
    mod_bits: usize,
    ul_symbols: usize,
    dl_symbols: usize,
    samples: usize,
    info_bytes: usize,
    blocks_per_ue: usize,

    /// CSI per (slot, ue): H[sc][ant], row = slot * ues + ue
    csi: Table<Complex32>,
    /// Uplink freq data per (slot, ul symbol): Y[sc][ant]
    ul_data: Table<Complex32>,
    /// Uplink detector per (slot, sc): W[ue][ant]
    ul_zf: Table<Complex32>,
    /// Downlink precoder per (slot, sc): V[ant][ue]
    dl_zf: Table<Complex32>,
    /// Soft bits per (slot, ul symbol): llr[ue][sc * mod_bits + b]
    llr: Table<i8>,
    /// Decoded bytes per (slot, ul symbol): [ue][block][info byte]
    decoded: Table<u8>,
    /// Per-codeblock "may contain errors" flag, same row layout
    decode_flags: Table<u8>,
    /// Encoded bits per (slot, dl symbol): bit[ue][sc * mod_bits + b]
    encoded: Table<u8>,
    /// Precoded freq data per (slot, dl symbol): X[sc][ant]
    dl_freq: Table<Complex32>,
    /// Time-domain TX IQ per (slot, dl symbol): x[ant][sample]
    tx_iq: Table<Complex32>,
}

impl BufferPool {
    pub fn new(cfg: &Config) -> Self {
        let w = cfg.frame_window;
        let ul = cfg.frame.num_ul_symbols();
        let dl = cfg.frame.num_dl_symbols();
        let bits_per_ue = cfg.ofdm_data_num * cfg.modulation.bits();
        Self {
            window: w,
            antennas: cfg.antennas,
            ues: cfg.ues,
            ofdm_data: cfg.ofdm_data_num,
            mod_bits: cfg.modulation.bits(),
            ul_symbols: ul,
            dl_symbols: dl,
            samples: cfg.samples_per_symbol,
            info_bytes: cfg.ldpc.info_bytes(),
            blocks_per_ue: cfg.codeblocks_per_ue,
            csi: Table::new(w * cfg.ues, cfg.ofdm_data_num * cfg.antennas),
            ul_data: Table::new(w * ul.max(1), cfg.ofdm_data_num * cfg.antennas),
            ul_zf: Table::new(w * cfg.ofdm_data_num, cfg.ues * cfg.antennas),
            dl_zf: Table::new(w * cfg.ofdm_data_num, cfg.antennas * cfg.ues),
            llr: Table::new(w * ul.max(1), cfg.ues * bits_per_ue),
            decoded: Table::new(
                w * ul.max(1),
                cfg.ues * cfg.codeblocks_per_ue * cfg.ldpc.info_bytes(),
            ),
            decode_flags: Table::new(w * ul.max(1), cfg.ues * cfg.codeblocks_per_ue),
            encoded: Table::new(w * dl.max(1), cfg.ues * bits_per_ue),
            dl_freq: Table::new(w * dl.max(1), cfg.ofdm_data_num * cfg.antennas),
            tx_iq: Table::new(w * dl.max(1), cfg.antennas * cfg.samples_per_symbol),
        }
    }

    /// The windowed slot of a frame.
    pub fn slot(&self, frame_id: u32) -> usize {
        frame_id as usize % self.window
    }

    pub fn window(&self) -> usize {
        self.window
    }

    // Row addressing. The unsafe accessors below all inherit the
    // contracts documented on `Table`: shared rows only while no task
    // is writing them, `_mut` rows only for a unique writer, `_ptr`
    // rows for concurrent writers in disjoint regions.

    pub unsafe fn csi(&self, slot: usize, ue: usize) -> &[Complex32] {
        self.csi.row(slot * self.ues + ue)
    }

    /// Written per antenna by concurrent pilot FFT tasks.
    pub unsafe fn csi_ptr(&self, slot: usize, ue: usize) -> *mut Complex32 {
        self.csi.row_ptr(slot * self.ues + ue)
    }

    pub unsafe fn ul_data(&self, slot: usize, ul_idx: usize) -> &[Complex32] {
        self.ul_data.row(slot * self.ul_symbols + ul_idx)
    }

    /// Written per antenna by concurrent uplink FFT tasks.
    pub unsafe fn ul_data_ptr(&self, slot: usize, ul_idx: usize) -> *mut Complex32 {
        self.ul_data.row_ptr(slot * self.ul_symbols + ul_idx)
    }

    pub unsafe fn ul_zf(&self, slot: usize, sc: usize) -> &[Complex32] {
        self.ul_zf.row(slot * self.ofdm_data + sc)
    }

    pub unsafe fn ul_zf_mut(&self, slot: usize, sc: usize) -> &mut [Complex32] {
        self.ul_zf.row_mut(slot * self.ofdm_data + sc)
    }

    pub unsafe fn dl_zf(&self, slot: usize, sc: usize) -> &[Complex32] {
        self.dl_zf.row(slot * self.ofdm_data + sc)
    }

    pub unsafe fn dl_zf_mut(&self, slot: usize, sc: usize) -> &mut [Complex32] {
        self.dl_zf.row_mut(slot * self.ofdm_data + sc)
    }

    pub unsafe fn llr(&self, slot: usize, ul_idx: usize) -> &[i8] {
        self.llr.row(slot * self.ul_symbols + ul_idx)
    }

    /// Written per subcarrier block by concurrent demul tasks.
    pub unsafe fn llr_ptr(&self, slot: usize, ul_idx: usize) -> *mut i8 {
        self.llr.row_ptr(slot * self.ul_symbols + ul_idx)
    }

    pub unsafe fn decoded(&self, slot: usize, ul_idx: usize) -> &[u8] {
        self.decoded.row(slot * self.ul_symbols + ul_idx)
    }

    /// Written per codeblock by concurrent decode tasks.
    pub unsafe fn decoded_ptr(&self, slot: usize, ul_idx: usize) -> *mut u8 {
        self.decoded.row_ptr(slot * self.ul_symbols + ul_idx)
    }

    pub unsafe fn decode_flags(&self, slot: usize, ul_idx: usize) -> &[u8] {
        self.decode_flags.row(slot * self.ul_symbols + ul_idx)
    }

    /// Written per codeblock by concurrent decode tasks.
    pub unsafe fn decode_flags_ptr(&self, slot: usize, ul_idx: usize) -> *mut u8 {
        self.decode_flags.row_ptr(slot * self.ul_symbols + ul_idx)
    }

    pub unsafe fn encoded(&self, slot: usize, dl_idx: usize) -> &[u8] {
        self.encoded.row(slot * self.dl_symbols + dl_idx)
    }

    /// Written per codeblock by concurrent encode tasks.
    pub unsafe fn encoded_ptr(&self, slot: usize, dl_idx: usize) -> *mut u8 {
        self.encoded.row_ptr(slot * self.dl_symbols + dl_idx)
    }

    pub unsafe fn dl_freq(&self, slot: usize, dl_idx: usize) -> &[Complex32] {
        self.dl_freq.row(slot * self.dl_symbols + dl_idx)
    }

    /// Written per subcarrier block by concurrent precode tasks.
    pub unsafe fn dl_freq_ptr(&self, slot: usize, dl_idx: usize) -> *mut Complex32 {
        self.dl_freq.row_ptr(slot * self.dl_symbols + dl_idx)
    }

    pub unsafe fn tx_iq(&self, slot: usize, dl_idx: usize) -> &[Complex32] {
        self.tx_iq.row(slot * self.dl_symbols + dl_idx)
    }

    /// Written per antenna by concurrent IFFT tasks.
    pub unsafe fn tx_iq_ptr(&self, slot: usize, dl_idx: usize) -> *mut Complex32 {
        self.tx_iq.row_ptr(slot * self.dl_symbols + dl_idx)
    }

    // Layout helpers shared by the kernels

    pub fn antennas(&self) -> usize {
        self.antennas
    }

    pub fn ues(&self) -> usize {
        self.ues
    }

    pub fn samples_per_symbol(&self) -> usize {
        self.samples
    }

    /// Offset of user `ue`'s bit/LLR stream inside a symbol row.
    pub fn ue_stream_offset(&self, ue: usize) -> usize {
        ue * self.ofdm_data * self.mod_bits
    }

    /// Offset of one codeblock inside a decoded-bytes row.
    pub fn decoded_offset(&self, ue: usize, block: usize) -> usize {
        (ue * self.blocks_per_ue + block) * self.info_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_json_str(
            r#"{
                "antennas": 2, "ues": 1,
                "ofdm_ca": 128, "cp_len": 16,
                "ofdm_data_start": 14, "ofdm_data_num": 100,
                "frame_template": "PUD",
                "ldpc": { "base_graph": 2, "lifting_size": 4 },
                "frame_window": 4,
                "zf_block_size": 25, "demul_block_size": 50
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_slot_congruence() {
        let pool = BufferPool::new(&test_config());
        assert_eq!(pool.slot(0), pool.slot(4));
        assert_eq!(pool.slot(7), pool.slot(11));
        assert_ne!(pool.slot(1), pool.slot(2));
    }

    #[test]
    fn test_rows_are_disjoint() {
        let pool = BufferPool::new(&test_config());
        unsafe {
            *pool.csi_ptr(0, 0) = Complex32::new(1.0, 0.0);
            *pool.csi_ptr(1, 0) = Complex32::new(2.0, 0.0);
            assert_eq!(pool.csi(0, 0)[0].re, 1.0);
            assert_eq!(pool.csi(1, 0)[0].re, 2.0);
        }
    }

    #[test]
    fn test_dl_bits_pattern() {
        let cfg = test_config();
        let bits = DlBits::new(&cfg);
        let block = bits.info(0, 0, 0);
        assert_eq!(block.len(), cfg.ldpc.info_bytes());
        assert_eq!(&block[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
