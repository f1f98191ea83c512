//! Precode Kernel
//!
//! Maps one subcarrier block of encoded downlink bits onto the
//! constellation and applies the zero-forcing precoder, producing the
//! per-antenna frequency-domain signal the IFFT kernel consumes.

use super::KernelCtx;
use common::tag::Tag;
use num_complex::Complex32;

/// Run the Precode task for one (frame, symbol, subcarrier block).
pub fn do_precode(ctx: &KernelCtx, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let block = tag.block_id();
    let slot = ctx.pool.slot(frame_id);
    let dl_idx = cfg.frame.kind_index(symbol_id);
    let ants = cfg.antennas;
    let ues = cfg.ues;
    let mod_bits = ctx.mod_table.bits();

    let encoded = unsafe { ctx.pool.encoded(slot, dl_idx) };
    let freq = unsafe { ctx.pool.dl_freq_ptr(slot, dl_idx) };

    for sc in block * cfg.demul_block_size..(block + 1) * cfg.demul_block_size {
        let v_row = unsafe { ctx.pool.dl_zf(slot, sc) };
        for a in 0..ants {
            let mut acc = Complex32::default();
            for ue in 0..ues {
                let off = ctx.pool.ue_stream_offset(ue) + sc * mod_bits;
                let point = ctx.mod_table.map_bits(&encoded[off..off + mod_bits]);
                acc += v_row[a * ues + ue] * point;
            }
            // Subcarriers of this block form the task's disjoint region
            unsafe {
                *freq.add(sc * ants + a) = acc;
            }
        }
    }

    tag
}
