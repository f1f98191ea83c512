//! Demodulation Kernel
//!
//! Applies the uplink zero-forcing detector to one subcarrier block of
//! one data symbol and soft-demaps each user's equalized point into
//! per-bit LLRs.

use super::KernelCtx;
use common::tag::Tag;
use num_complex::Complex32;

/// Run the Demul task for one (frame, symbol, subcarrier block).
pub fn do_demul(ctx: &KernelCtx, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let block = tag.block_id();
    let slot = ctx.pool.slot(frame_id);
    let ul_idx = cfg.frame.kind_index(symbol_id);
    let ants = cfg.antennas;
    let ues = cfg.ues;
    let mod_bits = ctx.mod_table.bits();

    let data = unsafe { ctx.pool.ul_data(slot, ul_idx) };
    let llr = unsafe { ctx.pool.llr_ptr(slot, ul_idx) };

    for sc in block * cfg.demul_block_size..(block + 1) * cfg.demul_block_size {
        let w_row = unsafe { ctx.pool.ul_zf(slot, sc) };
        for ue in 0..ues {
            // Equalize: x = W[ue] . y
            let mut x = Complex32::default();
            for a in 0..ants {
                x += w_row[ue * ants + a] * data[sc * ants + a];
            }
            // This task's disjoint LLR region of the shared symbol row
            let off = ctx.pool.ue_stream_offset(ue) + sc * mod_bits;
            let out = unsafe { std::slice::from_raw_parts_mut(llr.add(off), mod_bits) };
            ctx.mod_table.demap_soft(x, out);
        }
    }

    tag
}
