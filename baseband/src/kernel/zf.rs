//! Zero-Forcing Kernel
//!
//! For every subcarrier of its block, builds the channel matrix from
//! the estimated CSI and computes the uplink detector
//! W = (H^H H)^-1 H^H and the reciprocity downlink precoder V = W^T.
//! The Gram inverse is a partial-pivot Gauss-Jordan over the small
//! ue x ue matrix.

use super::KernelCtx;
use common::tag::Tag;
use num_complex::Complex32;
use tracing::debug;

/// Per-worker scratch so the per-subcarrier loop never allocates.
pub struct ZfScratch {
    h: Vec<Complex32>,
    gram: Vec<Complex32>,
    inv: Vec<Complex32>,
}

impl ZfScratch {
    pub fn new(antennas: usize, ues: usize) -> Self {
        Self {
            h: vec![Complex32::default(); antennas * ues],
            gram: vec![Complex32::default(); ues * ues],
            inv: vec![Complex32::default(); ues * ues],
        }
    }
}

/// Invert the n x n matrix `a` into `out` by Gauss-Jordan elimination
/// with partial pivoting. Returns false when the matrix is singular.
pub fn invert(a: &mut [Complex32], out: &mut [Complex32], n: usize) -> bool {
    // Start from the identity
    out.fill(Complex32::default());
    for i in 0..n {
        out[i * n + i] = Complex32::new(1.0, 0.0);
    }

    for col in 0..n {
        // Pivot on the largest remaining magnitude
        let mut pivot = col;
        for row in col + 1..n {
            if a[row * n + col].norm_sqr() > a[pivot * n + col].norm_sqr() {
                pivot = row;
            }
        }
        if a[pivot * n + col].norm_sqr() < 1e-12 {
            return false;
        }
        if pivot != col {
            for k in 0..n {
                a.swap(col * n + k, pivot * n + k);
                out.swap(col * n + k, pivot * n + k);
            }
        }

        let inv_p = Complex32::new(1.0, 0.0) / a[col * n + col];
        for k in 0..n {
            a[col * n + k] *= inv_p;
            out[col * n + k] *= inv_p;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row * n + col];
            if factor.norm_sqr() == 0.0 {
                continue;
            }
            for k in 0..n {
                let a_ck = a[col * n + k];
                let o_ck = out[col * n + k];
                a[row * n + k] -= factor * a_ck;
                out[row * n + k] -= factor * o_ck;
            }
        }
    }
    true
}

/// Run the ZF task for one (frame, subcarrier block).
pub fn do_zf(ctx: &KernelCtx, scratch: &mut ZfScratch, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let frame_id = tag.frame_id();
    let block = tag.block_id();
    let slot = ctx.pool.slot(frame_id);
    let ants = cfg.antennas;
    let ues = cfg.ues;

    for sc in block * cfg.zf_block_size..(block + 1) * cfg.zf_block_size {
        // H[ant][ue] gathered across the per-user CSI rows
        for ue in 0..ues {
            let csi = unsafe { ctx.pool.csi(slot, ue) };
            for a in 0..ants {
                scratch.h[a * ues + ue] = csi[sc * ants + a];
            }
        }

        // Gram matrix G = H^H H
        for u1 in 0..ues {
            for u2 in 0..ues {
                let mut acc = Complex32::default();
                for a in 0..ants {
                    acc += scratch.h[a * ues + u1].conj() * scratch.h[a * ues + u2];
                }
                scratch.gram[u1 * ues + u2] = acc;
            }
        }

        if !invert(&mut scratch.gram, &mut scratch.inv, ues) {
            // Rank-deficient channel estimate; leave the detector zeroed
            debug!("singular gram matrix, frame {frame_id} sc {sc}");
            unsafe { ctx.pool.ul_zf_mut(slot, sc) }.fill(Complex32::default());
            unsafe { ctx.pool.dl_zf_mut(slot, sc) }.fill(Complex32::default());
            continue;
        }

        // W = G^-1 H^H, V = W^T
        let ul = unsafe { ctx.pool.ul_zf_mut(slot, sc) };
        let dl = unsafe { ctx.pool.dl_zf_mut(slot, sc) };
        for ue in 0..ues {
            for a in 0..ants {
                let mut acc = Complex32::default();
                for u2 in 0..ues {
                    acc += scratch.inv[ue * ues + u2] * scratch.h[a * ues + u2].conj();
                }
                ul[ue * ants + a] = acc;
                dl[a * ues + ue] = acc;
            }
        }
    }

    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: f32, im: f32) -> Complex32 {
        Complex32::new(re, im)
    }

    #[test]
    fn test_invert_identity() {
        let mut a = vec![c(1.0, 0.0), c(0.0, 0.0), c(0.0, 0.0), c(1.0, 0.0)];
        let mut out = vec![Complex32::default(); 4];
        assert!(invert(&mut a, &mut out, 2));
        assert!((out[0] - c(1.0, 0.0)).norm() < 1e-6);
        assert!((out[1]).norm() < 1e-6);
    }

    #[test]
    fn test_invert_times_original_is_identity() {
        let orig = vec![c(2.0, 1.0), c(0.5, -0.5), c(-1.0, 0.0), c(1.0, 2.0)];
        let mut a = orig.clone();
        let mut inv = vec![Complex32::default(); 4];
        assert!(invert(&mut a, &mut inv, 2));

        for i in 0..2 {
            for j in 0..2 {
                let mut acc = Complex32::default();
                for k in 0..2 {
                    acc += inv[i * 2 + k] * orig[k * 2 + j];
                }
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((acc - c(want, 0.0)).norm() < 1e-5, "({i},{j}) = {acc}");
            }
        }
    }

    #[test]
    fn test_invert_singular() {
        let mut a = vec![c(1.0, 0.0), c(2.0, 0.0), c(2.0, 0.0), c(4.0, 0.0)];
        let mut out = vec![Complex32::default(); 4];
        assert!(!invert(&mut a, &mut out, 2));
    }
}
