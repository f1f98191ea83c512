//! LDPC Kernels
//!
//! Systematic encoder and bit-flipping decoder over a fixed sparse
//! parity structure: check j covers three information bits at strided
//! offsets plus its own parity bit. Decoding is iterative majority
//! bit-flipping; a codeblock that still fails parity after the
//! iteration budget is NOT an error: the output is flagged as possibly
//! erroneous and flows through unchanged.

use super::KernelCtx;
use common::config::LdpcConfig;
use common::tag::Tag;
use std::sync::Arc;

/// Code parameters plus the precomputed per-bit check degrees.
#[derive(Clone)]
pub struct LdpcCode {
    /// Information bits per codeblock
    k: usize,
    /// Coded bits per codeblock
    n: usize,
    max_iter: usize,
    early_term: bool,
    s2: usize,
    s3: usize,
    degree: Arc<Vec<u16>>,
}

/// Per-worker decode scratch.
pub struct LdpcScratch {
    bits: Vec<u8>,
    votes: Vec<u16>,
}

impl LdpcScratch {
    pub fn new(code: &LdpcCode) -> Self {
        Self {
            bits: vec![0; code.n],
            votes: vec![0; code.n],
        }
    }
}

impl LdpcCode {
    pub fn new(cfg: &LdpcConfig) -> Self {
        let k = cfg.info_bits();
        let n = cfg.coded_bits();
        let s2 = (k / 3).max(1);
        let s3 = (2 * k / 3).max(2);
        let m = n - k;

        let mut degree = vec![0u16; n];
        for j in 0..m {
            degree[j % k] += 1;
            degree[(j + s2) % k] += 1;
            degree[(j + s3) % k] += 1;
            degree[k + j] = 1;
        }

        Self {
            k,
            n,
            max_iter: cfg.max_iterations,
            early_term: cfg.early_termination,
            s2,
            s3,
            degree: Arc::new(degree),
        }
    }

    /// Information bits per codeblock.
    pub fn info_bits(&self) -> usize {
        self.k
    }

    /// Coded bits per codeblock.
    pub fn coded_bits(&self) -> usize {
        self.n
    }

    /// The three information-bit positions covered by check `j`.
    fn check_bits(&self, j: usize) -> [usize; 3] {
        [j % self.k, (j + self.s2) % self.k, (j + self.s3) % self.k]
    }

    /// Encode one codeblock: systematic bits followed by parity bits.
    /// `info` holds k/8 bytes MSB first; `out` receives n bit values.
    pub fn encode(&self, info: &[u8], out: &mut [u8]) {
        debug_assert_eq!(info.len() * 8, self.k);
        debug_assert_eq!(out.len(), self.n);
        for i in 0..self.k {
            out[i] = (info[i / 8] >> (7 - i % 8)) & 1;
        }
        for j in 0..self.n - self.k {
            let [a, b, c] = self.check_bits(j);
            out[self.k + j] = out[a] ^ out[b] ^ out[c];
        }
    }

    /// Decode one codeblock from per-bit LLRs (positive favors 0).
    /// Packs the information bits into `out` (k/8 bytes) and returns
    /// true when parity still fails, the "may contain errors" flag.
    pub fn decode(&self, llr: &[i8], out: &mut [u8], scratch: &mut LdpcScratch) -> bool {
        debug_assert_eq!(llr.len(), self.n);
        debug_assert_eq!(out.len(), self.k / 8);
        let m = self.n - self.k;

        for (bit, &l) in scratch.bits.iter_mut().zip(llr.iter()) {
            *bit = (l < 0) as u8;
        }

        let mut dirty = true;
        for iter in 0..=self.max_iter {
            scratch.votes.fill(0);
            let mut failing = 0usize;
            for j in 0..m {
                let [a, b, c] = self.check_bits(j);
                let parity = self.k + j;
                if scratch.bits[a] ^ scratch.bits[b] ^ scratch.bits[c] ^ scratch.bits[parity] == 1
                {
                    failing += 1;
                    scratch.votes[a] += 1;
                    scratch.votes[b] += 1;
                    scratch.votes[c] += 1;
                    scratch.votes[parity] += 1;
                }
            }
            dirty = failing > 0;
            if !dirty && self.early_term {
                break;
            }
            if iter == self.max_iter {
                break;
            }
            if dirty {
                // Majority flip: a bit failing more than half its checks
                let mut flipped = 0usize;
                for b in 0..self.n {
                    if 2 * scratch.votes[b] > self.degree[b] {
                        scratch.bits[b] ^= 1;
                        flipped += 1;
                    }
                }
                if flipped == 0 {
                    break; // stuck, report dirty
                }
            }
        }

        out.fill(0);
        for i in 0..self.k {
            out[i / 8] |= scratch.bits[i] << (7 - i % 8);
        }
        dirty
    }
}

/// Run the Decode task for one (frame, symbol, codeblock).
pub fn do_decode(ctx: &KernelCtx, scratch: &mut LdpcScratch, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let cb = tag.codeblock_id();
    let slot = ctx.pool.slot(frame_id);
    let ul_idx = cfg.frame.kind_index(symbol_id);
    let ue = cb / cfg.codeblocks_per_ue;
    let block = cb % cfg.codeblocks_per_ue;
    let n = ctx.ldpc.coded_bits();

    let llr = unsafe { ctx.pool.llr(slot, ul_idx) };
    let start = ctx.pool.ue_stream_offset(ue) + block * n;
    // This codeblock's disjoint region of the shared decoded row
    let off = ctx.pool.decoded_offset(ue, block);
    let out = unsafe {
        std::slice::from_raw_parts_mut(
            ctx.pool.decoded_ptr(slot, ul_idx).add(off),
            cfg.ldpc.info_bytes(),
        )
    };
    let dirty = ctx.ldpc.decode(&llr[start..start + n], out, scratch);
    unsafe {
        *ctx.pool
            .decode_flags_ptr(slot, ul_idx)
            .add(ue * cfg.codeblocks_per_ue + block) = dirty as u8;
    }

    tag
}

/// Run the Encode task for one (frame, symbol, codeblock). Reads the
/// static downlink information bits and writes coded bits for the
/// precoder.
pub fn do_encode(ctx: &KernelCtx, tag: Tag) -> Tag {
    let cfg = &ctx.cfg;
    let frame_id = tag.frame_id();
    let symbol_id = tag.symbol_id();
    let cb = tag.codeblock_id();
    let slot = ctx.pool.slot(frame_id);
    let dl_idx = cfg.frame.kind_index(symbol_id);
    let ue = cb / cfg.codeblocks_per_ue;
    let block = cb % cfg.codeblocks_per_ue;
    let n = ctx.ldpc.coded_bits();

    let info = ctx.dl_bits.info(dl_idx, ue, block);
    // This codeblock's disjoint region of the shared encoded row
    let start = ctx.pool.ue_stream_offset(ue) + block * n;
    let out = unsafe {
        std::slice::from_raw_parts_mut(ctx.pool.encoded_ptr(slot, dl_idx).add(start), n)
    };
    ctx.ldpc.encode(info, out);

    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> LdpcCode {
        LdpcCode::new(&LdpcConfig {
            base_graph: 2,
            lifting_size: 4,
            max_iterations: 10,
            early_termination: true,
        })
    }

    #[test]
    fn test_encode_is_systematic() {
        let code = code();
        let info = [0x5A, 0x5A, 0x5A, 0x5A, 0x5A];
        let mut coded = vec![0u8; code.coded_bits()];
        code.encode(&info, &mut coded);
        for i in 0..code.info_bits() {
            let want = (info[i / 8] >> (7 - i % 8)) & 1;
            assert_eq!(coded[i], want);
        }
    }

    #[test]
    fn test_decode_clean_block() {
        let code = code();
        let info = [0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        let mut coded = vec![0u8; code.coded_bits()];
        code.encode(&info, &mut coded);

        let llr: Vec<i8> = coded.iter().map(|&b| if b == 1 { -90 } else { 90 }).collect();
        let mut out = [0u8; 5];
        let mut scratch = LdpcScratch::new(&code);
        let dirty = code.decode(&llr, &mut out, &mut scratch);
        assert!(!dirty);
        assert_eq!(out, info);
    }

    #[test]
    fn test_decode_corrects_single_flip() {
        let code = code();
        let info = [0x13, 0x37, 0x00, 0xFF, 0xA5];
        let mut coded = vec![0u8; code.coded_bits()];
        code.encode(&info, &mut coded);

        let mut llr: Vec<i8> = coded.iter().map(|&b| if b == 1 { -90 } else { 90 }).collect();
        llr[7] = -llr[7]; // one information bit hit hard by noise

        let mut out = [0u8; 5];
        let mut scratch = LdpcScratch::new(&code);
        let dirty = code.decode(&llr, &mut out, &mut scratch);
        assert!(!dirty);
        assert_eq!(out, info);
    }

    #[test]
    fn test_hopeless_block_is_flagged_not_dropped() {
        let code = code();
        // Alternating strong LLRs that satisfy no parity structure
        let llr: Vec<i8> = (0..code.coded_bits())
            .map(|i| if i % 2 == 0 { 90 } else { -90 })
            .collect();
        let mut out = [0u8; 5];
        let mut scratch = LdpcScratch::new(&code);
        let dirty = code.decode(&llr, &mut out, &mut scratch);
        // Whatever the flip loop did, the output exists and the flag is set
        assert!(dirty);
    }
}
