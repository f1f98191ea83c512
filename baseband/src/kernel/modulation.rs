//! Modulation Tables
//!
//! Gray-coded QPSK/16QAM/64QAM constellations with exact max-likelihood
//! soft demapping. Bit order within one subcarrier is MSB first: the
//! first bit selects the I half-plane, the second the Q half-plane, and
//! so on per 3GPP-style square QAM.

use common::types::Modulation;
use num_complex::Complex32;

/// LLR full scale before clamping to i8.
const LLR_SCALE: f32 = 16.0;

/// One modulation order's constellation.
pub struct ModTable {
    bits: usize,
    points: Vec<Complex32>,
}

impl ModTable {
    pub fn new(modulation: Modulation) -> Self {
        let bits = modulation.bits();
        let points = (0..1usize << bits)
            .map(|sym| Self::point(bits, sym))
            .collect();
        Self { bits, points }
    }

    fn point(bits: usize, sym: usize) -> Complex32 {
        let b = |i: usize| ((sym >> (bits - 1 - i)) & 1) as f32;
        match bits {
            2 => {
                let norm = 1.0 / 2f32.sqrt();
                Complex32::new((1.0 - 2.0 * b(0)) * norm, (1.0 - 2.0 * b(1)) * norm)
            }
            4 => {
                let norm = 1.0 / 10f32.sqrt();
                let i = (1.0 - 2.0 * b(0)) * (2.0 - (1.0 - 2.0 * b(2)));
                let q = (1.0 - 2.0 * b(1)) * (2.0 - (1.0 - 2.0 * b(3)));
                Complex32::new(i * norm, q * norm)
            }
            6 => {
                let norm = 1.0 / 42f32.sqrt();
                let i = (1.0 - 2.0 * b(0)) * (4.0 - (1.0 - 2.0 * b(2)) * (2.0 - (1.0 - 2.0 * b(4))));
                let q = (1.0 - 2.0 * b(1)) * (4.0 - (1.0 - 2.0 * b(3)) * (2.0 - (1.0 - 2.0 * b(5))));
                Complex32::new(i * norm, q * norm)
            }
            _ => unreachable!("unsupported modulation order"),
        }
    }

    /// Bits per subcarrier.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Constellation point for a symbol index.
    pub fn map(&self, sym: usize) -> Complex32 {
        self.points[sym]
    }

    /// Map `bits` (one per entry, MSB first) to a point.
    pub fn map_bits(&self, bits: &[u8]) -> Complex32 {
        let sym = bits
            .iter()
            .fold(0usize, |acc, &b| (acc << 1) | (b & 1) as usize);
        self.points[sym]
    }

    /// Nearest constellation symbol index.
    pub fn demap_hard(&self, y: Complex32) -> usize {
        let mut best = 0;
        let mut best_d = f32::INFINITY;
        for (sym, p) in self.points.iter().enumerate() {
            let d = (y - p).norm_sqr();
            if d < best_d {
                best_d = d;
                best = sym;
            }
        }
        best
    }

    /// Exact per-bit LLRs: positive values favor bit 0. Writes
    /// `self.bits()` entries into `out`.
    pub fn demap_soft(&self, y: Complex32, out: &mut [i8]) {
        for (i, llr) in out.iter_mut().enumerate().take(self.bits) {
            let mask = 1usize << (self.bits - 1 - i);
            let mut d0 = f32::INFINITY;
            let mut d1 = f32::INFINITY;
            for (sym, p) in self.points.iter().enumerate() {
                let d = (y - p).norm_sqr();
                if sym & mask == 0 {
                    d0 = d0.min(d);
                } else {
                    d1 = d1.min(d);
                }
            }
            *llr = ((d1 - d0) * LLR_SCALE).clamp(i8::MIN as f32, i8::MAX as f32) as i8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qpsk_corners() {
        let t = ModTable::new(Modulation::Qpsk);
        let p = t.map(0b00);
        assert!(p.re > 0.0 && p.im > 0.0);
        let p = t.map(0b11);
        assert!(p.re < 0.0 && p.im < 0.0);
        let p = t.map(0b10);
        assert!(p.re < 0.0 && p.im > 0.0);
    }

    #[test]
    fn test_unit_average_power() {
        for m in [Modulation::Qpsk, Modulation::Qam16, Modulation::Qam64] {
            let t = ModTable::new(m);
            let avg: f32 =
                t.points.iter().map(|p| p.norm_sqr()).sum::<f32>() / t.points.len() as f32;
            assert!((avg - 1.0).abs() < 1e-3, "{m:?} average power {avg}");
        }
    }

    #[test]
    fn test_hard_demap_round_trip() {
        for m in [Modulation::Qpsk, Modulation::Qam16, Modulation::Qam64] {
            let t = ModTable::new(m);
            for sym in 0..t.points.len() {
                assert_eq!(t.demap_hard(t.map(sym)), sym);
            }
        }
    }

    #[test]
    fn test_soft_demap_signs() {
        let t = ModTable::new(Modulation::Qpsk);
        let mut llr = [0i8; 2];
        // Symbol 0b01: I positive (bit0 = 0), Q negative (bit1 = 1)
        t.demap_soft(t.map(0b01), &mut llr);
        assert!(llr[0] > 0);
        assert!(llr[1] < 0);
    }

    #[test]
    fn test_map_bits_msb_first() {
        let t = ModTable::new(Modulation::Qam16);
        assert_eq!(t.map_bits(&[1, 0, 1, 1]), t.map(0b1011));
    }
}
