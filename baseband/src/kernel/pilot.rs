//! Pilot Sequence
//!
//! The known uplink pilot, shared by channel estimation here and by
//! whatever generates the over-the-air signal. A 16-bit LFSR drives a
//! QPSK constellation; the sequence depends only on its length.

use num_complex::Complex32;
use std::f32::consts::FRAC_1_SQRT_2;

/// Fibonacci LFSR, taps x^16 + x^14 + x^13 + x^11 + 1.
fn lfsr_step(state: &mut u16) -> u16 {
    let bit = (*state ^ (*state >> 2) ^ (*state >> 3) ^ (*state >> 5)) & 1;
    *state = (*state >> 1) | (bit << 15);
    bit
}

/// The unit-power pilot point for each data subcarrier.
pub fn pilot_sequence(len: usize) -> Vec<Complex32> {
    let mut state: u16 = 0xACE1;
    (0..len)
        .map(|_| {
            let i = 1.0 - 2.0 * lfsr_step(&mut state) as f32;
            let q = 1.0 - 2.0 * lfsr_step(&mut state) as f32;
            Complex32::new(i * FRAC_1_SQRT_2, q * FRAC_1_SQRT_2)
        })
        .collect()
}
