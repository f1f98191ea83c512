//! Per-Frame Counter Matrix
//!
//! One `SlotCounters` per windowed slot records how far each stage of
//! the occupying frame has progressed. The matrix is owned exclusively
//! by the master thread (counters are plain integers, never atomics)
//! and every counter is non-decreasing between admit and retire.
//! Threshold crossings are latched so each dependent stage is emitted
//! exactly once.

/// Lifecycle of one windowed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Empty, counters zero; a new frame may be admitted
    Idle,
    /// At least one packet observed
    Receiving,
    /// FFT or later stages in flight
    Processing,
    /// The last stage of the frame is in flight
    Completing,
    /// Finished, waiting for the window base to reach it
    Retired,
}

/// Stage progress for the frame occupying one slot.
#[derive(Debug)]
pub struct SlotCounters {
    pub state: SlotState,
    /// The occupying frame; meaningless while Idle
    pub frame_id: u32,

    /// Packets received per symbol
    pub rx: Vec<u16>,
    /// FFT completions per symbol
    pub fft_done: Vec<u16>,
    /// Receive symbols whose FFTs have all completed
    pub fft_symbols_done: usize,
    /// Pilot symbols whose FFTs have all completed
    pub pilot_symbols_done: usize,
    /// Per-symbol latch: uplink data symbol ready for demodulation
    pub fft_ready: Vec<bool>,

    pub zf_emitted: bool,
    pub zf_done: u16,
    pub zf_complete: bool,

    /// Demodulation completions per symbol
    pub demul_done: Vec<u16>,
    /// Per-symbol latch for the ZF && FFT two-condition gate
    pub demul_emitted: Vec<bool>,
    /// Uplink symbols fully demodulated
    pub demul_symbols_done: usize,
    /// Uplink symbols whose decode task set has been emitted
    pub decode_emitted_symbols: usize,
    pub decode_done: u32,
    pub ul_complete: bool,

    /// Encode completions per symbol
    pub encode_done: Vec<u16>,
    /// Per-symbol latch: downlink symbol fully encoded
    pub encode_ready: Vec<bool>,
    /// Per-symbol latch for the ZF && Encode two-condition gate
    pub precode_emitted: Vec<bool>,
    /// Downlink symbols fully encoded
    pub encode_symbols_done: usize,
    /// Precode completions per symbol
    pub precode_done: Vec<u16>,
    /// Downlink symbols fully precoded
    pub precode_symbols_done: usize,
    /// Downlink symbols whose IFFT task set has been emitted
    pub ifft_emitted_symbols: usize,
    pub ifft_done: u32,
    pub dl_complete: bool,
}

impl SlotCounters {
    pub fn new(num_symbols: usize) -> Self {
        Self {
            state: SlotState::Idle,
            frame_id: 0,
            rx: vec![0; num_symbols],
            fft_done: vec![0; num_symbols],
            fft_symbols_done: 0,
            pilot_symbols_done: 0,
            fft_ready: vec![false; num_symbols],
            zf_emitted: false,
            zf_done: 0,
            zf_complete: false,
            demul_done: vec![0; num_symbols],
            demul_emitted: vec![false; num_symbols],
            demul_symbols_done: 0,
            decode_emitted_symbols: 0,
            decode_done: 0,
            ul_complete: false,
            encode_done: vec![0; num_symbols],
            encode_ready: vec![false; num_symbols],
            precode_emitted: vec![false; num_symbols],
            encode_symbols_done: 0,
            precode_done: vec![0; num_symbols],
            precode_symbols_done: 0,
            ifft_emitted_symbols: 0,
            ifft_done: 0,
            dl_complete: false,
        }
    }

    /// Occupy an Idle slot with a new frame.
    pub fn admit(&mut self, frame_id: u32) {
        debug_assert_eq!(self.state, SlotState::Idle);
        self.frame_id = frame_id;
        self.state = SlotState::Receiving;
    }

    /// Clear everything back to Idle. Called only at retire.
    pub fn reset(&mut self) {
        let symbols = self.rx.len();
        *self = Self::new(symbols);
    }
}

/// The full matrix: one entry per windowed slot.
pub struct CounterMatrix {
    slots: Vec<SlotCounters>,
}

impl CounterMatrix {
    pub fn new(window: usize, num_symbols: usize) -> Self {
        Self {
            slots: (0..window).map(|_| SlotCounters::new(num_symbols)).collect(),
        }
    }

    pub fn slot(&self, slot: usize) -> &SlotCounters {
        &self.slots[slot]
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut SlotCounters {
        &mut self.slots[slot]
    }

    /// Number of slots currently holding an unretired frame, for the
    /// window-capacity invariant.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                matches!(
                    s.state,
                    SlotState::Receiving | SlotState::Processing | SlotState::Completing
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_and_reset() {
        let mut counters = SlotCounters::new(3);
        counters.admit(7);
        assert_eq!(counters.state, SlotState::Receiving);
        assert_eq!(counters.frame_id, 7);

        counters.rx[1] = 4;
        counters.zf_done = 2;
        counters.fft_ready[2] = true;
        counters.reset();
        assert_eq!(counters.state, SlotState::Idle);
        assert_eq!(counters.rx, vec![0, 0, 0]);
        assert_eq!(counters.zf_done, 0);
        assert!(!counters.fft_ready[2]);
    }

    #[test]
    fn test_in_flight_count() {
        let mut matrix = CounterMatrix::new(4, 2);
        assert_eq!(matrix.in_flight(), 0);
        matrix.slot_mut(0).admit(0);
        matrix.slot_mut(1).admit(1);
        matrix.slot_mut(1).state = SlotState::Processing;
        assert_eq!(matrix.in_flight(), 2);
        matrix.slot_mut(0).state = SlotState::Retired;
        assert_eq!(matrix.in_flight(), 1);
    }
}
