//! Master Scheduler
//!
//! The single-threaded brain: drains completion queues in bounded
//! batches, advances the counter matrix, and emits each dependent task
//! set exactly once when its threshold is crossed. The master owns the
//! counters outright, no other thread reads or writes them, and is
//! the only producer of the request queues, which is what makes the
//! all-or-none bulk enqueue sound.
//!
//! Derivation rules, uplink: a landed packet immediately becomes an FFT
//! task; the last pilot FFT of a frame releases the zero-forcing tasks;
//! a fully FFT'd data symbol becomes demodulation work once ZF has
//! completed (a two-condition latch, the only one besides its downlink
//! mirror); a fully demodulated symbol becomes decode work; the last
//! decode marks the uplink done. Downlink mirrors: encode is released
//! at frame admission, precode waits on ZF and encode, IFFT follows
//! precode, and each IFFT completion hands a TX task to the transmit
//! thread.

use crate::buffer::BufferPool;
use crate::counter::{CounterMatrix, SlotState};
use crate::stats::{FrameRecord, SlotTimeline};
use common::config::Config;
use common::event::{
    CompletionBus, Event, EventKind, EventQueue, QueueSaturated,
};
use common::tag::Tag;
use common::types::{SymbolKind, ThreadType};
use common::utils::pin_to_core_with_offset;
use crossbeam::channel::Sender;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use transport::packet::PacketHeader;
use transport::ring::PacketRing;
use tracing::{debug, info, warn};

/// Events the master drains per pass over the queues.
const BATCH: usize = 32;
/// Out-of-window packets parked per receive thread before the drop is
/// fatal.
const PARK_CAPACITY: usize = 8;

/// The master-owned request side: one queue in dynamic mode, one per
/// stage group when workers are statically typed (big-station mode).
pub struct RequestBus {
    queues: Vec<Arc<EventQueue>>,
    bigstation: bool,
}

impl RequestBus {
    pub fn new(cfg: &Config, capacity: usize) -> Self {
        let n = if cfg.bigstation_mode { 4 } else { 1 };
        Self {
            queues: (0..n).map(|_| Arc::new(EventQueue::new(capacity))).collect(),
            bigstation: cfg.bigstation_mode,
        }
    }

    /// The queue a request kind is scheduled on.
    pub fn queue_for(&self, kind: EventKind) -> &EventQueue {
        if self.bigstation {
            &self.queues[kind.stage_group()]
        } else {
            &self.queues[0]
        }
    }

    /// The queue handle worker `group` serves.
    pub fn group_queue(&self, group: usize) -> Arc<EventQueue> {
        if self.bigstation {
            Arc::clone(&self.queues[group])
        } else {
            Arc::clone(&self.queues[0])
        }
    }
}

/// A retired frame's decoded uplink payload, handed to the MAC-facing
/// sink. One byte vector per user.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_id: u32,
    pub payload: Vec<Vec<u8>>,
    pub may_contain_errors: bool,
}

/// Fatal scheduler errors; the process exits with code 2.
#[derive(thiserror::Error, Debug)]
pub enum MasterError {
    #[error(transparent)]
    Saturated(#[from] QueueSaturated),

    #[error("park overflow: frame {frame_id} from rx thread {tid} is more than {PARK_CAPACITY} \
             packets beyond the window")]
    ParkOverflow { frame_id: u32, tid: usize },
}

/// What the master hands back at shutdown.
#[derive(Debug)]
pub struct MasterReport {
    pub frames_retired: usize,
    pub records: Vec<FrameRecord>,
    pub late_packets: u64,
    pub dropped_out_of_window: u64,
}

pub struct Master {
    cfg: Arc<Config>,
    pool: Arc<BufferPool>,
    rings: Vec<Arc<PacketRing>>,
    bus: Arc<CompletionBus>,
    request: Arc<RequestBus>,
    tx_queue: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    decoded_tx: Sender<DecodedFrame>,
    start: Instant,
    core: usize,

    counters: CounterMatrix,
    timelines: Vec<SlotTimeline>,
    /// Smallest unretired frame id
    window_base: u32,
    park: Vec<Vec<Event>>,
    records: Vec<FrameRecord>,
    retired: usize,
    late_packets: u64,
    dropped_out_of_window: u64,
    /// Round-robin start for the completion-queue drain
    rr: usize,
    emit_buf: Vec<Event>,
}

impl Master {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        pool: Arc<BufferPool>,
        rings: Vec<Arc<PacketRing>>,
        bus: Arc<CompletionBus>,
        request: Arc<RequestBus>,
        tx_queue: Arc<EventQueue>,
        running: Arc<AtomicBool>,
        decoded_tx: Sender<DecodedFrame>,
        start: Instant,
        core: usize,
    ) -> Self {
        let window = cfg.frame_window;
        let symbols = cfg.frame.num_symbols();
        let rx_threads = cfg.rx_threads;
        Self {
            cfg,
            pool,
            rings,
            bus,
            request,
            tx_queue,
            running,
            decoded_tx,
            start,
            core,
            counters: CounterMatrix::new(window, symbols),
            timelines: vec![SlotTimeline::default(); window],
            window_base: 0,
            park: (0..rx_threads).map(|_| Vec::new()).collect(),
            records: Vec::new(),
            retired: 0,
            late_packets: 0,
            dropped_out_of_window: 0,
            rr: 0,
            emit_buf: Vec::new(),
        }
    }

    /// The master loop: drain, derive, retire, until shutdown.
    pub fn run(mut self) -> Result<MasterReport, MasterError> {
        if self.cfg.pin_threads {
            let _ = pin_to_core_with_offset(ThreadType::Master, self.core, 0, false);
        }
        info!(
            "master running: window {} frames, {} symbols/frame, {} rx packets/frame",
            self.cfg.frame_window,
            self.cfg.frame.num_symbols(),
            self.cfg.rx_packets_per_frame()
        );

        let backoff = Backoff::new();
        let mut batch: Vec<Event> = Vec::with_capacity(BATCH);

        while self.running.load(Ordering::Relaxed) {
            batch.clear();
            let producers = self.bus.num_producers();
            for i in 0..producers {
                let q = (self.rr + i) % producers;
                while batch.len() < BATCH {
                    match self.bus.try_dequeue(q) {
                        Some(event) => batch.push(event),
                        None => break,
                    }
                }
                if batch.len() >= BATCH {
                    break;
                }
            }
            self.rr = (self.rr + 1) % producers;

            if batch.is_empty() {
                backoff.snooze();
                continue;
            }
            backoff.reset();
            for &event in batch.iter() {
                self.handle(event)?;
            }
        }

        info!("master exiting: {} frames retired", self.retired);
        Ok(MasterReport {
            frames_retired: self.retired,
            records: self.records,
            late_packets: self.late_packets,
            dropped_out_of_window: self.dropped_out_of_window,
        })
    }

    fn now_us(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1e6
    }

    /// Dispatch one drained event to its derivation rule.
    fn handle(&mut self, event: Event) -> Result<(), MasterError> {
        match event.kind {
            EventKind::PacketRx => self.on_packet_rx(event),
            EventKind::FftDone => self.on_fft_done(event.tag),
            EventKind::ZfDone => self.on_zf_done(event.tag),
            EventKind::DemulDone => self.on_demul_done(event.tag),
            EventKind::DecodeDone => self.on_decode_done(event.tag),
            EventKind::EncodeDone => self.on_encode_done(event.tag),
            EventKind::PrecodeDone => self.on_precode_done(event.tag),
            EventKind::IfftDone => self.on_ifft_done(event.tag),
            other => {
                warn!("master ignoring unexpected event {other:?}");
                Ok(())
            }
        }
    }

    fn on_packet_rx(&mut self, event: Event) -> Result<(), MasterError> {
        let tag = event.tag;
        let tid = tag.rx_tid();
        let ring = &self.rings[tid];
        let header = PacketHeader::parse(ring.landing(tag.rx_offset()))
            .expect("published landings hold a validated header");
        let frame_id = header.frame_id;
        let symbol_id = header.symbol_id as usize;

        if frame_id < self.window_base {
            // The frame already retired; nothing useful can be done
            self.late_packets += 1;
            ring.release(tag.rx_offset());
            return Ok(());
        }
        if frame_id as u64 >= self.window_base as u64 + self.cfg.frame_window as u64 {
            if !self.cfg.park_out_of_window {
                self.dropped_out_of_window += 1;
                ring.release(tag.rx_offset());
                return Ok(());
            }
            if self.park[tid].len() >= PARK_CAPACITY {
                return Err(MasterError::ParkOverflow { frame_id, tid });
            }
            debug!("parking frame {frame_id} from rx {tid}");
            self.park[tid].push(event);
            return Ok(());
        }

        let slot = self.pool.slot(frame_id);
        if self.counters.slot(slot).state == SlotState::Idle {
            self.admit(slot, frame_id)?;
        }
        let counters = self.counters.slot_mut(slot);
        counters.rx[symbol_id] += 1;

        // FFT is emitted per packet, immediately, with the same rx tag
        self.request
            .queue_for(EventKind::Fft)
            .enqueue_escalating(Event::new(EventKind::Fft, tag))?;
        Ok(())
    }

    /// Occupy an Idle slot and release the work that needs no samples:
    /// the downlink encode set.
    fn admit(&mut self, slot: usize, frame_id: u32) -> Result<(), MasterError> {
        self.counters.slot_mut(slot).admit(frame_id);
        self.timelines[slot] = SlotTimeline::default();
        self.timelines[slot].start_us = self.now_us();
        debug!("admitted frame {frame_id} into slot {slot}");

        let cbs = self.cfg.codeblocks_per_symbol;
        let dl_symbols: Vec<usize> = self.cfg.frame.dl_symbols().to_vec();
        for s in dl_symbols {
            self.emit_bulk(
                EventKind::Encode,
                (0..cbs).map(|cb| {
                    Tag::frame_symbol_codeblock(frame_id, s, cb)
                        .expect("dimensions validated at startup")
                }),
            )?;
        }
        Ok(())
    }

    fn on_fft_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let slot = self.pool.slot(frame_id);
        let antennas = self.cfg.antennas as u16;
        let kind = self.cfg.frame.kind(symbol_id);

        let counters = self.counters.slot_mut(slot);
        debug_assert_eq!(counters.frame_id, frame_id);
        if counters.state == SlotState::Receiving {
            counters.state = SlotState::Processing;
        }
        counters.fft_done[symbol_id] += 1;
        if counters.fft_done[symbol_id] != antennas {
            return Ok(());
        }

        // Last antenna of this symbol
        counters.fft_symbols_done += 1;
        if counters.fft_symbols_done == self.cfg.frame.num_rx_symbols() {
            self.timelines[slot].fft_us = self.now_us();
        }

        match kind {
            SymbolKind::Pilot => {
                let counters = self.counters.slot_mut(slot);
                counters.pilot_symbols_done += 1;
                if counters.pilot_symbols_done == self.cfg.frame.num_pilot_symbols()
                    && !counters.zf_emitted
                {
                    counters.zf_emitted = true;
                    let blocks = self.cfg.zf_events_per_symbol;
                    self.emit_bulk(
                        EventKind::Zf,
                        (0..blocks).map(|b| {
                            Tag::frame_sc_block(frame_id, b)
                                .expect("dimensions validated at startup")
                        }),
                    )?;
                }
            }
            SymbolKind::UplinkData => {
                let counters = self.counters.slot_mut(slot);
                counters.fft_ready[symbol_id] = true;
                if counters.zf_complete && !counters.demul_emitted[symbol_id] {
                    counters.demul_emitted[symbol_id] = true;
                    self.emit_demul(frame_id, symbol_id)?;
                }
            }
            // Calibration symbols generate FFT work but nothing downstream
            SymbolKind::UplinkCal => {}
            other => {
                warn!("FFT completion for unexpected symbol kind {other:?}");
            }
        }
        self.try_complete(slot)
    }

    fn on_zf_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        let frame_id = tag.frame_id();
        let slot = self.pool.slot(frame_id);
        let counters = self.counters.slot_mut(slot);
        counters.zf_done += 1;
        if counters.zf_done as usize != self.cfg.zf_events_per_symbol {
            return Ok(());
        }
        counters.zf_complete = true;
        self.timelines[slot].zf_us = self.now_us();

        // Release everything that was waiting on the other half of its
        // two-condition gate
        let ul_ready: Vec<usize> = {
            let counters = self.counters.slot_mut(slot);
            self.cfg
                .frame
                .ul_symbols()
                .iter()
                .copied()
                .filter(|&s| counters.fft_ready[s] && !counters.demul_emitted[s])
                .collect()
        };
        for s in ul_ready {
            self.counters.slot_mut(slot).demul_emitted[s] = true;
            self.emit_demul(frame_id, s)?;
        }

        let dl_ready: Vec<usize> = {
            let counters = self.counters.slot_mut(slot);
            self.cfg
                .frame
                .dl_symbols()
                .iter()
                .copied()
                .filter(|&s| counters.encode_ready[s] && !counters.precode_emitted[s])
                .collect()
        };
        for s in dl_ready {
            self.counters.slot_mut(slot).precode_emitted[s] = true;
            self.emit_precode(frame_id, s)?;
        }

        self.try_complete(slot)
    }

    fn on_demul_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let slot = self.pool.slot(frame_id);
        let counters = self.counters.slot_mut(slot);
        counters.demul_done[symbol_id] += 1;
        if counters.demul_done[symbol_id] as usize != self.cfg.demul_events_per_symbol {
            return Ok(());
        }
        counters.demul_symbols_done += 1;
        if counters.demul_symbols_done == self.cfg.frame.num_ul_symbols() {
            self.timelines[slot].demul_us = self.now_us();
        }

        let cbs = self.cfg.codeblocks_per_symbol;
        self.counters.slot_mut(slot).decode_emitted_symbols += 1;
        self.emit_bulk(
            EventKind::Decode,
            (0..cbs).map(|cb| {
                Tag::frame_symbol_codeblock(frame_id, symbol_id, cb)
                    .expect("dimensions validated at startup")
            }),
        )?;
        self.update_completing(slot);
        Ok(())
    }

    fn on_decode_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        let frame_id = tag.frame_id();
        let slot = self.pool.slot(frame_id);
        let counters = self.counters.slot_mut(slot);
        counters.decode_done += 1;
        if counters.decode_done as usize == self.cfg.ul_codeblocks_per_frame() {
            counters.ul_complete = true;
            self.timelines[slot].decode_us = self.now_us();
        }
        self.try_complete(slot)
    }

    fn on_encode_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let slot = self.pool.slot(frame_id);
        let counters = self.counters.slot_mut(slot);
        counters.encode_done[symbol_id] += 1;
        if counters.encode_done[symbol_id] as usize != self.cfg.codeblocks_per_symbol {
            return Ok(());
        }
        counters.encode_ready[symbol_id] = true;
        counters.encode_symbols_done += 1;
        if counters.encode_symbols_done == self.cfg.frame.num_dl_symbols() {
            self.timelines[slot].encode_us = self.now_us();
        }

        let counters = self.counters.slot_mut(slot);
        if counters.zf_complete && !counters.precode_emitted[symbol_id] {
            counters.precode_emitted[symbol_id] = true;
            self.emit_precode(frame_id, symbol_id)?;
        }
        Ok(())
    }

    fn on_precode_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let slot = self.pool.slot(frame_id);
        let counters = self.counters.slot_mut(slot);
        counters.precode_done[symbol_id] += 1;
        if counters.precode_done[symbol_id] as usize != self.cfg.demul_events_per_symbol {
            return Ok(());
        }
        counters.precode_symbols_done += 1;
        if counters.precode_symbols_done == self.cfg.frame.num_dl_symbols() {
            self.timelines[slot].precode_us = self.now_us();
        }

        let antennas = self.cfg.antennas;
        self.counters.slot_mut(slot).ifft_emitted_symbols += 1;
        self.emit_bulk(
            EventKind::Ifft,
            (0..antennas).map(|a| {
                Tag::frame_symbol_antenna(frame_id, symbol_id, a)
                    .expect("dimensions validated at startup")
            }),
        )?;
        self.update_completing(slot);
        Ok(())
    }

    fn on_ifft_done(&mut self, tag: Tag) -> Result<(), MasterError> {
        // Hand the finished symbol/antenna to the transmit thread
        self.tx_queue
            .enqueue_escalating(Event::new(EventKind::PacketTx, tag))?;

        let frame_id = tag.frame_id();
        let slot = self.pool.slot(frame_id);
        let counters = self.counters.slot_mut(slot);
        counters.ifft_done += 1;
        if counters.ifft_done as usize == self.cfg.dl_iffts_per_frame() {
            counters.dl_complete = true;
            self.timelines[slot].ifft_us = self.now_us();
        }
        self.try_complete(slot)
    }

    fn emit_demul(&mut self, frame_id: u32, symbol_id: usize) -> Result<(), MasterError> {
        let blocks = self.cfg.demul_events_per_symbol;
        self.emit_bulk(
            EventKind::Demul,
            (0..blocks).map(|b| {
                Tag::frame_symbol_block(frame_id, symbol_id, b)
                    .expect("dimensions validated at startup")
            }),
        )
    }

    fn emit_precode(&mut self, frame_id: u32, symbol_id: usize) -> Result<(), MasterError> {
        let blocks = self.cfg.demul_events_per_symbol;
        self.emit_bulk(
            EventKind::Precode,
            (0..blocks).map(|b| {
                Tag::frame_symbol_block(frame_id, symbol_id, b)
                    .expect("dimensions validated at startup")
            }),
        )
    }

    /// Burst-emit one derived task set into the request queue.
    fn emit_bulk(
        &mut self,
        kind: EventKind,
        tags: impl Iterator<Item = Tag>,
    ) -> Result<(), MasterError> {
        let mut buf = std::mem::take(&mut self.emit_buf);
        buf.clear();
        buf.extend(tags.map(|tag| Event::new(kind, tag)));
        let result = self.request.queue_for(kind).enqueue_bulk_escalating(&buf);
        self.emit_buf = buf;
        result?;
        Ok(())
    }

    /// Move a frame into Completing once its final task sets are out.
    fn update_completing(&mut self, slot: usize) {
        let frame = &self.cfg.frame;
        let counters = self.counters.slot_mut(slot);
        if counters.state != SlotState::Processing {
            return;
        }
        let ul = frame.num_ul_symbols();
        let dl = frame.num_dl_symbols();
        let ul_emitted = ul == 0 || counters.decode_emitted_symbols == ul;
        let dl_emitted = dl == 0 || counters.ifft_emitted_symbols == dl;
        if (ul + dl > 0 && ul_emitted && dl_emitted)
            || (ul + dl == 0 && counters.zf_emitted)
        {
            counters.state = SlotState::Completing;
        }
    }

    /// True once every stage the template asks for has completed.
    fn frame_done(&self, slot: usize) -> bool {
        let frame = &self.cfg.frame;
        let counters = self.counters.slot(slot);
        counters.fft_symbols_done == frame.num_rx_symbols()
            && (frame.num_pilot_symbols() == 0 || counters.zf_complete)
            && (frame.num_ul_symbols() == 0 || counters.ul_complete)
            && (frame.num_dl_symbols() == 0 || counters.dl_complete)
    }

    /// Mark a finished frame Retired and reclaim every slot the window
    /// base has caught up with, in frame order.
    fn try_complete(&mut self, slot: usize) -> Result<(), MasterError> {
        self.update_completing(slot);
        {
            let counters = self.counters.slot(slot);
            let active = matches!(
                counters.state,
                SlotState::Receiving | SlotState::Processing | SlotState::Completing
            );
            if !active || !self.frame_done(slot) {
                return Ok(());
            }
        }
        self.counters.slot_mut(slot).state = SlotState::Retired;

        loop {
            let base_slot = self.pool.slot(self.window_base);
            let counters = self.counters.slot(base_slot);
            if counters.state != SlotState::Retired || counters.frame_id != self.window_base {
                break;
            }
            self.retire(base_slot)?;
        }
        Ok(())
    }

    /// Reclaim one slot: record the timeline, hand decoded bits to the
    /// sink, clear the counters, advance the window, and re-process any
    /// parked packets that now fit.
    fn retire(&mut self, slot: usize) -> Result<(), MasterError> {
        let frame_id = self.window_base;
        self.records.push(FrameRecord {
            frame_id,
            timeline: self.timelines[slot],
            retire_us: self.now_us(),
        });
        self.sink_decoded(slot, frame_id);

        self.counters.slot_mut(slot).reset();
        self.timelines[slot] = SlotTimeline::default();
        self.window_base += 1;
        self.retired += 1;
        debug!("retired frame {frame_id}, window base now {}", self.window_base);

        if self.cfg.frames_to_process > 0 && self.retired >= self.cfg.frames_to_process {
            info!("processed {} frames, stopping", self.retired);
            self.running.store(false, Ordering::Relaxed);
        }

        self.drain_parked()
    }

    /// Copy the retired frame's decoded uplink bytes to the MAC-facing
    /// sink. A full or missing sink only loses the copy, never the run.
    fn sink_decoded(&mut self, slot: usize, frame_id: u32) {
        let frame = &self.cfg.frame;
        if frame.num_ul_symbols() == 0 {
            return;
        }
        let info_bytes = self.cfg.ldpc.info_bytes();
        let blocks = self.cfg.codeblocks_per_ue;
        let mut payload =
            vec![Vec::with_capacity(self.cfg.ul_bytes_per_frame_per_ue()); self.cfg.ues];
        let mut may_contain_errors = false;

        for ul_idx in 0..frame.num_ul_symbols() {
            let row = unsafe { self.pool.decoded(slot, ul_idx) };
            let flags = unsafe { self.pool.decode_flags(slot, ul_idx) };
            for (ue, sink) in payload.iter_mut().enumerate() {
                for block in 0..blocks {
                    let off = self.pool.decoded_offset(ue, block);
                    sink.extend_from_slice(&row[off..off + info_bytes]);
                    may_contain_errors |= flags[ue * blocks + block] != 0;
                }
            }
        }

        let _ = self.decoded_tx.try_send(DecodedFrame {
            frame_id,
            payload,
            may_contain_errors,
        });
    }

    /// Re-process parked packets that fell inside the advanced window.
    fn drain_parked(&mut self) -> Result<(), MasterError> {
        let limit = self.window_base as u64 + self.cfg.frame_window as u64;
        for tid in 0..self.park.len() {
            if self.park[tid].is_empty() {
                continue;
            }
            let rings = &self.rings;
            let (ready, keep): (Vec<Event>, Vec<Event>) =
                self.park[tid].drain(..).partition(|event| {
                    let header = PacketHeader::parse(
                        rings[event.tag.rx_tid()].landing(event.tag.rx_offset()),
                    )
                    .expect("parked landings hold a validated header");
                    (header.frame_id as u64) < limit
                });
            self.park[tid] = keep;
            for event in ready {
                self.on_packet_rx(event)?;
            }
        }
        Ok(())
    }

    /// Slots currently carrying an unretired frame, for tests.
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.counters.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{bounded, Receiver};
    use transport::packet::serialize;

    const W: usize = 4;

    fn test_config() -> Arc<Config> {
        Arc::new(
            Config::from_json_str(
                r#"{
                    "antennas": 2, "ues": 1,
                    "ofdm_ca": 128, "cp_len": 16,
                    "ofdm_data_start": 14, "ofdm_data_num": 100,
                    "frame_template": "PU",
                    "ldpc": { "base_graph": 2, "lifting_size": 4 },
                    "frame_window": 4,
                    "zf_block_size": 25, "demul_block_size": 50,
                    "worker_threads": 1, "rx_threads": 1,
                    "ring_depth": 64
                }"#,
            )
            .unwrap(),
        )
    }

    struct Harness {
        master: Master,
        request: Arc<RequestBus>,
        tx_queue: Arc<EventQueue>,
        ring: Arc<PacketRing>,
        decoded_rx: Receiver<DecodedFrame>,
        cfg: Arc<Config>,
        next_landing: usize,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(test_config())
        }

        fn with_config(cfg: Arc<Config>) -> Self {
            let pool = Arc::new(BufferPool::new(&cfg));
            let ring = Arc::new(PacketRing::new(cfg.ring_depth, cfg.packet_bytes()));
            let rings = vec![Arc::clone(&ring)];
            let bus = Arc::new(CompletionBus::new(1, 1024));
            let request = Arc::new(RequestBus::new(&cfg, 1024));
            let tx_queue = Arc::new(EventQueue::new(1024));
            let (decoded_tx, decoded_rx) = bounded(16);
            let master = Master::new(
                Arc::clone(&cfg),
                pool,
                rings,
                bus,
                Arc::clone(&request),
                Arc::clone(&tx_queue),
                Arc::new(AtomicBool::new(true)),
                decoded_tx,
                Instant::now(),
                0,
            );
            Self {
                master,
                request,
                tx_queue,
                ring,
                decoded_rx,
                cfg,
                next_landing: 0,
            }
        }

        /// Land a packet in the ring and feed the PacketRx event.
        fn inject_packet(&mut self, frame_id: u32, symbol_id: usize, antenna_id: usize) {
            let landing = self.next_landing;
            self.next_landing = (self.next_landing + 1) % self.ring.depth();
            let header = PacketHeader {
                frame_id,
                symbol_id: symbol_id as u32,
                cell_id: 0,
                antenna_id: antenna_id as u32,
            };
            let pkt = serialize(&header, &vec![0i16; self.cfg.samples_per_symbol * 2]);
            unsafe {
                self.ring.landing_mut(landing).copy_from_slice(&pkt);
            }
            self.ring.publish(landing);
            let tag = Tag::rx(0, landing).unwrap();
            self.master
                .handle(Event::new(EventKind::PacketRx, tag))
                .unwrap();
        }

        /// Drain every pending request of one kind, returning its tags.
        fn drain_requests(&self, kind: EventKind) -> Vec<Tag> {
            let mut out = Vec::new();
            let queue = self.request.queue_for(kind);
            while let Some(event) = queue.try_dequeue() {
                assert_eq!(event.kind, kind, "unexpected interleaved request");
                // Workers would release the landing after the FFT
                if event.kind == EventKind::Fft {
                    self.ring.release(event.tag.rx_offset());
                }
                out.push(event.tag);
            }
            out
        }

        fn feed(&mut self, kind: EventKind, tag: Tag) {
            self.master.handle(Event::new(kind, tag)).unwrap();
        }

        /// Run one frame's uplink from injection to decode completion.
        fn complete_frame(&mut self, frame_id: u32) {
            for symbol in 0..2 {
                for ant in 0..2 {
                    self.inject_packet(frame_id, symbol, ant);
                }
            }
            assert_eq!(self.drain_requests(EventKind::Fft).len(), 4);
            for symbol in 0..2 {
                for ant in 0..2 {
                    self.feed(
                        EventKind::FftDone,
                        Tag::frame_symbol_antenna(frame_id, symbol, ant).unwrap(),
                    );
                }
            }
            for tag in self.drain_requests(EventKind::Zf) {
                self.feed(EventKind::ZfDone, tag);
            }
            for tag in self.drain_requests(EventKind::Demul) {
                self.feed(EventKind::DemulDone, tag);
            }
            for tag in self.drain_requests(EventKind::Decode) {
                self.feed(EventKind::DecodeDone, tag);
            }
        }
    }

    #[test]
    fn test_packet_rx_emits_fft_immediately() {
        let mut h = Harness::new();
        h.inject_packet(0, 0, 0);
        let ffts = h.drain_requests(EventKind::Fft);
        assert_eq!(ffts.len(), 1);
        assert_eq!(h.master.counters.slot(0).rx[0], 1);
        assert_eq!(h.master.counters.slot(0).state, SlotState::Receiving);
    }

    #[test]
    fn test_zf_emitted_once_at_last_pilot_antenna() {
        let mut h = Harness::new();
        for ant in 0..2 {
            h.inject_packet(0, 0, ant);
        }
        h.drain_requests(EventKind::Fft);

        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 0, 0).unwrap());
        assert!(h.drain_requests(EventKind::Zf).is_empty());

        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 0, 1).unwrap());
        let zf = h.drain_requests(EventKind::Zf);
        assert_eq!(zf.len(), h.cfg.zf_events_per_symbol);
        // Emit-once: no second task set however the counters are poked
        assert!(h.drain_requests(EventKind::Zf).is_empty());
    }

    #[test]
    fn test_demul_waits_for_both_zf_and_fft() {
        let mut h = Harness::new();
        for symbol in 0..2 {
            for ant in 0..2 {
                h.inject_packet(0, symbol, ant);
            }
        }
        h.drain_requests(EventKind::Fft);

        // Data symbol FFTs first: no demul until ZF completes
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 1, 0).unwrap());
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 1, 1).unwrap());
        assert!(h.drain_requests(EventKind::Demul).is_empty());

        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 0, 0).unwrap());
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 0, 1).unwrap());
        let zf = h.drain_requests(EventKind::Zf);
        assert!(h.drain_requests(EventKind::Demul).is_empty());

        for tag in zf {
            h.feed(EventKind::ZfDone, tag);
        }
        let demul = h.drain_requests(EventKind::Demul);
        assert_eq!(demul.len(), h.cfg.demul_events_per_symbol);
    }

    #[test]
    fn test_demul_after_zf_when_fft_lands_late() {
        // The mirrored interleaving of the latch
        let mut h = Harness::new();
        for ant in 0..2 {
            h.inject_packet(0, 0, ant);
        }
        h.drain_requests(EventKind::Fft);
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 0, 0).unwrap());
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 0, 1).unwrap());
        for tag in h.drain_requests(EventKind::Zf) {
            h.feed(EventKind::ZfDone, tag);
        }
        assert!(h.drain_requests(EventKind::Demul).is_empty());

        for ant in 0..2 {
            h.inject_packet(0, 1, ant);
        }
        h.drain_requests(EventKind::Fft);
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 1, 0).unwrap());
        h.feed(EventKind::FftDone, Tag::frame_symbol_antenna(0, 1, 1).unwrap());
        let demul = h.drain_requests(EventKind::Demul);
        assert_eq!(demul.len(), h.cfg.demul_events_per_symbol);
    }

    #[test]
    fn test_frame_retires_in_order_and_reclaims_slot() {
        let mut h = Harness::new();
        h.complete_frame(0);
        assert_eq!(h.master.retired, 1);
        assert_eq!(h.master.window_base, 1);
        assert_eq!(h.master.counters.slot(0).state, SlotState::Idle);

        let decoded = h.decoded_rx.try_recv().unwrap();
        assert_eq!(decoded.frame_id, 0);
        assert_eq!(decoded.payload.len(), 1);

        // The slot is immediately reusable by frame W
        h.inject_packet(W as u32, 0, 0);
        assert_eq!(h.master.counters.slot(0).state, SlotState::Receiving);
        assert_eq!(h.master.counters.slot(0).frame_id, W as u32);
    }

    #[test]
    fn test_window_capacity_never_exceeded() {
        let mut h = Harness::new();
        for f in 0..W as u32 {
            h.inject_packet(f, 0, 0);
        }
        assert_eq!(h.master.in_flight(), W);
        // One more frame must park, not admit
        h.inject_packet(W as u32, 0, 0);
        assert_eq!(h.master.in_flight(), W);
        assert_eq!(h.master.park[0].len(), 1);
    }

    #[test]
    fn test_parked_packet_replays_after_retire() {
        let mut h = Harness::new();
        // Fill the window with frames 1..=4 so frame 4 fits but 5 parks
        for f in 0..W as u32 {
            for symbol in 0..2 {
                for ant in 0..2 {
                    h.inject_packet(f, symbol, ant);
                }
            }
        }
        h.inject_packet(W as u32, 0, 0);
        assert_eq!(h.master.park[0].len(), 1);
        h.drain_requests(EventKind::Fft);

        // Finish frame 0; the parked packet for frame W must replay
        for symbol in 0..2 {
            for ant in 0..2 {
                h.feed(
                    EventKind::FftDone,
                    Tag::frame_symbol_antenna(0, symbol, ant).unwrap(),
                );
            }
        }
        for tag in h.drain_requests(EventKind::Zf) {
            h.feed(EventKind::ZfDone, tag);
        }
        for tag in h.drain_requests(EventKind::Demul) {
            h.feed(EventKind::DemulDone, tag);
        }
        for tag in h.drain_requests(EventKind::Decode) {
            h.feed(EventKind::DecodeDone, tag);
        }
        assert_eq!(h.master.window_base, 1);
        assert!(h.master.park[0].is_empty());
        assert_eq!(h.master.counters.slot(0).frame_id, W as u32);
        assert_eq!(h.master.counters.slot(0).state, SlotState::Receiving);
    }

    #[test]
    fn test_out_of_window_dropped_when_parking_disabled() {
        let cfg = Arc::new(
            Config::from_json_str(
                r#"{
                    "antennas": 2, "ues": 1,
                    "ofdm_ca": 128, "cp_len": 16,
                    "ofdm_data_start": 14, "ofdm_data_num": 100,
                    "frame_template": "PU",
                    "ldpc": { "base_graph": 2, "lifting_size": 4 },
                    "frame_window": 4,
                    "zf_block_size": 25, "demul_block_size": 50,
                    "worker_threads": 1, "rx_threads": 1,
                    "ring_depth": 64,
                    "park_out_of_window": false
                }"#,
            )
            .unwrap(),
        );
        let mut h = Harness::with_config(cfg);
        h.inject_packet(W as u32, 0, 0);
        assert_eq!(h.master.dropped_out_of_window, 1);
        assert!(h.master.park[0].is_empty());
        // The landing was released for reuse
        assert!(h.ring.is_landing_empty(0));
        assert!(h.drain_requests(EventKind::Fft).is_empty());
    }

    #[test]
    fn test_park_overflow_is_fatal() {
        let mut h = Harness::new();
        h.inject_packet(0, 0, 0);
        for i in 0..PARK_CAPACITY {
            h.inject_packet((W + i) as u32, 0, 0);
        }
        // The ninth out-of-window packet overflows the park buffer
        let landing = h.next_landing;
        let header = PacketHeader {
            frame_id: (W + PARK_CAPACITY) as u32,
            symbol_id: 0,
            cell_id: 0,
            antenna_id: 0,
        };
        let pkt = serialize(&header, &vec![0i16; h.cfg.samples_per_symbol * 2]);
        unsafe {
            h.ring.landing_mut(landing).copy_from_slice(&pkt);
        }
        h.ring.publish(landing);
        let result = h
            .master
            .handle(Event::new(EventKind::PacketRx, Tag::rx(0, landing).unwrap()));
        assert!(matches!(result, Err(MasterError::ParkOverflow { .. })));
    }

    #[test]
    fn test_out_of_order_frames_retire_in_order() {
        let mut h = Harness::new();
        // Start both frames, finish frame 1 entirely before frame 0
        for f in 0..2u32 {
            for symbol in 0..2 {
                for ant in 0..2 {
                    h.inject_packet(f, symbol, ant);
                }
            }
        }
        h.drain_requests(EventKind::Fft);

        for symbol in 0..2 {
            for ant in 0..2 {
                h.feed(
                    EventKind::FftDone,
                    Tag::frame_symbol_antenna(1, symbol, ant).unwrap(),
                );
            }
        }
        for tag in h.drain_requests(EventKind::Zf) {
            h.feed(EventKind::ZfDone, tag);
        }
        for tag in h.drain_requests(EventKind::Demul) {
            h.feed(EventKind::DemulDone, tag);
        }
        for tag in h.drain_requests(EventKind::Decode) {
            h.feed(EventKind::DecodeDone, tag);
        }
        // Frame 1 is done but must wait for frame 0
        assert_eq!(h.master.retired, 0);
        assert_eq!(
            h.master.counters.slot(h.master.pool.slot(1)).state,
            SlotState::Retired
        );

        for symbol in 0..2 {
            for ant in 0..2 {
                h.feed(
                    EventKind::FftDone,
                    Tag::frame_symbol_antenna(0, symbol, ant).unwrap(),
                );
            }
        }
        for tag in h.drain_requests(EventKind::Zf) {
            h.feed(EventKind::ZfDone, tag);
        }
        for tag in h.drain_requests(EventKind::Demul) {
            h.feed(EventKind::DemulDone, tag);
        }
        for tag in h.drain_requests(EventKind::Decode) {
            h.feed(EventKind::DecodeDone, tag);
        }
        // Both retire, in frame order
        assert_eq!(h.master.retired, 2);
        assert_eq!(h.master.records[0].frame_id, 0);
        assert_eq!(h.master.records[1].frame_id, 1);
    }

    #[test]
    fn test_ifft_completion_feeds_tx_queue() {
        let cfg = Arc::new(
            Config::from_json_str(
                r#"{
                    "antennas": 2, "ues": 1,
                    "ofdm_ca": 128, "cp_len": 16,
                    "ofdm_data_start": 14, "ofdm_data_num": 100,
                    "frame_template": "PD",
                    "ldpc": { "base_graph": 2, "lifting_size": 4 },
                    "frame_window": 4,
                    "zf_block_size": 25, "demul_block_size": 50,
                    "worker_threads": 1, "rx_threads": 1,
                    "ring_depth": 64
                }"#,
            )
            .unwrap(),
        );
        let pool = Arc::new(BufferPool::new(&cfg));
        let ring = Arc::new(PacketRing::new(cfg.ring_depth, cfg.packet_bytes()));
        let bus = Arc::new(CompletionBus::new(1, 1024));
        let request = Arc::new(RequestBus::new(&cfg, 1024));
        let tx_queue = Arc::new(EventQueue::new(1024));
        let (decoded_tx, _decoded_rx) = bounded(16);
        let mut master = Master::new(
            Arc::clone(&cfg),
            Arc::clone(&pool),
            vec![Arc::clone(&ring)],
            bus,
            Arc::clone(&request),
            Arc::clone(&tx_queue),
            Arc::new(AtomicBool::new(true)),
            decoded_tx,
            Instant::now(),
            0,
        );

        // Land the two pilot packets; admission releases the encode set
        for ant in 0..2u32 {
            let landing = ant as usize;
            let header = PacketHeader {
                frame_id: 0,
                symbol_id: 0,
                cell_id: 0,
                antenna_id: ant,
            };
            let pkt = serialize(&header, &vec![0i16; cfg.samples_per_symbol * 2]);
            unsafe {
                ring.landing_mut(landing).copy_from_slice(&pkt);
            }
            ring.publish(landing);
            master
                .handle(Event::new(
                    EventKind::PacketRx,
                    Tag::rx(0, landing).unwrap(),
                ))
                .unwrap();
        }
        let req = request.queue_for(EventKind::Encode);
        let mut encode_tags = Vec::new();
        let mut fft_tags = Vec::new();
        while let Some(event) = req.try_dequeue() {
            match event.kind {
                EventKind::Encode => encode_tags.push(event.tag),
                EventKind::Fft => {
                    ring.release(event.tag.rx_offset());
                    fft_tags.push(event.tag);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(encode_tags.len(), cfg.codeblocks_per_symbol);
        assert_eq!(fft_tags.len(), 2);

        // Pilot FFTs -> ZF -> (with encode done) precode -> IFFT -> TX
        for ant in 0..2 {
            master
                .handle(Event::new(
                    EventKind::FftDone,
                    Tag::frame_symbol_antenna(0, 0, ant).unwrap(),
                ))
                .unwrap();
        }
        for tag in encode_tags {
            master
                .handle(Event::new(EventKind::EncodeDone, tag))
                .unwrap();
        }
        let mut zf_tags = Vec::new();
        while let Some(event) = req.try_dequeue() {
            assert_eq!(event.kind, EventKind::Zf);
            zf_tags.push(event.tag);
        }
        for tag in zf_tags {
            master.handle(Event::new(EventKind::ZfDone, tag)).unwrap();
        }
        let mut precode_tags = Vec::new();
        while let Some(event) = req.try_dequeue() {
            assert_eq!(event.kind, EventKind::Precode);
            precode_tags.push(event.tag);
        }
        assert_eq!(precode_tags.len(), cfg.demul_events_per_symbol);
        for tag in precode_tags {
            master
                .handle(Event::new(EventKind::PrecodeDone, tag))
                .unwrap();
        }
        let mut ifft_tags = Vec::new();
        while let Some(event) = req.try_dequeue() {
            assert_eq!(event.kind, EventKind::Ifft);
            ifft_tags.push(event.tag);
        }
        assert_eq!(ifft_tags.len(), cfg.antennas);
        for tag in ifft_tags {
            master.handle(Event::new(EventKind::IfftDone, tag)).unwrap();
        }

        // One TX packet per (symbol, antenna), and the frame retired
        let mut tx = 0;
        while tx_queue.try_dequeue().is_some() {
            tx += 1;
        }
        assert_eq!(tx, cfg.dl_iffts_per_frame());
        assert_eq!(master.retired, 1);
    }
}
