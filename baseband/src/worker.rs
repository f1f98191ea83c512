//! Worker Pool
//!
//! Each worker is a pinned, homogeneous dispatcher: it pulls one
//! request event, runs the kernel its kind names, and posts the
//! completion (same tag, `Done` kind) into its own completion queue,
//! retrying forever because a lost completion would deadlock the frame.
//! Workers allocate their scratch once, never block on I/O, and touch
//! nothing but read-only configuration and the tag-addressed buffers.

use crate::kernel::fft::FftEngine;
use crate::kernel::ldpc::LdpcScratch;
use crate::kernel::zf::ZfScratch;
use crate::kernel::{demul, fft, ldpc, precode, zf, KernelCtx};
use crate::stats::{StageId, WorkerStats};
use common::event::{CompletionProducer, Event, EventKind, EventQueue};
use common::tag::Tag;
use common::types::ThreadType;
use common::utils::pin_to_core_with_offset;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Everything one worker needs; constructed by the runtime.
pub struct WorkerContext {
    pub tid: usize,
    pub kctx: KernelCtx,
    /// The request queue this worker serves (its stage-group queue in
    /// big-station mode, the single shared queue otherwise)
    pub request: Arc<EventQueue>,
    pub producer: CompletionProducer,
    pub running: Arc<AtomicBool>,
    /// First core of the worker range
    pub core_base: usize,
}

/// The worker loop. Returns the duration accumulators at shutdown.
pub fn run_worker(ctx: WorkerContext) -> WorkerStats {
    let cfg = &ctx.kctx.cfg;
    if cfg.pin_threads {
        let _ = pin_to_core_with_offset(ThreadType::Worker, ctx.core_base, ctx.tid, false);
    }

    let mut engine = FftEngine::new(cfg.ofdm_ca);
    let mut zf_scratch = ZfScratch::new(cfg.antennas, cfg.ues);
    let mut ldpc_scratch = LdpcScratch::new(&ctx.kctx.ldpc);
    let mut stats = WorkerStats::new(ctx.tid);

    let backoff = Backoff::new();
    let mut idle_since = Instant::now();

    while ctx.running.load(Ordering::Relaxed) {
        let Some(event) = ctx.request.try_dequeue() else {
            // Spin first, then park briefly once the spin budget is spent
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(1));
            } else {
                backoff.snooze();
            }
            continue;
        };
        backoff.reset();

        let Some(stage) = StageId::from_request(event.kind) else {
            warn!("worker {} dropping non-request event {:?}", ctx.tid, event.kind);
            continue;
        };
        let wait = idle_since.elapsed();

        let work_start = Instant::now();
        let done_tag = dispatch(
            &ctx.kctx,
            &mut engine,
            &mut zf_scratch,
            &mut ldpc_scratch,
            event,
        );
        let work = work_start.elapsed();

        let writeback_start = Instant::now();
        let completion = Event::new(event.kind.completion(), done_tag);
        if !ctx.producer.send(completion, &ctx.running) {
            break; // shutdown raced the completion
        }
        stats.record(stage, wait, work, writeback_start.elapsed());
        idle_since = Instant::now();
    }

    info!("worker {} exiting after {} tasks", ctx.tid, stats.tasks());
    stats
}

/// Select the kernel by event kind. Returns the completion tag (FFT
/// re-tags its rx tag with frame/symbol/antenna; all others echo).
fn dispatch(
    kctx: &KernelCtx,
    engine: &mut FftEngine,
    zf_scratch: &mut ZfScratch,
    ldpc_scratch: &mut LdpcScratch,
    event: Event,
) -> Tag {
    match event.kind {
        EventKind::Fft => fft::do_fft(kctx, engine, event.tag),
        EventKind::Zf => zf::do_zf(kctx, zf_scratch, event.tag),
        EventKind::Demul => demul::do_demul(kctx, event.tag),
        EventKind::Decode => ldpc::do_decode(kctx, ldpc_scratch, event.tag),
        EventKind::Encode => ldpc::do_encode(kctx, event.tag),
        EventKind::Precode => precode::do_precode(kctx, event.tag),
        EventKind::Ifft => fft::do_ifft(kctx, engine, event.tag),
        other => unreachable!("{other:?} is filtered before dispatch"),
    }
}
