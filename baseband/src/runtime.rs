//! Runtime Assembly
//!
//! Owns everything the threads share (configuration, the windowed
//! pool, the rings and queues, the `running` flag) and the thread
//! handles themselves. Construction allocates; `join` tears the system
//! down in dependency order and writes the timing files. The `running`
//! flag is the only process-wide mutable atomic.

use crate::buffer::{BufferPool, DlBits};
use crate::kernel::KernelCtx;
use crate::master::{DecodedFrame, Master, MasterError, MasterReport, RequestBus};
use crate::stats::{write_frame_timestamps, write_worker_durations, WorkerStats};
use crate::worker::{run_worker, WorkerContext};
use common::config::Config;
use common::event::{CompletionBus, EventQueue};
use common::utils::{available_cores, cfloat_to_ci16};
use crossbeam::channel::{bounded, Receiver};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use transport::ring::PacketRing;
use transport::rx::{bind_rx_socket, run_rx_thread, RxContext};
use transport::tx::{bind_tx_socket, run_tx_thread, TxContext};
use transport::{TransportError, TxIqSource};
use tracing::{error, info};

/// Fatal runtime errors; the process exits with code 2.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Master(#[from] MasterError),

    #[error("core pinning requires {needed} cores from offset {offset}, found {available}")]
    InsufficientCores {
        needed: usize,
        offset: usize,
        available: usize,
    },

    #[error("thread error: {0}")]
    Thread(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// End-of-run accounting.
#[derive(Debug)]
pub struct RuntimeSummary {
    pub frames_retired: usize,
    pub late_packets: u64,
    pub dropped_out_of_window: u64,
    pub malformed_packets: u64,
    pub tx_packets: u64,
    pub timestamp_file: PathBuf,
}

/// The transmit thread's view of the downlink IQ buffers.
struct PoolTxSource {
    cfg: Arc<Config>,
    pool: Arc<BufferPool>,
}

impl TxIqSource for PoolTxSource {
    fn fetch(&self, frame_id: u32, symbol_id: usize, antenna_id: usize, out: &mut Vec<i16>) {
        let slot = self.pool.slot(frame_id);
        let dl_idx = self.cfg.frame.kind_index(symbol_id);
        let samples = self.cfg.samples_per_symbol;
        let row = unsafe { self.pool.tx_iq(slot, dl_idx) };
        *out = cfloat_to_ci16(&row[antenna_id * samples..(antenna_id + 1) * samples]);
    }
}

/// The running system.
pub struct Runtime {
    cfg: Arc<Config>,
    running: Arc<AtomicBool>,
    rx_addrs: Vec<SocketAddr>,
    malformed: Arc<AtomicU64>,
    tx_sent: Arc<AtomicU64>,
    decoded_rx: Receiver<DecodedFrame>,
    master: JoinHandle<Result<MasterReport, MasterError>>,
    workers: Vec<JoinHandle<WorkerStats>>,
    rx_threads: Vec<JoinHandle<()>>,
    tx_thread: JoinHandle<()>,
}

impl Runtime {
    /// Allocate the pool and queues, bind the sockets, and spawn every
    /// pinned thread. Core layout from `core_offset`: master, receive
    /// threads, workers, transmit.
    pub fn start(cfg: Arc<Config>) -> Result<Self, RuntimeError> {
        let total_threads = 1 + cfg.rx_threads + cfg.worker_threads + 1;
        if cfg.pin_threads && cfg.strict_pinning {
            let available = available_cores();
            if cfg.core_offset + total_threads > available {
                return Err(RuntimeError::InsufficientCores {
                    needed: total_threads,
                    offset: cfg.core_offset,
                    available,
                });
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let start = Instant::now();
        let pool = Arc::new(BufferPool::new(&cfg));
        let dl_bits = Arc::new(DlBits::new(&cfg));
        let rings: Vec<Arc<PacketRing>> = (0..cfg.rx_threads)
            .map(|_| Arc::new(PacketRing::new(cfg.ring_depth, cfg.packet_bytes())))
            .collect();
        let kctx = KernelCtx::new(
            Arc::clone(&cfg),
            Arc::clone(&pool),
            rings.clone(),
            dl_bits,
        );

        // Queue capacity scales with everything that can be in flight
        let per_frame = cfg.rx_packets_per_frame()
            + cfg.zf_events_per_symbol
            + cfg.frame.num_symbols() * cfg.demul_events_per_symbol.max(cfg.codeblocks_per_symbol);
        let capacity = (cfg.frame_window * per_frame * 2).next_power_of_two().max(1024);

        let producers = cfg.rx_threads + cfg.worker_threads;
        let bus = Arc::new(CompletionBus::new(producers, capacity));
        let request = Arc::new(RequestBus::new(&cfg, capacity));
        let tx_queue = Arc::new(EventQueue::new(capacity));
        let (decoded_tx, decoded_rx) = bounded(cfg.frames_to_process.max(64));

        let malformed = Arc::new(AtomicU64::new(0));
        let tx_sent = Arc::new(AtomicU64::new(0));

        let master_core = cfg.core_offset;
        let rx_core_base = cfg.core_offset + 1;
        let worker_core_base = rx_core_base + cfg.rx_threads;
        let tx_core = worker_core_base + cfg.worker_threads;

        // Receive threads own producer ids 0..rx_threads
        let mut rx_addrs = Vec::with_capacity(cfg.rx_threads);
        let mut rx_threads = Vec::with_capacity(cfg.rx_threads);
        for tid in 0..cfg.rx_threads {
            let socket = bind_rx_socket(&cfg, tid)?;
            rx_addrs.push(socket.local_addr()?);
            let ctx = RxContext {
                tid,
                cfg: Arc::clone(&cfg),
                socket,
                ring: Arc::clone(&rings[tid]),
                producer: bus.producer(tid),
                running: Arc::clone(&running),
                malformed: Arc::clone(&malformed),
                core_base: rx_core_base,
            };
            rx_threads.push(
                std::thread::Builder::new()
                    .name(format!("rx{tid}"))
                    .spawn(move || run_rx_thread(ctx))?,
            );
        }

        // Workers own producer ids rx_threads..rx_threads+worker_threads
        let mut workers = Vec::with_capacity(cfg.worker_threads);
        for tid in 0..cfg.worker_threads {
            let ctx = WorkerContext {
                tid,
                kctx: kctx.clone(),
                request: request.group_queue(worker_stage_group(&cfg, tid)),
                producer: bus.producer(cfg.rx_threads + tid),
                running: Arc::clone(&running),
                core_base: worker_core_base,
            };
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker{tid}"))
                    .spawn(move || run_worker(ctx))?,
            );
        }

        let tx_socket = bind_tx_socket()?;
        let tx_ctx = TxContext {
            cfg: Arc::clone(&cfg),
            queue: Arc::clone(&tx_queue),
            source: Arc::new(PoolTxSource {
                cfg: Arc::clone(&cfg),
                pool: Arc::clone(&pool),
            }),
            running: Arc::clone(&running),
            sent: Arc::clone(&tx_sent),
            core: tx_core,
        };
        let tx_thread = std::thread::Builder::new()
            .name("tx".to_string())
            .spawn(move || run_tx_thread(tx_ctx, tx_socket))?;

        let master = Master::new(
            Arc::clone(&cfg),
            pool,
            rings,
            bus,
            request,
            tx_queue,
            Arc::clone(&running),
            decoded_tx,
            start,
            master_core,
        );
        let master = std::thread::Builder::new()
            .name("master".to_string())
            .spawn(move || master.run())?;

        info!(
            "runtime started: {} rx threads, {} workers, queue capacity {}",
            cfg.rx_threads, cfg.worker_threads, capacity
        );
        Ok(Self {
            cfg,
            running,
            rx_addrs,
            malformed,
            tx_sent,
            decoded_rx,
            master,
            workers,
            rx_threads,
            tx_thread,
        })
    }

    /// Addresses the receive threads actually bound (tests use port 0).
    pub fn rx_addrs(&self) -> &[SocketAddr] {
        &self.rx_addrs
    }

    /// The MAC-facing sink of decoded uplink frames.
    pub fn decoded(&self) -> &Receiver<DecodedFrame> {
        &self.decoded_rx
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Request shutdown; threads observe the flag at their loop heads.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Join every thread, write the timing files, and summarize.
    pub fn join(self) -> Result<RuntimeSummary, RuntimeError> {
        let master_result = self
            .master
            .join()
            .map_err(|_| RuntimeError::Thread("master panicked".into()))?;

        // The master may have stopped on its own (frames_to_process);
        // everyone else still needs the flag cleared
        self.running.store(false, Ordering::Relaxed);

        let mut worker_stats = Vec::with_capacity(self.workers.len());
        for handle in self.workers {
            worker_stats.push(
                handle
                    .join()
                    .map_err(|_| RuntimeError::Thread("worker panicked".into()))?,
            );
        }
        for handle in self.rx_threads {
            handle
                .join()
                .map_err(|_| RuntimeError::Thread("rx thread panicked".into()))?;
        }
        self.tx_thread
            .join()
            .map_err(|_| RuntimeError::Thread("tx thread panicked".into()))?;

        let report = match master_result {
            Ok(report) => report,
            Err(e) => {
                error!("master failed: {e}");
                return Err(e.into());
            }
        };

        let dir = PathBuf::from(&self.cfg.timestamp_dir);
        std::fs::create_dir_all(&dir)?;
        let timestamp_file = dir.join("frame_timestamps.csv");
        write_frame_timestamps(&timestamp_file, &report.records)?;
        if self.cfg.detailed_timing {
            write_worker_durations(&dir.join("worker_durations.csv"), &worker_stats)?;
        }

        info!(
            "runtime stopped: {} frames retired, {} tx packets",
            report.frames_retired,
            self.tx_sent.load(Ordering::Relaxed)
        );
        Ok(RuntimeSummary {
            frames_retired: report.frames_retired,
            late_packets: report.late_packets,
            dropped_out_of_window: report.dropped_out_of_window,
            malformed_packets: self.malformed.load(Ordering::Relaxed),
            tx_packets: self.tx_sent.load(Ordering::Relaxed),
            timestamp_file,
        })
    }
}

/// Big-station partitioning: worker tid -> stage group by the
/// configured per-stage thread counts. Dynamic mode puts everyone in
/// group 0.
fn worker_stage_group(cfg: &Config, tid: usize) -> usize {
    if !cfg.bigstation_mode {
        return 0;
    }
    let mut upper = 0;
    for (group, &count) in cfg.stage_threads.iter().enumerate() {
        upper += count;
        if tid < upper {
            return group;
        }
    }
    cfg.stage_threads.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_stage_groups() {
        let cfg = Config::from_json_str(
            r#"{
                "bigstation_mode": true,
                "worker_threads": 6,
                "fft_threads": 2, "zf_threads": 1, "demul_threads": 2, "decode_threads": 1
            }"#,
        )
        .unwrap();
        let groups: Vec<usize> = (0..6).map(|t| worker_stage_group(&cfg, t)).collect();
        assert_eq!(groups, vec![0, 0, 1, 2, 2, 3]);
    }

    #[test]
    fn test_dynamic_mode_single_group() {
        let cfg = Config::from_json_str("{}").unwrap();
        assert_eq!(worker_stage_group(&cfg, 0), 0);
        assert_eq!(worker_stage_group(&cfg, 3), 0);
    }
}
