//! Timing Statistics
//!
//! Two collaborating records: per-worker per-stage duration
//! accumulators (three sub-phases: wait, work, write-back) filled
//! locally by each worker and merged at shutdown, and the master's
//! per-frame timeline of stage completion times. Both are written as
//! CSV at shutdown, microseconds with three decimals.

use common::event::EventKind;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Compute stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageId {
    Fft,
    Zf,
    Demul,
    Decode,
    Encode,
    Precode,
    Ifft,
}

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::Fft,
        StageId::Zf,
        StageId::Demul,
        StageId::Decode,
        StageId::Encode,
        StageId::Precode,
        StageId::Ifft,
    ];

    pub fn from_request(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Fft => Some(StageId::Fft),
            EventKind::Zf => Some(StageId::Zf),
            EventKind::Demul => Some(StageId::Demul),
            EventKind::Decode => Some(StageId::Decode),
            EventKind::Encode => Some(StageId::Encode),
            EventKind::Precode => Some(StageId::Precode),
            EventKind::Ifft => Some(StageId::Ifft),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageId::Fft => "fft",
            StageId::Zf => "zf",
            StageId::Demul => "demul",
            StageId::Decode => "decode",
            StageId::Encode => "encode",
            StageId::Precode => "precode",
            StageId::Ifft => "ifft",
        }
    }
}

/// Accumulated durations for one (worker, stage) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationStat {
    pub count: u64,
    pub wait_us: f64,
    pub work_us: f64,
    pub writeback_us: f64,
}

/// One worker's accumulators, returned when the worker joins.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub tid: usize,
    pub per_stage: [DurationStat; 7],
}

impl WorkerStats {
    pub fn new(tid: usize) -> Self {
        Self {
            tid,
            per_stage: [DurationStat::default(); 7],
        }
    }

    pub fn record(&mut self, stage: StageId, wait: Duration, work: Duration, writeback: Duration) {
        let s = &mut self.per_stage[stage.index()];
        s.count += 1;
        s.wait_us += wait.as_secs_f64() * 1e6;
        s.work_us += work.as_secs_f64() * 1e6;
        s.writeback_us += writeback.as_secs_f64() * 1e6;
    }

    pub fn tasks(&self) -> u64 {
        self.per_stage.iter().map(|s| s.count).sum()
    }
}

/// Stage completion times for the frame occupying one slot, relative to
/// runtime start. NaN marks a stage the frame does not have.
#[derive(Debug, Clone, Copy)]
pub struct SlotTimeline {
    pub start_us: f64,
    pub fft_us: f64,
    pub zf_us: f64,
    pub demul_us: f64,
    pub decode_us: f64,
    pub encode_us: f64,
    pub precode_us: f64,
    pub ifft_us: f64,
}

impl Default for SlotTimeline {
    fn default() -> Self {
        Self {
            start_us: f64::NAN,
            fft_us: f64::NAN,
            zf_us: f64::NAN,
            demul_us: f64::NAN,
            decode_us: f64::NAN,
            encode_us: f64::NAN,
            precode_us: f64::NAN,
            ifft_us: f64::NAN,
        }
    }
}

/// One retired frame's timeline.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub frame_id: u32,
    pub timeline: SlotTimeline,
    pub retire_us: f64,
}

fn cell(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        format!("{v:.3}")
    }
}

/// Write the per-frame master timestamps CSV.
pub fn write_frame_timestamps(path: &Path, records: &[FrameRecord]) -> std::io::Result<()> {
    let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(
        f,
        "frame,start_us,fft_us,zf_us,demul_us,decode_us,encode_us,precode_us,ifft_us,retire_us"
    )?;
    for r in records {
        let t = &r.timeline;
        writeln!(
            f,
            "{},{},{},{},{},{},{},{},{},{}",
            r.frame_id,
            cell(t.start_us),
            cell(t.fft_us),
            cell(t.zf_us),
            cell(t.demul_us),
            cell(t.decode_us),
            cell(t.encode_us),
            cell(t.precode_us),
            cell(t.ifft_us),
            cell(r.retire_us),
        )?;
    }
    Ok(())
}

/// Write the per-worker per-stage duration breakdown CSV.
pub fn write_worker_durations(path: &Path, stats: &[WorkerStats]) -> std::io::Result<()> {
    let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(f, "worker,stage,tasks,wait_us,work_us,writeback_us")?;
    for ws in stats {
        for stage in StageId::ALL {
            let s = &ws.per_stage[stage.index()];
            if s.count == 0 {
                continue;
            }
            writeln!(
                f,
                "{},{},{},{:.3},{:.3},{:.3}",
                ws.tid,
                stage.name(),
                s.count,
                s.wait_us,
                s.work_us,
                s.writeback_us
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut ws = WorkerStats::new(0);
        ws.record(
            StageId::Fft,
            Duration::from_micros(5),
            Duration::from_micros(20),
            Duration::from_micros(1),
        );
        ws.record(
            StageId::Fft,
            Duration::from_micros(5),
            Duration::from_micros(30),
            Duration::from_micros(1),
        );
        let s = &ws.per_stage[StageId::Fft.index()];
        assert_eq!(s.count, 2);
        assert!((s.work_us - 50.0).abs() < 1e-6);
        assert_eq!(ws.tasks(), 2);
    }

    #[test]
    fn test_timestamp_file_round_trip() {
        let dir = std::env::temp_dir().join("baseband_stats_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frame_timestamps.csv");

        let mut timeline = SlotTimeline::default();
        timeline.start_us = 12.3456;
        timeline.fft_us = 100.0;
        let records = vec![FrameRecord {
            frame_id: 3,
            timeline,
            retire_us: 250.5,
        }];
        write_frame_timestamps(&path, &records).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("frame,start_us"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("3,12.346,100.000,"));
        assert!(row.ends_with(",250.500"));
    }
}
