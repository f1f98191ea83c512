//! Common Utilities
//!
//! Thread placement helpers and the small bit/IQ conversions shared by
//! the transport and kernel layers.

use crate::types::ThreadType;
use bytes::{BufMut, Bytes, BytesMut};
use num_complex::Complex32;
use thiserror::Error;
use tracing::{info, warn};

/// IQ samples are fixed-point int16 on the wire with this full scale.
pub const IQ_SCALE: f32 = 32768.0;

#[derive(Error, Debug)]
pub enum PinError {
    #[error("{thread} thread {index}: failed to pin to core {core}")]
    PinFailed {
        thread: &'static str,
        index: usize,
        core: usize,
    },
}

/// Pin the calling thread to `core_offset + thread_index`.
///
/// The layout is role-ordered: the caller passes the first core of its
/// role's range. When `strict` is false a failed pin degrades to a
/// warning so the system can run on machines with few cores.
pub fn pin_to_core_with_offset(
    thread_type: ThreadType,
    core_offset: usize,
    thread_index: usize,
    strict: bool,
) -> Result<(), PinError> {
    let cores = available_cores();
    // Wrap instead of failing outright when the layout exceeds the machine
    let core = (core_offset + thread_index) % cores.max(1);

    if set_affinity(core) {
        info!(
            "{} thread {} pinned to core {}",
            thread_type.as_str(),
            thread_index,
            core
        );
        Ok(())
    } else if strict {
        Err(PinError::PinFailed {
            thread: thread_type.as_str(),
            index: thread_index,
            core,
        })
    } else {
        warn!(
            "{} thread {}: failed to pin to core {}, continuing unpinned",
            thread_type.as_str(),
            thread_index,
            core
        );
        Ok(())
    }
}

/// Number of online cores.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn set_affinity(core: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        if core >= libc::CPU_SETSIZE as usize {
            return false;
        }
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_core: usize) -> bool {
    false
}

/// Convert float IQ to the wire's interleaved int16 representation.
pub fn cfloat_to_ci16(samples: &[Complex32]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.push(quantize(s.re));
        out.push(quantize(s.im));
    }
    out
}

/// Convert interleaved int16 IQ back to floats.
pub fn ci16_to_cfloat(iq: &[i16]) -> Vec<Complex32> {
    iq.chunks_exact(2)
        .map(|p| Complex32::new(p[0] as f32 / IQ_SCALE, p[1] as f32 / IQ_SCALE))
        .collect()
}

fn quantize(v: f32) -> i16 {
    (v * IQ_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Pack bits into bytes (MSB first).
pub fn pack_bits(bits: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);
    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit != 0 {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }
    bytes.freeze()
}

/// Unpack bytes into bits (MSB first).
pub fn unpack_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte >> (7 - i)) & 1);
        }
    }
    bits
}
