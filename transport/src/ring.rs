//! Receive Packet Rings
//!
//! Each receive thread owns one fixed ring of packet landings. A
//! landing cycles Empty -> (rx writes) -> Full -> (a worker reads and
//! releases) -> Empty. The status word is the only synchronization:
//! the writer touches a landing only while it is Empty, readers only
//! while it is Full. Rx tags name (ring, landing) pairs.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

pub const LANDING_EMPTY: u8 = 0;
pub const LANDING_FULL: u8 = 1;

/// One receive thread's packet ring.
///
/// Backed by `UnsafeCell` bytes so views of different landings never
/// alias through an intermediate reference.
pub struct PacketRing {
    depth: usize,
    packet_bytes: usize,
    status: Vec<AtomicU8>,
    data: Box<[UnsafeCell<u8>]>,
}

// Access to `data` is serialized per landing by the status protocol.
unsafe impl Sync for PacketRing {}

impl PacketRing {
    pub fn new(depth: usize, packet_bytes: usize) -> Self {
        Self {
            depth,
            packet_bytes,
            status: (0..depth).map(|_| AtomicU8::new(LANDING_EMPTY)).collect(),
            data: (0..depth * packet_bytes).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True when the landing is free for the ring owner to write.
    pub fn is_landing_empty(&self, idx: usize) -> bool {
        self.status[idx].load(Ordering::Acquire) == LANDING_EMPTY
    }

    /// Mutable view of a landing's packet bytes.
    ///
    /// # Safety
    /// Only the ring-owning receive thread may call this, and only while
    /// the landing is Empty.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn landing_mut(&self, idx: usize) -> &mut [u8] {
        let base = idx * self.packet_bytes;
        std::slice::from_raw_parts_mut(self.data[base].get(), self.packet_bytes)
    }

    /// Hand a written landing to the consumers.
    pub fn publish(&self, idx: usize) {
        self.status[idx].store(LANDING_FULL, Ordering::Release);
    }

    /// Shared view of a Full landing's packet bytes. The master reads the
    /// header here; the FFT worker reads the payload and then releases.
    pub fn landing(&self, idx: usize) -> &[u8] {
        debug_assert_eq!(self.status[idx].load(Ordering::Acquire), LANDING_FULL);
        let base = idx * self.packet_bytes;
        unsafe { std::slice::from_raw_parts(self.data[base].get(), self.packet_bytes) }
    }

    /// Return a consumed landing to the ring owner.
    pub fn release(&self, idx: usize) {
        self.status[idx].store(LANDING_EMPTY, Ordering::Release);
    }
}
