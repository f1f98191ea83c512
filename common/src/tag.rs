//! Task Tags
//!
//! A `Tag` packs the identity of one unit of work into a single 64-bit
//! word: it is the payload of every event and the only handle that
//! crosses threads. Buffers are addressed from the tag, never the other
//! way around.
//!
//! Bit layout (little-endian fields inside the word):
//!
//! ```text
//! bits  0..32   frame_id
//! bits 32..44   symbol_id
//! bits 44..60   index (antenna / subcarrier block / codeblock / user)
//! ```
//!
//! The shape of a tag (which fields are meaningful) is implied by the
//! event kind that carries it, never by inspecting the tag itself.

use thiserror::Error;

const FRAME_BITS: u32 = 32;
const SYMBOL_BITS: u32 = 12;
const INDEX_BITS: u32 = 16;

const SYMBOL_SHIFT: u32 = FRAME_BITS;
const INDEX_SHIFT: u32 = FRAME_BITS + SYMBOL_BITS;

const SYMBOL_MAX: u64 = (1 << SYMBOL_BITS) - 1;
const INDEX_MAX: u64 = (1 << INDEX_BITS) - 1;

/// Receive-ring tags use a separate layout: the ring owner thread in the
/// low byte, the landing offset above it.
const RX_TID_BITS: u32 = 8;
const RX_TID_MAX: u64 = (1 << RX_TID_BITS) - 1;
const RX_OFFSET_BITS: u32 = 24;
const RX_OFFSET_MAX: u64 = (1 << RX_OFFSET_BITS) - 1;

/// Errors raised when packing a tag.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TagError {
    #[error("tag field overflow: {field} = {value} exceeds {max}")]
    Overflow {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

/// Packed identity of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

impl Tag {
    /// (frame, symbol): used where no third field applies.
    pub fn frame_symbol(frame_id: u32, symbol_id: usize) -> Result<Self, TagError> {
        Self::pack(frame_id, symbol_id, 0, "symbol_id")
    }

    /// (frame, symbol, antenna): FFT and IFFT tasks.
    pub fn frame_symbol_antenna(
        frame_id: u32,
        symbol_id: usize,
        antenna_id: usize,
    ) -> Result<Self, TagError> {
        Self::check_index("antenna_id", antenna_id)?;
        Self::pack(frame_id, symbol_id, antenna_id, "symbol_id")
    }

    /// (frame, subcarrier block): ZF tasks.
    pub fn frame_sc_block(frame_id: u32, block_id: usize) -> Result<Self, TagError> {
        Self::check_index("block_id", block_id)?;
        Self::pack(frame_id, 0, block_id, "symbol_id")
    }

    /// (frame, symbol, subcarrier block): Demul and Precode tasks.
    pub fn frame_symbol_block(
        frame_id: u32,
        symbol_id: usize,
        block_id: usize,
    ) -> Result<Self, TagError> {
        Self::check_index("block_id", block_id)?;
        Self::pack(frame_id, symbol_id, block_id, "symbol_id")
    }

    /// (frame, symbol, codeblock): Decode and Encode tasks. The codeblock
    /// index spans all users: cb = ue * blocks_per_ue + block.
    pub fn frame_symbol_codeblock(
        frame_id: u32,
        symbol_id: usize,
        codeblock_id: usize,
    ) -> Result<Self, TagError> {
        Self::check_index("codeblock_id", codeblock_id)?;
        Self::pack(frame_id, symbol_id, codeblock_id, "symbol_id")
    }

    /// (frame, symbol, user): per-user addressing on the downlink.
    pub fn frame_symbol_user(
        frame_id: u32,
        symbol_id: usize,
        ue_id: usize,
    ) -> Result<Self, TagError> {
        Self::check_index("ue_id", ue_id)?;
        Self::pack(frame_id, symbol_id, ue_id, "symbol_id")
    }

    /// (rx thread, ring offset): names a landing in a receive ring.
    pub fn rx(tid: usize, offset: usize) -> Result<Self, TagError> {
        if tid as u64 > RX_TID_MAX {
            return Err(TagError::Overflow {
                field: "tid",
                value: tid as u64,
                max: RX_TID_MAX,
            });
        }
        if offset as u64 > RX_OFFSET_MAX {
            return Err(TagError::Overflow {
                field: "offset",
                value: offset as u64,
                max: RX_OFFSET_MAX,
            });
        }
        Ok(Tag((tid as u64) | ((offset as u64) << RX_TID_BITS)))
    }

    pub fn frame_id(&self) -> u32 {
        (self.0 & ((1u64 << FRAME_BITS) - 1)) as u32
    }

    pub fn symbol_id(&self) -> usize {
        ((self.0 >> SYMBOL_SHIFT) & SYMBOL_MAX) as usize
    }

    pub fn antenna_id(&self) -> usize {
        self.index()
    }

    pub fn block_id(&self) -> usize {
        self.index()
    }

    pub fn codeblock_id(&self) -> usize {
        self.index()
    }

    pub fn ue_id(&self) -> usize {
        self.index()
    }

    /// Ring owner thread of an rx tag.
    pub fn rx_tid(&self) -> usize {
        (self.0 & RX_TID_MAX) as usize
    }

    /// Ring landing offset of an rx tag.
    pub fn rx_offset(&self) -> usize {
        ((self.0 >> RX_TID_BITS) & RX_OFFSET_MAX) as usize
    }

    fn index(&self) -> usize {
        ((self.0 >> INDEX_SHIFT) & INDEX_MAX) as usize
    }

    fn check_index(field: &'static str, value: usize) -> Result<(), TagError> {
        if value as u64 > INDEX_MAX {
            return Err(TagError::Overflow {
                field,
                value: value as u64,
                max: INDEX_MAX,
            });
        }
        Ok(())
    }

    fn pack(
        frame_id: u32,
        symbol_id: usize,
        index: usize,
        symbol_field: &'static str,
    ) -> Result<Self, TagError> {
        if symbol_id as u64 > SYMBOL_MAX {
            return Err(TagError::Overflow {
                field: symbol_field,
                value: symbol_id as u64,
                max: SYMBOL_MAX,
            });
        }
        Ok(Tag(
            (frame_id as u64)
                | ((symbol_id as u64) << SYMBOL_SHIFT)
                | ((index as u64) << INDEX_SHIFT),
        ))
    }
}
