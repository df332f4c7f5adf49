//! Entity identifier encoding.
//!
//! `buffer_id` packs the creator's process slot into its high byte so a
//! reclaim pass can tell which process a leaked buffer belonged to without
//! a secondary lookup (spec: high 8 bits = creator process slot, remaining
//! 56 bits = monotonic counter).

/// Slot index into the process table (0..MAX_PROCESSES).
pub type ProcessSlot = u32;

/// Slot index into the block table (0..MAX_BLOCKS).
pub type BlockSlot = u32;

/// Opaque block identifier, unique for the lifetime of the registry.
pub type BlockId = u64;

/// Opaque connection identifier.
pub type ConnectionId = u64;

/// Opaque buffer identifier. See [`BufferId`] for the encoding helpers.
pub type RawBufferId = u64;

const CREATOR_SLOT_SHIFT: u32 = 56;
const COUNTER_MASK: u64 = (1u64 << CREATOR_SLOT_SHIFT) - 1;

/// Helpers for packing/unpacking a `buffer_id`'s creator-slot and counter.
pub struct BufferId;

impl BufferId {
    /// Encode a buffer id from a creator process slot and a monotonic counter.
    ///
    /// Only the low 8 bits of `creator_slot` are kept; `MAX_PROCESSES` is far
    /// below 256 so this never truncates a valid slot.
    pub const fn encode(creator_slot: ProcessSlot, counter: u64) -> RawBufferId {
        ((creator_slot as u64 & 0xFF) << CREATOR_SLOT_SHIFT) | (counter & COUNTER_MASK)
    }

    /// Extract the creator process slot from a buffer id.
    pub const fn creator_slot(buffer_id: RawBufferId) -> ProcessSlot {
        (buffer_id >> CREATOR_SLOT_SHIFT) as ProcessSlot
    }

    /// Extract the monotonic counter portion of a buffer id.
    pub const fn counter(buffer_id: RawBufferId) -> u64 {
        buffer_id & COUNTER_MASK
    }

    /// Low 32 bits, used as the hash-index key in the buffer metadata table.
    pub const fn hash_key(buffer_id: RawBufferId) -> u32 {
        buffer_id as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let id = BufferId::encode(7, 123_456);
        assert_eq!(BufferId::creator_slot(id), 7);
        assert_eq!(BufferId::counter(id), 123_456);
    }

    #[test]
    fn creator_slot_occupies_high_byte() {
        let id = BufferId::encode(0xFF, 0);
        assert_eq!(id >> CREATOR_SLOT_SHIFT, 0xFF);
    }

    #[test]
    fn counter_does_not_bleed_into_creator_slot() {
        let id = BufferId::encode(3, COUNTER_MASK);
        assert_eq!(BufferId::creator_slot(id), 3);
        assert_eq!(BufferId::counter(id), COUNTER_MASK);
    }
}
