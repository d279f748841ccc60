//! Shared ring-buffer contract (spec.md §4.4, component D): the trailer
//! layout both ring-buffer variants use, the `ControlledReadAction` the
//! consumer's handler can return, and the `read`/`controlledRead` walk that
//! is identical for the MPSC and SPSC variants modulo one flag (whether the
//! consumer zero-fills the span it just drained).
//!
//! The MPSC and SPSC ring buffers differ only in how a producer reserves
//! space in the tail (CAS loop vs. a plain read + ordered store) — that part
//! stays in `mpsc_ring_buffer` and `spsc_ring_buffer` respectively.

use std::panic::{self, AssertUnwindSafe};

use crate::concurrent::record_descriptor;
use crate::concurrent::AtomicBuffer;
use crate::util::bit::{self, CACHE_LINE_LENGTH};
use crate::util::{IndexT, IpcError, Result};

/// Layout of the ring-buffer trailer, appended after the power-of-two data
/// region.
pub mod buffer_descriptor {
    use super::CACHE_LINE_LENGTH;
    use crate::util::bit::is_power_of_two;
    use crate::util::{IndexT, IpcError, Result};

    /// Offset (past the end of the data region) of the tail position.
    pub const TAIL_POSITION_OFFSET: IndexT = (CACHE_LINE_LENGTH * 2) as IndexT;
    /// Offset of the producer-private cache of the last observed head.
    pub const HEAD_CACHE_POSITION_OFFSET: IndexT = (CACHE_LINE_LENGTH * 4) as IndexT;
    /// Offset of the head position, advanced only by the consumer.
    pub const HEAD_POSITION_OFFSET: IndexT = (CACHE_LINE_LENGTH * 6) as IndexT;
    /// Offset of the correlation id counter.
    pub const CORRELATION_COUNTER_OFFSET: IndexT = (CACHE_LINE_LENGTH * 8) as IndexT;
    /// Offset of the consumer heartbeat timestamp.
    pub const CONSUMER_HEARTBEAT_OFFSET: IndexT = (CACHE_LINE_LENGTH * 10) as IndexT;
    /// Total size of the trailer. Each field above sits on its own cache
    /// line with a spare line between it and its neighbor, so that
    /// concurrent access to one never false-shares with another.
    pub const TRAILER_LENGTH: IndexT = (CACHE_LINE_LENGTH * 12) as IndexT;

    /// Validate that `capacity` (the data region, trailer excluded) is a
    /// power of two no smaller than `min_capacity`.
    pub fn check_capacity(capacity: IndexT, min_capacity: IndexT) -> Result<()> {
        if capacity >= min_capacity && is_power_of_two(capacity) {
            Ok(())
        } else {
            Err(IpcError::CapacityShape)
        }
    }
}

/// Outcome a `controlledRead` handler returns for each record it's shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlledReadAction {
    /// Keep going; behaves like [`ControlledReadAction::Continue`] plus
    /// an immediate flush of the consumer's head position, up to and
    /// including this record.
    Commit,
    /// Keep going without flushing the head position yet.
    Continue,
    /// Stop. The head position is not advanced past this record (or any
    /// record after the last `Commit`), so a future `read`/`controlledRead`
    /// call will see it again.
    Abort,
}

/// Fields common to both ring-buffer variants, derived once at construction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub capacity: IndexT,
    pub mask: IndexT,
    pub max_msg_length: IndexT,
    pub tail_position_index: IndexT,
    pub head_cache_position_index: IndexT,
    pub head_position_index: IndexT,
    pub correlation_counter_index: IndexT,
    pub consumer_heartbeat_index: IndexT,
}

impl Layout {
    pub fn new(total_capacity: IndexT, min_capacity: IndexT) -> Result<Self> {
        let capacity = total_capacity - buffer_descriptor::TRAILER_LENGTH;
        buffer_descriptor::check_capacity(capacity, min_capacity)?;
        Ok(Layout {
            capacity,
            mask: capacity - 1,
            max_msg_length: capacity / 8,
            tail_position_index: capacity + buffer_descriptor::TAIL_POSITION_OFFSET,
            head_cache_position_index: capacity + buffer_descriptor::HEAD_CACHE_POSITION_OFFSET,
            head_position_index: capacity + buffer_descriptor::HEAD_POSITION_OFFSET,
            correlation_counter_index: capacity + buffer_descriptor::CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat_index: capacity + buffer_descriptor::CONSUMER_HEARTBEAT_OFFSET,
        })
    }

    pub fn check_msg_length(&self, length: IndexT) -> Result<()> {
        record_descriptor::check_msg_length(length, self.max_msg_length)
    }
}

/// Drain up to `limit` completed records starting at the consumer's current
/// head, handing each `(typeId, payload)` pair to `handler`. Padding records
/// are skipped silently. Stops early at the end of the buffer's contiguous
/// span (a wrapped read resumes on the next call) or at the first
/// not-yet-committed record.
///
/// If `handler` panics, the panic is propagated to the caller only after the
/// head position has been advanced past every record delivered so far,
/// including the one that panicked — mirroring the reference semantics
/// where a thrown handler exception still leaves the consumer's position
/// consistent (spec.md §7).
pub(crate) fn read<A, F>(
    buffer: &A,
    layout: &Layout,
    mut handler: F,
    limit: usize,
    zero_on_consume: bool,
) -> Result<usize>
where
    A: AtomicBuffer,
    F: FnMut(i32, &[u8]),
{
    let head = buffer.get_i64(layout.head_position_index)?;
    let head_index = (head & i64::from(layout.mask)) as IndexT;
    let contiguous_block_length = layout.capacity - head_index;

    let mut messages_read = 0usize;
    let mut bytes_read: IndexT = 0;
    let mut panic_payload = None;

    while bytes_read < contiguous_block_length && messages_read < limit {
        let record_index = head_index + bytes_read;
        let length = buffer.get_i32_acquire(record_descriptor::length_offset(record_index))?;
        if length <= 0 {
            break;
        }

        bytes_read += bit::align(length as usize, record_descriptor::ALIGNMENT as usize) as IndexT;

        let type_id = buffer.get_i32(record_descriptor::type_offset(record_index))?;
        if type_id == record_descriptor::PADDING_MSG_TYPE_ID {
            continue;
        }

        messages_read += 1;
        let start = record_descriptor::encoded_msg_offset(record_index) as usize;
        let end = start + (length - record_descriptor::HEADER_LENGTH) as usize;
        let slice = &buffer[start..end];
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(type_id, slice))) {
            panic_payload = Some(payload);
            break;
        }
    }

    if bytes_read != 0 {
        if zero_on_consume {
            buffer.set_memory(head_index, bytes_read as usize, 0)?;
        }
        buffer.put_i64_ordered(layout.head_position_index, head + i64::from(bytes_read))?;
    }

    match panic_payload {
        Some(payload) => panic::resume_unwind(payload),
        None => Ok(messages_read),
    }
}

/// As [`read`], but `handler` chooses per-record whether to keep scanning,
/// commit (flush the head position immediately, including this record), or
/// abort (stop without advancing past this record).
///
/// `bytes_read` accumulates for every record walked — padding, `Continue`,
/// and `Commit` alike — exactly as the plain `read` walk does; `Commit`
/// additionally flushes it early, and `Abort` backs the just-scanned
/// record's length back out before stopping. The trailing span is always
/// flushed once more after the loop, so a handler that only ever returns
/// `Continue` still advances the head past everything it was shown, instead
/// of leaving `Commit`-only bookkeeping to do it.
pub(crate) fn controlled_read<A, F>(
    buffer: &A,
    layout: &Layout,
    mut handler: F,
    limit: usize,
) -> Result<usize>
where
    A: AtomicBuffer,
    F: FnMut(i32, &[u8]) -> ControlledReadAction,
{
    let head = buffer.get_i64(layout.head_position_index)?;
    let head_index = (head & i64::from(layout.mask)) as IndexT;
    let contiguous_block_length = layout.capacity - head_index;

    let mut messages_read = 0usize;
    let mut bytes_read: IndexT = 0;
    let mut panic_payload = None;

    while bytes_read < contiguous_block_length && messages_read < limit {
        let record_index = head_index + bytes_read;
        let length = buffer.get_i32_acquire(record_descriptor::length_offset(record_index))?;
        if length <= 0 {
            break;
        }
        let aligned = bit::align(length as usize, record_descriptor::ALIGNMENT as usize) as IndexT;
        bytes_read += aligned;

        let type_id = buffer.get_i32(record_descriptor::type_offset(record_index))?;
        if type_id == record_descriptor::PADDING_MSG_TYPE_ID {
            continue;
        }

        let start = record_descriptor::encoded_msg_offset(record_index) as usize;
        let end = start + (length - record_descriptor::HEADER_LENGTH) as usize;
        let slice = &buffer[start..end];

        match panic::catch_unwind(AssertUnwindSafe(|| handler(type_id, slice))) {
            Ok(ControlledReadAction::Abort) => {
                bytes_read -= aligned;
                break;
            }
            Ok(ControlledReadAction::Continue) => {
                messages_read += 1;
            }
            Ok(ControlledReadAction::Commit) => {
                messages_read += 1;
                buffer.put_i64_ordered(layout.head_position_index, head + i64::from(bytes_read))?;
            }
            Err(payload) => {
                panic_payload = Some(payload);
                break;
            }
        }
    }

    if bytes_read != 0 {
        buffer.put_i64_ordered(layout.head_position_index, head + i64::from(bytes_read))?;
    }

    match panic_payload {
        Some(payload) => panic::resume_unwind(payload),
        None => Ok(messages_read),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_must_be_power_of_two() {
        assert_eq!(buffer_descriptor::check_capacity(17, 8), Err(IpcError::CapacityShape));
        assert!(buffer_descriptor::check_capacity(16, 8).is_ok());
    }

    #[test]
    fn capacity_must_meet_minimum() {
        assert_eq!(buffer_descriptor::check_capacity(4, 8), Err(IpcError::CapacityShape));
    }
}
