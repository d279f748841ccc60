//! Single-producer, single-consumer ring buffer (spec.md §4.6, component F).
//!
//! With exactly one producer there's no need for the CAS loop the
//! many-to-one variant uses to advance `tail` — a plain read followed by a
//! release store is enough, since nothing else is racing to move it. The
//! producer also zeroes the 8 bytes immediately after its own record so a
//! consumer that walks past the end of what's been published sees a clean
//! zero sentinel rather than stale bytes from a previous lap of the buffer.

use crate::concurrent::ring_buffer::{self, buffer_descriptor, ControlledReadAction, Layout};
use crate::concurrent::{record_descriptor, AtomicBuffer};
use crate::util::bit;
use crate::util::{IndexT, IpcError, Result};

/// Smallest legal data-region capacity (trailer excluded) for this variant.
pub const MIN_CAPACITY: IndexT = 16;

/// Single-producer, single-consumer ring buffer implementation.
pub struct OneToOneRingBuffer<A>
where
    A: AtomicBuffer,
{
    buffer: A,
    layout: Layout,
}

impl<A> OneToOneRingBuffer<A>
where
    A: AtomicBuffer,
{
    /// Wrap an existing buffer as a one-to-one ring buffer. The buffer's
    /// total length must be `capacity + TRAILER_LENGTH` with `capacity` a
    /// power of two `>= MIN_CAPACITY`.
    pub fn new(buffer: A) -> Result<Self> {
        let layout = Layout::new(buffer.capacity(), MIN_CAPACITY)?;
        Ok(OneToOneRingBuffer { buffer, layout })
    }

    /// Total number of bytes available for records (trailer excluded).
    pub fn capacity(&self) -> IndexT {
        self.layout.capacity
    }

    /// Largest payload `write`/`tryClaim` will accept.
    pub fn max_msg_length(&self) -> IndexT {
        self.layout.max_msg_length
    }

    /// Atomically fetch-and-increment a correlation id.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer.get_and_add_i64(self.layout.correlation_counter_index, 1).expect("offset computed at construction")
    }

    /// Current producer (tail) position.
    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.layout.tail_position_index).expect("offset computed at construction")
    }

    /// Current consumer (head) position.
    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.layout.head_position_index).expect("offset computed at construction")
    }

    /// Last heartbeat timestamp recorded by the consumer, in epoch milliseconds.
    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.buffer.get_i64_volatile(self.layout.consumer_heartbeat_index).expect("offset computed at construction")
    }

    /// Record a consumer heartbeat timestamp, in epoch milliseconds.
    pub fn set_consumer_heartbeat_time(&self, now_ms: i64) {
        self.buffer
            .put_i64_ordered(self.layout.consumer_heartbeat_index, now_ms)
            .expect("offset computed at construction");
    }

    /// Write a message into the ring buffer. Returns `Ok(false)` rather than
    /// an error when there isn't enough space. Must only ever be called by
    /// one producer thread at a time; the data race that would result from
    /// two callers racing here is exactly what the many-to-one variant's CAS
    /// loop exists to prevent.
    pub fn write<B>(&self, msg_type_id: i32, source: &B, source_index: IndexT, length: IndexT) -> Result<bool>
    where
        B: AtomicBuffer,
    {
        record_descriptor::check_type_id(msg_type_id)?;
        self.layout.check_msg_length(length)?;

        let record_len = length + record_descriptor::HEADER_LENGTH;
        let required = bit::align(record_len as usize, record_descriptor::ALIGNMENT as usize) as IndexT;

        let record_index = self.claim_capacity(required)?;
        if record_index == record_descriptor::INSUFFICIENT_CAPACITY {
            return Ok(false);
        }

        self.buffer.put_i64_ordered(record_index, record_descriptor::make_header(-record_len, msg_type_id))?;
        self.buffer.put_bytes(record_descriptor::encoded_msg_offset(record_index), source, source_index, length)?;
        self.buffer.put_i32_ordered(record_descriptor::length_offset(record_index), record_len)?;

        self.zero_next_sentinel(record_index, required)?;

        Ok(true)
    }

    /// Reserve space for a `length`-byte message without writing it. Returns
    /// the byte offset at which the caller should write its payload, or
    /// [`record_descriptor::INSUFFICIENT_CAPACITY`] if there isn't room. The
    /// claim must be finished with [`OneToOneRingBuffer::commit`] or
    /// [`OneToOneRingBuffer::abort`].
    pub fn try_claim(&self, msg_type_id: i32, length: IndexT) -> Result<IndexT> {
        record_descriptor::check_type_id(msg_type_id)?;
        self.layout.check_msg_length(length)?;

        let record_len = length + record_descriptor::HEADER_LENGTH;
        let required = bit::align(record_len as usize, record_descriptor::ALIGNMENT as usize) as IndexT;

        let record_index = self.claim_capacity(required)?;
        if record_index == record_descriptor::INSUFFICIENT_CAPACITY {
            return Ok(record_descriptor::INSUFFICIENT_CAPACITY);
        }

        self.buffer.put_i64_ordered(record_index, record_descriptor::make_header(-record_len, msg_type_id))?;
        self.zero_next_sentinel(record_index, required)?;
        Ok(record_descriptor::encoded_msg_offset(record_index))
    }

    /// Publish a record previously reserved with [`OneToOneRingBuffer::try_claim`].
    pub fn commit(&self, index: IndexT) -> Result<()> {
        let record_index = self.record_index_for_claim(index)?;
        let length = self.buffer.get_i32(record_descriptor::length_offset(record_index))?;
        if length >= 0 {
            return Err(IpcError::StateProtocol);
        }
        self.buffer.put_i32_ordered(record_descriptor::length_offset(record_index), -length)
    }

    /// Abandon a record previously reserved with [`OneToOneRingBuffer::try_claim`].
    /// The slot becomes a padding record the consumer silently skips.
    pub fn abort(&self, index: IndexT) -> Result<()> {
        let record_index = self.record_index_for_claim(index)?;
        let length = self.buffer.get_i32(record_descriptor::length_offset(record_index))?;
        if length >= 0 {
            return Err(IpcError::StateProtocol);
        }
        self.buffer.put_i32(record_descriptor::type_offset(record_index), record_descriptor::PADDING_MSG_TYPE_ID)?;
        self.buffer.put_i32_ordered(record_descriptor::length_offset(record_index), -length)
    }

    fn record_index_for_claim(&self, index: IndexT) -> Result<IndexT> {
        let record_index = index - record_descriptor::HEADER_LENGTH;
        if record_index < 0 || record_index >= self.layout.capacity {
            return Err(IpcError::ArgBounds);
        }
        Ok(record_index)
    }

    /// Drain up to `limit` completed records, skipping padding, into `handler`.
    pub fn read<F>(&self, handler: F, limit: usize) -> Result<usize>
    where
        F: FnMut(i32, &[u8]),
    {
        // Unlike the many-to-one variant, the consumer does not zero the
        // span it just drained: with a single producer there's no risk of a
        // racing writer leaving a reservation behind for `unblock` to find,
        // so there's nothing for the zero-fill to protect against here.
        ring_buffer::read(&self.buffer, &self.layout, handler, limit, false)
    }

    /// As [`OneToOneRingBuffer::read`], with a handler that can abort or
    /// eagerly commit (see [`ControlledReadAction`]).
    pub fn controlled_read<F>(&self, handler: F, limit: usize) -> Result<usize>
    where
        F: FnMut(i32, &[u8]) -> ControlledReadAction,
    {
        ring_buffer::controlled_read(&self.buffer, &self.layout, handler, limit)
    }

    /// Always returns `false`: with a single producer there is no other
    /// writer that could have stalled mid-reservation for this to repair.
    pub fn unblock(&self) -> Result<bool> {
        Ok(false)
    }

    /// Reserve `required` bytes in the data region. The producer reads
    /// `tail` plainly (nothing else writes it) and publishes the new value
    /// with a release store once it knows there's room.
    fn claim_capacity(&self, required: IndexT) -> Result<IndexT> {
        let mask = self.layout.mask;

        let tail = self.buffer.get_i64(self.layout.tail_position_index)?;
        let mut head = self.buffer.get_i64_volatile(self.layout.head_cache_position_index)?;

        let tail_index = (tail & i64::from(mask)) as IndexT;
        let to_buffer_end_length = self.layout.capacity - tail_index;
        let mut padding: IndexT = 0;
        let mut write_index = tail_index;

        if required > to_buffer_end_length {
            let mut head_index = (head & i64::from(mask)) as IndexT;

            if required > head_index {
                head = self.buffer.get_i64_volatile(self.layout.head_position_index)?;
                head_index = (head & i64::from(mask)) as IndexT;

                if required > head_index {
                    return Ok(record_descriptor::INSUFFICIENT_CAPACITY);
                }

                self.buffer.put_i64_ordered(self.layout.head_cache_position_index, head)?;
            }

            padding = to_buffer_end_length;
            write_index = 0;
        } else {
            let available_capacity = self.layout.capacity - (tail - head) as IndexT;
            if required > available_capacity {
                head = self.buffer.get_i64_volatile(self.layout.head_position_index)?;
                if required > (self.layout.capacity - (tail - head) as IndexT) {
                    return Ok(record_descriptor::INSUFFICIENT_CAPACITY);
                }
                self.buffer.put_i64_ordered(self.layout.head_cache_position_index, head)?;
            }
        }

        if padding != 0 {
            self.buffer.put_i64_ordered(tail_index, record_descriptor::make_header(padding, record_descriptor::PADDING_MSG_TYPE_ID))?;
        }

        self.buffer.put_i64_ordered(self.layout.tail_position_index, tail + i64::from(required) + i64::from(padding))?;

        Ok(write_index)
    }

    /// Zero the 8-byte header immediately following the record just written,
    /// if it lies within the data region, so a consumer that catches up to
    /// this point sees a clean "not ready yet" sentinel rather than leftover
    /// bytes from the buffer's previous lap.
    fn zero_next_sentinel(&self, record_index: IndexT, required: IndexT) -> Result<()> {
        let next_index = record_index + required;
        if next_index < self.layout.capacity {
            self.buffer.set_memory(next_index, record_descriptor::HEADER_LENGTH as usize, 0)?;
        }
        Ok(())
    }
}
