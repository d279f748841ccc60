//! Multi-producer, single-consumer ring buffer (spec.md §4.5, component E).
//!
//! Producers advance the shared tail with a compare-and-swap loop rather
//! than a plain store, since more than one of them may be racing to reserve
//! space at once. A producer that wins the CAS is solely responsible for
//! writing both its own record header and any padding record the wrap
//! required — every other producer's CAS simply failed and retried.

use crate::concurrent::ring_buffer::{self, buffer_descriptor, ControlledReadAction, Layout};
use crate::concurrent::{record_descriptor, AtomicBuffer};
use crate::util::bit;
use crate::util::{IndexT, IpcError, Result};

/// Smallest legal data-region capacity (trailer excluded) for this variant.
pub const MIN_CAPACITY: IndexT = 8;

/// Multi-producer, single-consumer ring buffer implementation.
pub struct ManyToOneRingBuffer<A>
where
    A: AtomicBuffer,
{
    buffer: A,
    layout: Layout,
}

impl<A> ManyToOneRingBuffer<A>
where
    A: AtomicBuffer,
{
    /// Wrap an existing buffer as a many-to-one ring buffer. The buffer's
    /// total length must be `capacity + TRAILER_LENGTH` with `capacity` a
    /// power of two `>= MIN_CAPACITY`.
    pub fn new(buffer: A) -> Result<Self> {
        let layout = Layout::new(buffer.capacity(), MIN_CAPACITY)?;
        Ok(ManyToOneRingBuffer { buffer, layout })
    }

    /// Total number of bytes available for records (trailer excluded).
    pub fn capacity(&self) -> IndexT {
        self.layout.capacity
    }

    /// Largest payload `write`/`tryClaim` will accept.
    pub fn max_msg_length(&self) -> IndexT {
        self.layout.max_msg_length
    }

    /// Atomically fetch-and-increment a correlation id, for callers that
    /// need a unique identifier to pair requests with responses carried over
    /// this buffer.
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
    /// an error when there isn't enough space.
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

        Ok(true)
    }

    /// Reserve space for a `length`-byte message without writing it. Returns
    /// the byte offset at which the caller should write its payload, or
    /// [`record_descriptor::INSUFFICIENT_CAPACITY`] if there isn't room. The
    /// claim must be finished with [`ManyToOneRingBuffer::commit`] or
    /// [`ManyToOneRingBuffer::abort`].
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
        Ok(record_descriptor::encoded_msg_offset(record_index))
    }

    /// Publish a record previously reserved with [`ManyToOneRingBuffer::try_claim`].
    pub fn commit(&self, index: IndexT) -> Result<()> {
        let record_index = self.record_index_for_claim(index)?;
        let length = self.buffer.get_i32(record_descriptor::length_offset(record_index))?;
        if length >= 0 {
            return Err(IpcError::StateProtocol);
        }
        self.buffer.put_i32_ordered(record_descriptor::length_offset(record_index), -length)
    }

    /// Abandon a record previously reserved with [`ManyToOneRingBuffer::try_claim`].
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
        ring_buffer::read(&self.buffer, &self.layout, handler, limit, true)
    }

    /// As [`ManyToOneRingBuffer::read`], with a handler that can abort or
    /// eagerly commit (see [`ControlledReadAction`]).
    pub fn controlled_read<F>(&self, handler: F, limit: usize) -> Result<usize>
    where
        F: FnMut(i32, &[u8]) -> ControlledReadAction,
    {
        ring_buffer::controlled_read(&self.buffer, &self.layout, handler, limit)
    }

    /// Attempt to repair a stalled reservation left behind by a producer
    /// that claimed space and died before publishing. Returns `true` if a
    /// stall was found and repaired (the repair is itself just turning the
    /// abandoned slot into a padding record, or closing a zeroed gap), and
    /// `false` if there was nothing to do.
    pub fn unblock(&self) -> Result<bool> {
        let mut head = self.buffer.get_i64_volatile(self.layout.head_position_index)?;
        let tail = self.buffer.get_i64_volatile(self.layout.tail_position_index)?;
        if head == tail {
            return Ok(false);
        }

        let mask = self.layout.mask;
        let mut head_index = (head & i64::from(mask)) as IndexT;

        loop {
            let length = self.buffer.get_i32_acquire(record_descriptor::length_offset(head_index))?;
            if length < 0 {
                self.buffer.put_i32(record_descriptor::type_offset(head_index), record_descriptor::PADDING_MSG_TYPE_ID)?;
                self.buffer.put_i32_ordered(record_descriptor::length_offset(head_index), -length)?;
                return Ok(true);
            }

            if length == 0 {
                // Gap of zeroed memory: scan forward, one alignment unit at a
                // time, for a non-zero length or the tail. The scan itself
                // can race with a producer finishing a write underneath us,
                // so re-check from the top if the picture changes.
                let current_tail = self.buffer.get_i64_volatile(self.layout.tail_position_index)?;
                let current_head = self.buffer.get_i64_volatile(self.layout.head_position_index)?;
                if current_head != head {
                    head = current_head;
                    head_index = (head & i64::from(mask)) as IndexT;
                    continue;
                }

                let mut scan_index = head_index;
                let limit_index = ((current_tail - head) as IndexT) + head_index;
                while scan_index < limit_index {
                    let probe = self.buffer.get_i32_acquire(record_descriptor::length_offset(scan_index & mask))?;
                    if probe != 0 {
                        break;
                    }
                    scan_index += record_descriptor::ALIGNMENT;
                }

                if scan_index == head_index {
                    return Ok(false);
                }

                let padding = scan_index - head_index;
                self.buffer.put_i32(record_descriptor::type_offset(head_index), record_descriptor::PADDING_MSG_TYPE_ID)?;
                self.buffer.put_i32_ordered(record_descriptor::length_offset(head_index), padding)?;
                return Ok(true);
            }

            return Ok(false);
        }
    }

    /// Reserve `required` bytes in the data region, CAS-advancing the shared
    /// tail. On success, writes any necessary padding record and returns the
    /// offset the caller should use for its own record header. Returns
    /// [`record_descriptor::INSUFFICIENT_CAPACITY`] (never an error) when
    /// there isn't room.
    fn claim_capacity(&self, required: IndexT) -> Result<IndexT> {
        let mask = self.layout.mask;

        let mut head = self.buffer.get_i64_volatile(self.layout.head_cache_position_index)?;
        let mut tail: i64;
        let mut tail_index: IndexT;
        let mut padding: IndexT;

        loop {
            tail = self.buffer.get_i64_volatile(self.layout.tail_position_index)?;
            let available_capacity = self.layout.capacity - (tail - head) as IndexT;

            if required > available_capacity {
                head = self.buffer.get_i64_volatile(self.layout.head_position_index)?;
                if required > (self.layout.capacity - (tail - head) as IndexT) {
                    return Ok(record_descriptor::INSUFFICIENT_CAPACITY);
                }
                self.buffer.put_i64_ordered(self.layout.head_cache_position_index, head)?;
            }

            padding = 0;
            tail_index = (tail & i64::from(mask)) as IndexT;
            let to_buffer_end_length = self.layout.capacity - tail_index;

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
            }

            if self.buffer.compare_and_set_i64(
                self.layout.tail_position_index,
                tail,
                tail + i64::from(required) + i64::from(padding),
            )? {
                break;
            }
        }

        if padding != 0 {
            self.buffer.put_i64_ordered(tail_index, record_descriptor::make_header(padding, record_descriptor::PADDING_MSG_TYPE_ID))?;
            tail_index = 0;
        }

        Ok(tail_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::ring_buffer::buffer_descriptor as trailer;

    const BUFFER_SIZE: usize = 512 + trailer::TRAILER_LENGTH as usize;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let odd = (512 - 1) + trailer::TRAILER_LENGTH as usize;
        assert!(ManyToOneRingBuffer::new(vec![0u8; odd]).is_err());
    }

    #[test]
    fn write_then_read_round_trip() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        let payload = [1u8, 2, 3, 4];
        assert!(ring.write(7, &payload.to_vec(), 0, 4).unwrap());

        let mut seen = Vec::new();
        let count = ring.read(|type_id, msg| seen.push((type_id, msg.to_vec())), usize::max_value()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![(7, vec![1, 2, 3, 4])]);
        assert_eq!(ring.consumer_position(), ring.producer_position());
    }

    #[test]
    fn rejects_message_over_max_length() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        let bytes = vec![0u8; ring.max_msg_length() as usize + 1];
        assert!(ring.write(1, &bytes, 0, bytes.len() as IndexT).is_err());
    }

    #[test]
    fn claim_commit_round_trip_matches_write() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        let index = ring.try_claim(9, 4).unwrap();
        assert_ne!(index, record_descriptor::INSUFFICIENT_CAPACITY);
        ring.buffer.put_slice(index, &[9, 9, 9, 9], 0, 4).unwrap();
        ring.commit(index).unwrap();

        let mut seen = Vec::new();
        let count = ring.read(|t, m| seen.push((t, m.to_vec())), usize::max_value()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![(9, vec![9, 9, 9, 9])]);
    }

    #[test]
    fn claim_abort_is_skipped_silently() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        let index = ring.try_claim(9, 4).unwrap();
        ring.abort(index).unwrap();

        let count = ring.read(|_, _| panic!("handler should not run"), usize::max_value()).unwrap();
        assert_eq!(count, 0);
        assert_eq!(ring.consumer_position(), ring.producer_position());
    }

    #[test]
    fn double_commit_is_rejected() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        let index = ring.try_claim(9, 4).unwrap();
        ring.commit(index).unwrap();
        assert_eq!(ring.commit(index), Err(IpcError::StateProtocol));
    }

    #[test]
    fn unblock_repairs_abandoned_reservation() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        // Simulate a producer that reserved space and died: claim but never
        // commit or abort.
        let _index = ring.try_claim(9, 4).unwrap();

        assert_eq!(ring.read(|_, _| (), 10).unwrap(), 0);
        assert!(ring.unblock().unwrap());
        assert_eq!(ring.read(|_, _| (), 10).unwrap(), 0);
        assert_eq!(ring.consumer_position(), ring.producer_position());
    }

    #[test]
    fn controlled_read_all_continue_still_advances_past_every_record() {
        let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SIZE]).unwrap();
        let payload = vec![0u8; 4];
        for _ in 0..3 {
            assert!(ring.write(9, &payload, 0, 4).unwrap());
        }

        let mut seen = 0;
        let count = ring.controlled_read(
            |_, _| {
                seen += 1;
                ControlledReadAction::Continue
            },
            usize::max_value(),
        ).unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen, 3);
        assert_eq!(ring.consumer_position(), ring.producer_position());

        // A second call must not redeliver anything: a Continue-only walk
        // has to leave the head advanced past everything it was shown, not
        // just what happened to be followed by a Commit.
        assert_eq!(ring.controlled_read(|_, _| panic!("nothing left to read"), 10).unwrap(), 0);
    }
}
