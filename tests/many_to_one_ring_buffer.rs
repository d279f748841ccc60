//! Black-box scenarios from spec.md §8, against the public API only (no
//! reaching into private trailer offsets the way the unit tests do).

use concurrent_ipc::concurrent::mpsc_ring_buffer::ManyToOneRingBuffer;
use concurrent_ipc::concurrent::ring_buffer::{buffer_descriptor, ControlledReadAction};
use concurrent_ipc::concurrent::record_descriptor;
use concurrent_ipc::util::IndexT;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

const CAPACITY: usize = 4096;
const BUFFER_SZ: usize = CAPACITY + buffer_descriptor::TRAILER_LENGTH as usize;
const ODD_BUFFER_SZ: usize = (CAPACITY - 1) + buffer_descriptor::TRAILER_LENGTH as usize;
const MSG_TYPE_ID: i32 = 7;

#[test]
fn rejects_capacity_that_is_not_a_power_of_two() {
    assert!(ManyToOneRingBuffer::new(vec![0u8; ODD_BUFFER_SZ]).is_err());
}

#[test]
fn empty_buffer_write_then_read() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();
    let payload = vec![0u8; 8];

    assert!(ring.write(MSG_TYPE_ID, &payload, 0, 8).unwrap());

    let mut seen = Vec::new();
    let count = ring.read(|type_id, msg| seen.push((type_id, msg.len())), usize::max_value()).unwrap();

    assert_eq!(count, 1);
    assert_eq!(seen, vec![(MSG_TYPE_ID, 8)]);
    // align(8 + HEADER_LENGTH, 8) == 16
    assert_eq!(ring.producer_position(), 16);
    assert_eq!(ring.consumer_position(), 16);
}

#[test]
fn full_buffer_rejects_the_next_write() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();
    let payload = vec![0u8; 16];

    let mut writes = 0;
    while ring.write(MSG_TYPE_ID, &payload, 0, 16).unwrap() {
        writes += 1;
    }

    // 16-byte payload -> 24-byte record -> rounds up to 24 (already aligned
    // to 8), so capacity/24 writes fit before the buffer reports full.
    assert!(writes > 0);
    let consumer_before = ring.consumer_position();
    assert_eq!(ring.write(MSG_TYPE_ID, &payload, 0, 16), Ok(false));
    assert_eq!(ring.consumer_position(), consumer_before);
}

#[test]
fn wrap_inserts_padding_and_delivers_exactly_one_message() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();
    let filler = vec![0u8; 8];

    // Consume writes up to (but not past) the last aligned slot before the
    // end of the buffer, draining as we go so the head keeps up and only the
    // final write is left to straddle the wrap.
    let record_len = 8 + record_descriptor::HEADER_LENGTH; // 16
    let slots_to_edge = (CAPACITY as IndexT - record_descriptor::ALIGNMENT) / record_len;
    for _ in 0..slots_to_edge {
        assert!(ring.write(MSG_TYPE_ID, &filler, 0, 8).unwrap());
    }
    ring.read(|_, _| (), usize::max_value()).unwrap();

    // Now the tail sits `ALIGNMENT` bytes from the end; a write needing more
    // room than that must wrap, emitting one padding record.
    let big_payload = vec![9u8; 200];
    assert!(ring.write(MSG_TYPE_ID, &big_payload, 0, 200).unwrap());

    // The padding record exactly fills the remaining contiguous span to the
    // end of the buffer, so the consumer's contiguous-block walk (spec
    // §4.4) stops there: the first read consumes only the padding and
    // returns 0. The payload, now sitting at offset 0, is delivered on the
    // next read.
    let first = ring.read(|_, _| panic!("padding must not reach the handler"), usize::max_value()).unwrap();
    assert_eq!(first, 0);

    let mut seen = Vec::new();
    let count = ring.read(|type_id, msg| seen.push((type_id, msg.to_vec())), usize::max_value()).unwrap();
    assert_eq!(count, 1);
    assert_eq!(seen, vec![(MSG_TYPE_ID, big_payload)]);
}

#[test]
fn unblock_repairs_a_reservation_abandoned_mid_claim() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();

    // Simulate a producer that crashed between try_claim and commit.
    let index = ring.try_claim(MSG_TYPE_ID, 16).unwrap();
    assert_ne!(index, record_descriptor::INSUFFICIENT_CAPACITY);

    assert_eq!(ring.read(|_, _| (), usize::max_value()).unwrap(), 0);
    assert!(ring.unblock().unwrap());
    assert_eq!(ring.read(|_, _| (), usize::max_value()).unwrap(), 0);
    assert_eq!(ring.consumer_position(), ring.producer_position());
}

#[test]
fn controlled_read_commit_then_abort_stops_after_the_commit() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();
    let payload = vec![0u8; 16];
    assert!(ring.write(MSG_TYPE_ID, &payload, 0, 16).unwrap());
    assert!(ring.write(MSG_TYPE_ID, &payload, 0, 16).unwrap());

    let mut call = 0;
    let count = ring
        .controlled_read(
            |_, _| {
                call += 1;
                if call == 1 {
                    ControlledReadAction::Commit
                } else {
                    ControlledReadAction::Abort
                }
            },
            usize::max_value(),
        )
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(ring.consumer_position(), ring.producer_position() / 2);
}

#[test]
fn claim_commit_round_trip_is_observably_identical_to_write() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();

    let index = ring.try_claim(MSG_TYPE_ID, 4).unwrap();
    assert_ne!(index, record_descriptor::INSUFFICIENT_CAPACITY);
    // A real caller would write through the same buffer it claimed from; the
    // public API doesn't expose that buffer, so exercise the claim/commit
    // path alone and confirm a message of the right shape is delivered.
    ring.commit(index).unwrap();

    let mut seen = Vec::new();
    let count = ring.read(|t, m| seen.push((t, m.len())), usize::max_value()).unwrap();
    assert_eq!(count, 1);
    assert_eq!(seen, vec![(MSG_TYPE_ID, 4)]);
}

#[test]
fn claim_then_abort_is_skipped_silently_by_the_reader() {
    let ring = ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap();

    let index = ring.try_claim(MSG_TYPE_ID, 4).unwrap();
    ring.abort(index).unwrap();

    let count = ring.read(|_, _| panic!("padding must not reach the handler"), usize::max_value()).unwrap();
    assert_eq!(count, 0);
    assert_eq!(ring.consumer_position(), ring.producer_position());
}

#[test]
fn concurrent_producers_each_see_their_own_messages_delivered_once() {
    let ring = Arc::new(ManyToOneRingBuffer::new(vec![0u8; BUFFER_SZ]).unwrap());
    const PRODUCERS: i32 = 4;
    const MSGS_PER_PRODUCER: i32 = 50;

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..MSGS_PER_PRODUCER {
                    let payload = (p * 1000 + i).to_le_bytes().to_vec();
                    loop {
                        if ring.write(p + 1, &payload, 0, payload.len() as IndexT).unwrap() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let received = Arc::new(AtomicUsize::new(0));
    let mut total = 0;
    loop {
        let before = received.load(Ordering::SeqCst);
        let n = ring
            .read(
                |_type_id, _msg| {
                    received.fetch_add(1, Ordering::SeqCst);
                },
                usize::max_value(),
            )
            .unwrap();
        total += n;
        if received.load(Ordering::SeqCst) == before && n == 0 {
            break;
        }
    }

    assert_eq!(total, (PRODUCERS * MSGS_PER_PRODUCER) as usize);
    assert_eq!(ring.consumer_position(), ring.producer_position());
}
