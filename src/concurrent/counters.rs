//! Counters store (spec.md §4.3, component C): two paired regions — a
//! metadata region (state/type/key/label, strided `METADATA_LENGTH`) and a
//! values region (the counter value plus optional registration/owner/
//! reference stamps, strided `COUNTER_LENGTH`) — plus a free list with
//! quarantine for id reuse and an `AtomicCounter` value handle exposing the
//! full load/store ordering matrix.
//!
//! Unlike the ring buffers, the two regions here are independent of each
//! other (§2): a reader can scan metadata without ever touching a ring
//! buffer, and the layouts must be bit-exact across processes (spec.md §6)
//! since a separate monitoring tool may memory-map the same files.

use std::cell::{Cell, RefCell};
use std::sync::Mutex;

use crate::concurrent::AtomicBuffer;
use crate::epoch_clock::{EpochClock, ZeroEpochClock};
use crate::util::{IndexT, IpcError, Result};

/// Layout constants for the counters metadata and values regions.
pub mod counter_descriptor {
    use crate::util::bit::CACHE_LINE_LENGTH;
    use crate::util::IndexT;

    /// Stride of a metadata record: `2 * CACHE_LINE * 3` (spec.md §3.1).
    pub const METADATA_LENGTH: IndexT = (CACHE_LINE_LENGTH * 2 * 3) as IndexT;
    /// Stride of a value record: `2 * CACHE_LINE` (spec.md §3.2).
    pub const COUNTER_LENGTH: IndexT = (CACHE_LINE_LENGTH * 2) as IndexT;
    /// Largest key a caller may attach to a counter at allocation time.
    pub const MAX_KEY_LENGTH: IndexT = COUNTER_LENGTH - 8 - 8;

    pub(super) const STATE_OFFSET: IndexT = 0;
    pub(super) const TYPE_ID_OFFSET: IndexT = 4;
    pub(super) const FREE_FOR_REUSE_DEADLINE_OFFSET: IndexT = 8;
    pub(super) const KEY_OFFSET: IndexT = 16;

    /// Offset of the label's length prefix within a metadata record.
    pub const LABEL_LENGTH_OFFSET: IndexT = (CACHE_LINE_LENGTH * 2) as IndexT;
    /// Offset of the label bytes within a metadata record.
    pub const LABEL_OFFSET: IndexT = LABEL_LENGTH_OFFSET + 4;
    /// Largest label a counter may carry. spec.md §3.1 states `6 * CACHE_LINE
    /// - 4`, which overflows `METADATA_LENGTH`'s 384-byte stride; this crate
    /// takes `METADATA_LENGTH` as the hard constraint and derives the label
    /// budget from what's actually left after the fixed fields (see
    /// SPEC_FULL.md §3 for the full resolution).
    pub const MAX_LABEL_LENGTH: IndexT = METADATA_LENGTH - LABEL_OFFSET;

    pub(super) const VALUE_OFFSET: IndexT = 0;
    pub(super) const REGISTRATION_ID_OFFSET: IndexT = 8;
    pub(super) const OWNER_ID_OFFSET: IndexT = 16;
    pub(super) const REFERENCE_ID_OFFSET: IndexT = 24;

    /// Sentinel stored in `freeForReuseDeadline` while a counter is allocated.
    pub const NOT_FREE_TO_REUSE: i64 = i64::max_value();
}

use counter_descriptor as cd;

/// Lifecycle state of a counter metadata record (spec.md §3.2 "Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Never allocated, or the end of the allocated prefix a scan has
    /// reached — scanning always stops here.
    Unused,
    /// Live: fields are valid and the id is in use.
    Allocated,
    /// Freed, quarantined until `freeForReuseDeadline`. Skipped by scans.
    Reclaimed,
}

impl CounterState {
    fn from_raw(raw: i32) -> Self {
        match raw {
            1 => CounterState::Allocated,
            -1 => CounterState::Reclaimed,
            _ => CounterState::Unused,
        }
    }

    fn as_raw(self) -> i32 {
        match self {
            CounterState::Unused => 0,
            CounterState::Allocated => 1,
            CounterState::Reclaimed => -1,
        }
    }
}

/// Owns the metadata and values regions for a set of counters and serializes
/// allocation bookkeeping (the free list and high-water mark) behind
/// `Cell`/`RefCell` so every public method takes `&self` — the same
/// interior-mutability shape the ring buffers use, and the thing that lets
/// [`AtomicCounter::close`] hand a shared reference back to its owner.
///
/// This type is intentionally not `Sync`: it is the *single-writer* variant
/// named in spec.md §4.3. For multiple intra-process threads calling
/// `allocate`/`free` concurrently, wrap one in a [`ConcurrentCountersManager`].
/// Readers never need either: scanning and the query methods below are
/// lock-free on both variants.
pub struct CountersManager<M, V, E = ZeroEpochClock>
where
    M: AtomicBuffer,
    V: AtomicBuffer,
    E: EpochClock,
{
    metadata: M,
    values: V,
    epoch_clock: E,
    free_to_reuse_timeout_ms: i64,
    free_list: RefCell<Vec<i32>>,
    id_high_water_mark: Cell<i32>,
}

impl<M, V> CountersManager<M, V, ZeroEpochClock>
where
    M: AtomicBuffer,
    V: AtomicBuffer,
{
    /// Construct a manager with the free-to-reuse timeout inactive: a freed
    /// id is eligible for reuse immediately (spec.md §4.3, "epochClock
    /// defaults to a zero clock").
    pub fn new(metadata: M, values: V) -> Result<Self> {
        Self::with_clock(metadata, values, ZeroEpochClock, 0)
    }
}

impl<M, V, E> CountersManager<M, V, E>
where
    M: AtomicBuffer,
    V: AtomicBuffer,
    E: EpochClock,
{
    /// Construct a manager with an explicit clock and free-to-reuse timeout.
    /// Fails with [`IpcError::CapacityShape`] unless
    /// `metadataCapacity >= 2 * valuesCapacity` (spec.md §4.3 step 1).
    pub fn with_clock(metadata: M, values: V, epoch_clock: E, free_to_reuse_timeout_ms: i64) -> Result<Self> {
        if metadata.capacity() < 2 * values.capacity() {
            return Err(IpcError::CapacityShape);
        }
        Ok(CountersManager {
            metadata,
            values,
            epoch_clock,
            free_to_reuse_timeout_ms,
            free_list: RefCell::new(Vec::new()),
            id_high_water_mark: Cell::new(-1),
        })
    }

    /// The largest counter id the values region has room for.
    pub fn max_counter_id(&self) -> IndexT {
        self.values.capacity() / cd::COUNTER_LENGTH - 1
    }

    fn metadata_offset(id: i32) -> IndexT {
        id * cd::METADATA_LENGTH
    }

    fn value_offset(id: i32) -> IndexT {
        id * cd::COUNTER_LENGTH
    }

    /// Select the next id to allocate: scan the free list in insertion order
    /// for the first entry whose deadline has passed (spec.md §4.3,
    /// `nextCounterId`), otherwise mint a fresh one from the high-water mark.
    fn next_counter_id(&self) -> Result<i32> {
        let now = self.epoch_clock.time_ms();
        let mut free_list = self.free_list.borrow_mut();

        let mut eligible = None;
        for (pos, &id) in free_list.iter().enumerate() {
            let deadline = self.metadata.get_i64_acquire(Self::metadata_offset(id) + cd::FREE_FOR_REUSE_DEADLINE_OFFSET)?;
            if deadline <= now {
                eligible = Some(pos);
                break;
            }
        }

        if let Some(pos) = eligible {
            let id = free_list.remove(pos);
            drop(free_list);
            self.values.put_i64_ordered(Self::value_offset(id) + cd::VALUE_OFFSET, 0)?;
            Ok(id)
        } else {
            drop(free_list);
            let id = self.id_high_water_mark.get() + 1;
            self.id_high_water_mark.set(id);
            Ok(id)
        }
    }

    /// Allocate a new counter, returning its id. Writes fields in the order
    /// spec.md §4.3 mandates — `typeId`, key, deadline sentinel, label, then
    /// a release-store of `state = ALLOCATED` — so a reader that observes
    /// `ALLOCATED` via acquire is guaranteed to see the rest already
    /// published. On failure the id is returned to the free list rather than
    /// leaked.
    pub fn allocate(&self, label: &str, type_id: i32, key: Option<&[u8]>) -> Result<i32> {
        let id = self.next_counter_id()?;
        match self.write_allocation(id, label, type_id, key) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.free_list.borrow_mut().push(id);
                Err(e)
            }
        }
    }

    fn write_allocation(&self, id: i32, label: &str, type_id: i32, key: Option<&[u8]>) -> Result<()> {
        let metadata_offset = Self::metadata_offset(id);
        let value_offset = Self::value_offset(id);

        self.metadata.bounds_check(metadata_offset, cd::METADATA_LENGTH).map_err(|_| IpcError::StateCapacity)?;
        self.values.bounds_check(value_offset, cd::COUNTER_LENGTH).map_err(|_| IpcError::StateCapacity)?;

        self.metadata.put_i32(metadata_offset + cd::TYPE_ID_OFFSET, type_id)?;
        if let Some(key_bytes) = key {
            let len = (key_bytes.len() as IndexT).min(cd::MAX_KEY_LENGTH);
            self.metadata.put_slice(metadata_offset + cd::KEY_OFFSET, key_bytes, 0, len)?;
        }
        self.metadata.put_i64(metadata_offset + cd::FREE_FOR_REUSE_DEADLINE_OFFSET, cd::NOT_FREE_TO_REUSE)?;
        self.write_label(metadata_offset, label.as_bytes())?;

        // Stamp the counter's own id as its registration id: one of the two
        // ABA mitigations Design Notes §9 calls out (the other being the
        // free-list deadline gate above), given for free on every allocation.
        self.values.put_i64(value_offset + cd::REGISTRATION_ID_OFFSET, i64::from(id))?;

        self.metadata.put_i32_ordered(metadata_offset + cd::STATE_OFFSET, CounterState::Allocated.as_raw())
    }

    fn write_label(&self, metadata_offset: IndexT, bytes: &[u8]) -> Result<()> {
        let len = (bytes.len() as IndexT).min(cd::MAX_LABEL_LENGTH);
        self.metadata.put_slice(metadata_offset + cd::LABEL_OFFSET, bytes, 0, len)?;
        self.metadata.put_i32_ordered(metadata_offset + cd::LABEL_LENGTH_OFFSET, len)
    }

    /// Rewrite a counter's label outright.
    pub fn set_counter_label(&self, id: i32, text: &str) -> Result<()> {
        let metadata_offset = Self::metadata_offset(id);
        self.metadata.bounds_check(metadata_offset, cd::METADATA_LENGTH)?;
        self.write_label(metadata_offset, text.as_bytes())
    }

    /// Append to a counter's existing label, clamped to `MAX_LABEL_LENGTH`.
    pub fn append_to_label(&self, id: i32, suffix: &str) -> Result<()> {
        let metadata_offset = Self::metadata_offset(id);
        self.metadata.bounds_check(metadata_offset, cd::METADATA_LENGTH)?;

        let existing_len = self.metadata.get_i32(metadata_offset + cd::LABEL_LENGTH_OFFSET)?;
        let remaining = (cd::MAX_LABEL_LENGTH - existing_len).max(0);
        let suffix_bytes = suffix.as_bytes();
        let write_len = (suffix_bytes.len() as IndexT).min(remaining);

        self.metadata.put_slice(metadata_offset + cd::LABEL_OFFSET + existing_len, suffix_bytes, 0, write_len)?;
        self.metadata.put_i32_ordered(metadata_offset + cd::LABEL_LENGTH_OFFSET, existing_len + write_len)
    }

    /// Reclaim a counter id: release-store `RECLAIMED`, zero its key, stamp
    /// a reuse deadline, and push it onto the free list (spec.md §4.3 `free`).
    pub fn free(&self, id: i32) -> Result<()> {
        let metadata_offset = Self::metadata_offset(id);
        self.metadata.bounds_check(metadata_offset, cd::METADATA_LENGTH)?;

        self.metadata.put_i32_ordered(metadata_offset + cd::STATE_OFFSET, CounterState::Reclaimed.as_raw())?;
        self.metadata.set_memory(metadata_offset + cd::KEY_OFFSET, cd::MAX_KEY_LENGTH as usize, 0)?;

        let deadline = self.epoch_clock.time_ms().saturating_add(self.free_to_reuse_timeout_ms);
        self.metadata.put_i64(metadata_offset + cd::FREE_FOR_REUSE_DEADLINE_OFFSET, deadline)?;

        self.free_list.borrow_mut().push(id);
        Ok(())
    }

    /// Volatile read of a counter's current value.
    pub fn counter_value(&self, id: i32) -> Result<i64> {
        self.values.get_i64_volatile(Self::value_offset(id) + cd::VALUE_OFFSET)
    }

    /// Acquire read of a counter's lifecycle state.
    pub fn counter_state(&self, id: i32) -> Result<CounterState> {
        let raw = self.metadata.get_i32_acquire(Self::metadata_offset(id) + cd::STATE_OFFSET)?;
        Ok(CounterState::from_raw(raw))
    }

    /// Convenience: `counter_state(id) == Allocated`.
    pub fn is_allocated(&self, id: i32) -> Result<bool> {
        Ok(self.counter_state(id)? == CounterState::Allocated)
    }

    /// Plain read of a counter's `typeId`, set once at allocation.
    pub fn counter_type_id(&self, id: i32) -> Result<i32> {
        self.metadata.get_i32(Self::metadata_offset(id) + cd::TYPE_ID_OFFSET)
    }

    /// Acquire read of a counter's reuse deadline (epoch ms, or
    /// [`counter_descriptor::NOT_FREE_TO_REUSE`] while allocated).
    pub fn free_for_reuse_deadline(&self, id: i32) -> Result<i64> {
        self.metadata.get_i64_acquire(Self::metadata_offset(id) + cd::FREE_FOR_REUSE_DEADLINE_OFFSET)
    }

    /// A counter's key bytes, zero-padded to `MAX_KEY_LENGTH`.
    pub fn counter_key(&self, id: i32) -> Result<Vec<u8>> {
        let offset = (Self::metadata_offset(id) + cd::KEY_OFFSET) as usize;
        Ok(self.metadata[offset..offset + cd::MAX_KEY_LENGTH as usize].to_vec())
    }

    /// A counter's label, as raw bytes (acquire-read length, then copy).
    pub fn counter_label_bytes(&self, id: i32) -> Result<Vec<u8>> {
        let metadata_offset = Self::metadata_offset(id);
        let len = self.metadata.get_i32_acquire(metadata_offset + cd::LABEL_LENGTH_OFFSET)?;
        let start = (metadata_offset + cd::LABEL_OFFSET) as usize;
        Ok(self.metadata[start..start + len as usize].to_vec())
    }

    /// A counter's label, lossily decoded as UTF-8. Labels are accepted from
    /// callers as `&str` and stored as raw bytes (encoding validation is out
    /// of scope, spec.md §1); this is a convenience for the common case.
    pub fn counter_label(&self, id: i32) -> Result<String> {
        self.counter_label_bytes(id).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// The registration id stamped at allocation time (defaults to the
    /// counter's own id — see [`CountersManager::allocate`]).
    pub fn registration_id(&self, id: i32) -> Result<i64> {
        self.values.get_i64(Self::value_offset(id) + cd::REGISTRATION_ID_OFFSET)
    }

    /// Caller-set owner id (ambient addition, spec.md §3.2).
    pub fn set_owner_id(&self, id: i32, owner_id: i64) -> Result<()> {
        self.values.put_i64(Self::value_offset(id) + cd::OWNER_ID_OFFSET, owner_id)
    }

    /// Caller-set owner id.
    pub fn owner_id(&self, id: i32) -> Result<i64> {
        self.values.get_i64(Self::value_offset(id) + cd::OWNER_ID_OFFSET)
    }

    /// Caller-set reference id (ambient addition, spec.md §3.2).
    pub fn set_reference_id(&self, id: i32, reference_id: i64) -> Result<()> {
        self.values.put_i64(Self::value_offset(id) + cd::REFERENCE_ID_OFFSET, reference_id)
    }

    /// Caller-set reference id.
    pub fn reference_id(&self, id: i32) -> Result<i64> {
        self.values.get_i64(Self::value_offset(id) + cd::REFERENCE_ID_OFFSET)
    }

    /// Borrow a value handle for `id`, exposing the full ordering matrix
    /// ([`AtomicCounter`]).
    pub fn counter(&self, id: i32) -> Result<AtomicCounter<'_, V>> {
        self.values.bounds_check(Self::value_offset(id), cd::COUNTER_LENGTH).map_err(|_| IpcError::StateCapacity)?;
        Ok(AtomicCounter::new(&self.values, id))
    }

    /// Visit every allocated counter in id order: `(id, typeId, key, label)`.
    /// Stops at the first `UNUSED` record, the end of the allocated prefix
    /// (spec.md §4.3, "Scanning").
    pub fn for_each<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(i32, i32, &[u8], &str),
    {
        let max_id = self.max_counter_id();
        let mut id = 0;
        while id <= max_id {
            let metadata_offset = Self::metadata_offset(id);
            let raw_state = self.metadata.get_i32_acquire(metadata_offset + cd::STATE_OFFSET)?;
            match CounterState::from_raw(raw_state) {
                CounterState::Unused => break,
                CounterState::Reclaimed => {}
                CounterState::Allocated => {
                    let type_id = self.metadata.get_i32(metadata_offset + cd::TYPE_ID_OFFSET)?;
                    let key_start = (metadata_offset + cd::KEY_OFFSET) as usize;
                    let key = &self.metadata[key_start..key_start + cd::MAX_KEY_LENGTH as usize];
                    let label = self.counter_label(id)?;
                    visitor(id, type_id, key, &label);
                }
            }
            id += 1;
        }
        Ok(())
    }

    fn scan_allocated<F>(&self, mut predicate: F) -> Result<Option<i32>>
    where
        F: FnMut(i32, i32, i64) -> bool,
    {
        let max_id = self.max_counter_id();
        let mut id = 0;
        while id <= max_id {
            let metadata_offset = Self::metadata_offset(id);
            let raw_state = self.metadata.get_i32_acquire(metadata_offset + cd::STATE_OFFSET)?;
            match CounterState::from_raw(raw_state) {
                CounterState::Unused => break,
                CounterState::Reclaimed => {}
                CounterState::Allocated => {
                    let type_id = self.metadata.get_i32(metadata_offset + cd::TYPE_ID_OFFSET)?;
                    let registration_id = self.values.get_i64(Self::value_offset(id) + cd::REGISTRATION_ID_OFFSET)?;
                    if predicate(id, type_id, registration_id) {
                        return Ok(Some(id));
                    }
                }
            }
            id += 1;
        }
        Ok(None)
    }

    /// Linear scan for the first allocated counter with a matching
    /// registration id, stopping at the first `UNUSED` record.
    pub fn find_by_registration_id(&self, registration_id: i64) -> Result<Option<i32>> {
        self.scan_allocated(|_, _, reg| reg == registration_id)
    }

    /// As [`CountersManager::find_by_registration_id`], additionally
    /// matching on `typeId`.
    pub fn find_by_type_id_and_registration_id(&self, type_id: i32, registration_id: i64) -> Result<Option<i32>> {
        self.scan_allocated(|_, t, reg| t == type_id && reg == registration_id)
    }
}

/// A handle onto a single counter's 8-byte value slot, exposing the ordering
/// matrix named in spec.md §4.3: every mutating method documents the load it
/// must be paired with. Mixing flavors compiles — they all agree on the same
/// offset — but the resulting visibility guarantee is the caller's
/// responsibility (Design Notes §9).
pub struct AtomicCounter<'a, V>
where
    V: AtomicBuffer,
{
    values: &'a V,
    id: i32,
    offset: IndexT,
    closed: Cell<bool>,
}

impl<'a, V> AtomicCounter<'a, V>
where
    V: AtomicBuffer,
{
    /// Build a handle directly over a values buffer at `id`'s slot. Most
    /// callers get one from [`CountersManager::counter`] instead; this
    /// constructor is for detached use (e.g. a separate process that has
    /// memory-mapped the same values file but doesn't own the allocator).
    pub fn new(values: &'a V, id: i32) -> Self {
        AtomicCounter { values, id, offset: id * cd::COUNTER_LENGTH, closed: Cell::new(false) }
    }

    /// The counter id this handle addresses.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Strong-atomic load. Pairs with `set_volatile`/`compare_and_set`/
    /// `get_and_add`/`get_and_set`: use this flavor when more than one writer
    /// may be touching the value.
    pub fn get_volatile(&self) -> i64 {
        self.values.get_i64_volatile(self.offset).expect("counter offset validated at construction")
    }

    /// Strong-atomic store. See [`AtomicCounter::get_volatile`].
    pub fn set_volatile(&self, value: i64) {
        self.values.put_i64_volatile(self.offset, value).expect("counter offset validated at construction")
    }

    /// Release-store/acquire-load flavor: pairs with `get_acquire`. Cheaper
    /// than the strong-atomic flavor for the common single-writer,
    /// many-readers shape.
    pub fn set_release(&self, value: i64) {
        self.values.put_i64_ordered(self.offset, value).expect("counter offset validated at construction")
    }

    /// Pairs with [`AtomicCounter::set_release`].
    pub fn get_acquire(&self) -> i64 {
        self.values.get_i64_acquire(self.offset).expect("counter offset validated at construction")
    }

    /// Single-copy-atomic store with no ordering relative to other accesses.
    /// Pairs with `get_opaque`.
    pub fn set_opaque(&self, value: i64) {
        self.values.put_i64_opaque(self.offset, value).expect("counter offset validated at construction")
    }

    /// Pairs with [`AtomicCounter::set_opaque`].
    pub fn get_opaque(&self) -> i64 {
        self.values.get_i64_opaque(self.offset).expect("counter offset validated at construction")
    }

    /// Same-thread, no-ordering store. Pairs with `get_plain`.
    pub fn set_plain(&self, value: i64) {
        self.values.put_i64(self.offset, value).expect("counter offset validated at construction")
    }

    /// Pairs with [`AtomicCounter::set_plain`].
    pub fn get_plain(&self) -> i64 {
        self.values.get_i64(self.offset).expect("counter offset validated at construction")
    }

    /// Atomic compare-and-swap.
    pub fn compare_and_set(&self, expected: i64, update: i64) -> bool {
        self.values.compare_and_set_i64(self.offset, expected, update).expect("counter offset validated at construction")
    }

    /// Atomic exchange, returning the previous value.
    pub fn get_and_set(&self, value: i64) -> i64 {
        self.values.get_and_set_i64(self.offset, value).expect("counter offset validated at construction")
    }

    /// Atomic fetch-and-add, returning the value before the add.
    pub fn get_and_add(&self, delta: i64) -> i64 {
        self.values.get_and_add_i64(self.offset, delta).expect("counter offset validated at construction")
    }

    /// `get_and_add(1)`.
    pub fn increment(&self) -> i64 {
        self.get_and_add(1)
    }

    /// `get_and_add(-1)`.
    pub fn decrement(&self) -> i64 {
        self.get_and_add(-1)
    }

    /// Update the value to `proposed_value` if and only if the current value
    /// is strictly less, via a CAS retry loop. Returns whether it updated.
    /// Pairs with `get_volatile`; safe under multiple concurrent proposers.
    pub fn propose_max(&self, proposed_value: i64) -> bool {
        loop {
            let current = self.get_volatile();
            if current >= proposed_value {
                return false;
            }
            if self.compare_and_set(current, proposed_value) {
                return true;
            }
        }
    }

    /// Single-writer variant of [`AtomicCounter::propose_max`]: pairs a
    /// release-store with an acquire-load, no CAS needed since nothing else
    /// is racing to update this value.
    pub fn propose_max_ordered(&self, proposed_value: i64) -> bool {
        let current = self.get_acquire();
        if current < proposed_value {
            self.set_release(proposed_value);
            true
        } else {
            false
        }
    }

    /// Release this counter's id back to `owner`'s free list. Idempotent —
    /// calling it again after the first time is a no-op.
    pub fn close<M, E>(&self, owner: &CountersManager<M, V, E>) -> Result<()>
    where
        M: AtomicBuffer,
        E: EpochClock,
    {
        if self.closed.replace(true) {
            return Ok(());
        }
        owner.free(self.id)
    }
}

/// Serializes `allocate`/`free`/availability checks behind a mutex so
/// multiple intra-process threads can safely share one counters store
/// (spec.md §4.3, "Concurrent counters store"). Readers don't need this —
/// they can talk to a [`CountersManager`] directly, lock-free, even while
/// another thread is allocating through this wrapper.
pub struct ConcurrentCountersManager<M, V, E = ZeroEpochClock>
where
    M: AtomicBuffer,
    V: AtomicBuffer,
    E: EpochClock,
{
    inner: Mutex<CountersManager<M, V, E>>,
}

impl<M, V, E> ConcurrentCountersManager<M, V, E>
where
    M: AtomicBuffer,
    V: AtomicBuffer,
    E: EpochClock,
{
    /// Wrap an existing manager for multi-writer intra-process use.
    pub fn new(manager: CountersManager<M, V, E>) -> Self {
        ConcurrentCountersManager { inner: Mutex::new(manager) }
    }

    /// See [`CountersManager::allocate`].
    pub fn allocate(&self, label: &str, type_id: i32, key: Option<&[u8]>) -> Result<i32> {
        self.lock().allocate(label, type_id, key)
    }

    /// See [`CountersManager::free`].
    pub fn free(&self, id: i32) -> Result<()> {
        self.lock().free(id)
    }

    /// See [`CountersManager::is_allocated`].
    pub fn is_allocated(&self, id: i32) -> Result<bool> {
        self.lock().is_allocated(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CountersManager<M, V, E>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestClock(Cell<i64>);

    impl EpochClock for TestClock {
        fn time_ms(&self) -> i64 {
            self.0.get()
        }
    }

    fn buffers(num_counters: i32) -> (Vec<u8>, Vec<u8>) {
        (
            vec![0u8; (cd::METADATA_LENGTH * num_counters) as usize],
            vec![0u8; (cd::COUNTER_LENGTH * num_counters) as usize],
        )
    }

    #[test]
    fn rejects_undersized_metadata_region() {
        let metadata = vec![0u8; cd::METADATA_LENGTH as usize];
        let values = vec![0u8; (cd::COUNTER_LENGTH * 4) as usize];
        assert_eq!(CountersManager::new(metadata, values).err(), Some(IpcError::CapacityShape));
    }

    #[test]
    fn allocate_assigns_increasing_ids() {
        let (metadata, values) = buffers(4);
        let manager = CountersManager::new(metadata, values).unwrap();
        assert_eq!(manager.allocate("a", 1, None).unwrap(), 0);
        assert_eq!(manager.allocate("b", 1, None).unwrap(), 1);
        assert_eq!(manager.counter_label(0).unwrap(), "a");
        assert_eq!(manager.counter_label(1).unwrap(), "b");
        assert_eq!(manager.counter_state(0).unwrap(), CounterState::Allocated);
    }

    #[test]
    fn allocate_free_and_reuse_after_deadline() {
        let (metadata, values) = buffers(4);
        let clock = TestClock(Cell::new(0));
        let manager = CountersManager::with_clock(metadata, values, clock, 100).unwrap();

        assert_eq!(manager.allocate("a", 1, None).unwrap(), 0);
        assert_eq!(manager.allocate("b", 1, None).unwrap(), 1);
        manager.free(0).unwrap();

        manager.epoch_clock.0.set(50);
        assert_eq!(manager.allocate("c", 1, None).unwrap(), 2);

        manager.epoch_clock.0.set(100);
        let reused = manager.allocate("d", 1, None).unwrap();
        assert_eq!(reused, 0);
        assert_eq!(manager.counter_value(0).unwrap(), 0);
    }

    #[test]
    fn scanning_stops_at_first_unused() {
        let (metadata, values) = buffers(4);
        let manager = CountersManager::new(metadata, values).unwrap();
        manager.allocate("a", 1, None).unwrap();
        manager.allocate("b", 1, None).unwrap();

        let mut seen = Vec::new();
        manager.for_each(|id, _type_id, _key, label| seen.push((id, label.to_string()))).unwrap();
        assert_eq!(seen, vec![(0, "a".to_string()), (1, "b".to_string())]);
    }

    #[test]
    fn scanning_skips_reclaimed_but_does_not_stop() {
        let (metadata, values) = buffers(4);
        let manager = CountersManager::new(metadata, values).unwrap();
        manager.allocate("a", 1, None).unwrap();
        manager.allocate("b", 1, None).unwrap();
        manager.free(0).unwrap();

        let mut seen = Vec::new();
        manager.for_each(|id, _, _, _| seen.push(id)).unwrap();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn key_round_trips_and_is_zeroed_on_free() {
        let (metadata, values) = buffers(2);
        let manager = CountersManager::new(metadata, values).unwrap();
        let id = manager.allocate("k", 5, Some(&[1, 2, 3])).unwrap();
        assert_eq!(&manager.counter_key(id).unwrap()[..3], &[1, 2, 3]);

        manager.free(id).unwrap();
        assert!(manager.counter_key(id).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn find_by_registration_id_defaults_to_counter_id() {
        let (metadata, values) = buffers(4);
        let manager = CountersManager::new(metadata, values).unwrap();
        let id = manager.allocate("a", 9, None).unwrap();
        assert_eq!(manager.registration_id(id).unwrap(), i64::from(id));
        assert_eq!(manager.find_by_registration_id(i64::from(id)).unwrap(), Some(id));
        assert_eq!(manager.find_by_type_id_and_registration_id(9, i64::from(id)).unwrap(), Some(id));
        assert_eq!(manager.find_by_type_id_and_registration_id(123, i64::from(id)).unwrap(), None);
    }

    #[test]
    fn propose_max_updates_only_when_greater() {
        let (metadata, values) = buffers(2);
        let manager = CountersManager::new(metadata, values).unwrap();
        let id = manager.allocate("x", 1, None).unwrap();
        let counter = manager.counter(id).unwrap();

        counter.set_volatile(10);
        assert!(!counter.propose_max(5));
        assert!(counter.propose_max(11));
        assert_eq!(counter.get_volatile(), 11);
    }

    #[test]
    fn ordering_flavors_agree_on_the_same_slot() {
        let (metadata, values) = buffers(2);
        let manager = CountersManager::new(metadata, values).unwrap();
        let id = manager.allocate("x", 1, None).unwrap();
        let counter = manager.counter(id).unwrap();

        counter.set_plain(1);
        assert_eq!(counter.get_opaque(), 1);
        counter.set_opaque(2);
        assert_eq!(counter.get_acquire(), 2);
        counter.set_release(3);
        assert_eq!(counter.get_volatile(), 3);
        assert_eq!(counter.increment(), 3);
        assert_eq!(counter.get_plain(), 4);
    }

    #[test]
    fn close_frees_the_counter_id_and_is_idempotent() {
        let (metadata, values) = buffers(2);
        let manager = CountersManager::new(metadata, values).unwrap();
        let id = manager.allocate("x", 1, None).unwrap();

        let counter = manager.counter(id).unwrap();
        counter.close(&manager).unwrap();
        counter.close(&manager).unwrap();

        assert_eq!(manager.counter_state(id).unwrap(), CounterState::Reclaimed);
    }

    #[test]
    fn concurrent_manager_allocates_and_frees() {
        let (metadata, values) = buffers(4);
        let manager = ConcurrentCountersManager::new(CountersManager::new(metadata, values).unwrap());
        let id = manager.allocate("x", 1, None).unwrap();
        assert!(manager.is_allocated(id).unwrap());
        manager.free(id).unwrap();
        assert!(!manager.is_allocated(id).unwrap());
    }
}
