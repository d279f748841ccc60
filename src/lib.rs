//! Lock-free shared-memory primitives for passing type-tagged binary
//! messages and maintaining monitoring counters between processes: two ring
//! buffer variants (many-to-one and one-to-one) built on a shared atomic
//! buffer abstraction, plus a counters store with a free list for id reuse.
//!
//! Every structure here is just a fixed layout over a byte buffer — a
//! `Vec<u8>` for single-process use and tests, or a [`memmap2::MmapMut`] over
//! a shared file for genuine cross-process use. None of these types own a
//! thread, a socket, or any other form of hidden runtime state; construct one
//! over whatever buffer you already have and start calling its methods.

#[cfg(target_endian = "big")]
compile_error!("this crate's wire layouts assume little-endian memory, matching every platform it currently targets");

pub mod concurrent;
pub mod epoch_clock;
pub mod util;
