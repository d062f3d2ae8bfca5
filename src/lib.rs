//! Bounded, lock-free, multi-producer multi-consumer byte ring with a
//! fixed-size record layer.
//!
//! Two layered types:
//! - [`ByteRing`]: a fixed-capacity circular byte buffer. Producers append
//!   opaque byte blocks, consumers drain blocks in FIFO order; coordination
//!   is a reserve/commit protocol over four atomic position markers and two
//!   signed byte budgets. Lock-free but not wait-free: a reservation retires
//!   only after every earlier reservation on its side has finished its copy.
//! - [`TypedRing<T>`]: record-granular operations over a byte ring, with
//!   in-place construction on push, move-out on pop, and destructor coverage
//!   for records still in the ring when it is dropped.
//!
//! Blocking operations busy-spin; the `try_` forms fail fast and report
//! capacity exhaustion in-band. Nothing allocates after construction and
//! nothing blocks in the kernel.
//!
//! ```
//! use mpmc_ring::TypedRing;
//!
//! let ring: TypedRing<u64> = TypedRing::with_capacity(8).unwrap();
//! ring.push(1);
//! assert_eq!(ring.try_pop(), Some(1));
//! assert_eq!(ring.try_pop(), None);
//! ```
//!
//! # Verification
//! Unit and cross-thread tests run with plain `cargo test`; property suites
//! are behind the `prop-tests` feature; concurrency interleavings are model
//! checked with loom via `RUSTFLAGS="--cfg loom" cargo test --lib`.

pub mod byte_ring;
pub mod storage;
pub mod typed;

#[cfg(test)]
pub mod test_utils;

pub use byte_ring::ByteRing;
pub use storage::StorageError;
pub use typed::TypedRing;
