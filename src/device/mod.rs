//! Host execution model for the accelerator contract.
//!
//! The decoder's concurrency design is written against streams and events:
//! in-order work queues plus synchronization markers between them. On this
//! platform the arenas live in unified (host-visible) memory and a stream is
//! a dedicated worker thread draining a FIFO of ops, so kernels, transfers
//! and event waits keep the exact ordering semantics the driver relies on
//! without any FFI. Prefetch and upload hints degrade to plain copies.

mod event;
mod stream;

pub use event::Event;
pub use stream::Stream;
