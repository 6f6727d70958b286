//! The rendering pipeline.
//!
//! Three layers, bottom up:
//!
//! - [`cache`]: content-addressed on-disk store of rendered chunk audio,
//!   keyed by chunk text and voice identity, which makes interrupted jobs
//!   resumable without recomputation
//! - [`batch`]: groups pending chunks into batches, consults the cache,
//!   invokes the inference model, and keeps peak device memory bounded to
//!   one batch of outputs
//! - [`job`]: drives a whole manifest through a cancellable,
//!   progress-reporting render job and applies the failure-recovery policy

pub mod batch;
pub mod cache;
pub mod job;

pub use batch::{run_batches, BatchRun};
pub use cache::ChunkCache;
