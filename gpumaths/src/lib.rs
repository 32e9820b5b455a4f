//! Batched accelerator pipeline for modular exponentiation and ElGamal
//!
//! Host threads acquire a [`Stream`] from a [`StreamPool`], submit a whole batch on it and get
//! the outputs back through a [`Delivery`], while other batches run on the other streams.
pub mod backend;
pub mod config;
pub mod cryptops;
pub mod env;
mod error;
pub mod group;
pub mod pipeline;
mod pool;
pub mod sizing;

// Publicly export some types
pub use backend::{Accelerator, NativeBackend, RawStream};
pub use config::{BackendMode, GpuMathsConfig, PoolConfig, PoolMemory};
pub use env::{Kernel, Variant};
pub use error::{GpuMathsError, NativeError, Result};
pub use group::CyclicGroup;
pub use pipeline::{
    submit, submit_and_release, BatchInput, BatchResult, Delivery, SlotReader, SlotWriter,
};
pub use pool::{Stream, StreamPool, ACQUIRE_WAIT_WARN_RATE};
