//! Native accelerator abstraction
//!
//! Every backend speaks the same put/run/download/get protocol on opaque streams. Operations
//! enqueued on one stream complete in order; `synchronize` blocks until all of them are done and
//! reports the first failure that occurred since the previous synchronization.
use crate::config::{BackendMode, PoolConfig};
use crate::env::{Kernel, Variant};
use crate::error::{GpuMathsError, NativeError, Result};
use crate::pool::StreamPool;
use crate::sizing;
use std::sync::Arc;

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod sim;
pub mod unsupported;

/// Opaque token naming a native stream
///
/// Only meaningful to the backend that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStream(u64);

impl RawStream {
    pub fn from_token(token: u64) -> Self {
        Self(token)
    }

    pub fn token(&self) -> u64 {
        self.0
    }
}

pub trait NativeBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// False for backends that fail every operation
    fn is_available(&self) -> bool {
        true
    }

    /// Create a stream bound to a device arena of `capacity` bytes
    fn create_stream(&self, capacity: usize) -> std::result::Result<RawStream, NativeError>;

    /// Release the stream and its arena. The stream must be idle.
    fn destroy_stream(&self, stream: RawStream) -> std::result::Result<(), NativeError>;

    /// Copy `staged` (constants then `num_slots` input slots) into the stream host region and
    /// enqueue its upload. Returns once the copy is enqueued.
    fn put(
        &self,
        stream: RawStream,
        variant: Variant,
        kernel: Kernel,
        num_slots: usize,
        staged: &[u8],
    ) -> std::result::Result<(), NativeError>;

    /// Enqueue the kernel selected by the last `put`
    fn run(&self, stream: RawStream, variant: Variant) -> std::result::Result<(), NativeError>;

    /// Enqueue the copy of the output slots back to host
    fn download(&self, stream: RawStream, variant: Variant)
        -> std::result::Result<(), NativeError>;

    /// Block until every enqueued operation on `stream` is done
    fn synchronize(&self, stream: RawStream) -> std::result::Result<(), NativeError>;

    /// Copy the downloaded output slots into `dst`. Only valid after `synchronize` succeeded.
    fn read_outputs(
        &self,
        stream: RawStream,
        variant: Variant,
        dst: &mut [u8],
    ) -> std::result::Result<(), NativeError>;

    /// Reset the whole device. Every stream must have been destroyed beforehand.
    fn reset_device(&self) -> std::result::Result<(), NativeError> {
        Ok(())
    }
}

/// Capability object selected once at startup
///
/// Wraps the native backend matching the host and exposes the caller-facing entry points.
/// On hosts without accelerator it wraps [`unsupported::UnsupportedBackend`]: sizing queries
/// report zero capacity and pool creation fails, letting callers fall back to
/// [`crate::cryptops`].
///
/// The wrapped backend is not handed out. Streams are only reachable through a pool:
///
/// ```compile_fail
/// fn native_backend(acc: &gpumaths::Accelerator) {
///     let _ = acc.backend();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Accelerator {
    backend: Arc<dyn NativeBackend>,
}

impl Accelerator {
    pub fn new(backend: Arc<dyn NativeBackend>) -> Self {
        Self { backend }
    }

    pub fn unsupported() -> Self {
        Self::new(Arc::new(unsupported::UnsupportedBackend))
    }

    /// Select the backend described by `mode`
    pub fn from_mode(mode: &BackendMode) -> Self {
        match mode {
            BackendMode::Unsupported => Self::unsupported(),
            BackendMode::Sim(cfg) => Self::new(Arc::new(sim::SimBackend::new(cfg.clone()))),
            BackendMode::Cuda => Self::cuda_or_unsupported(),
            BackendMode::Auto => {
                if cfg!(feature = "cuda") {
                    Self::cuda_or_unsupported()
                } else {
                    tracing::info!("gpumaths built without cuda, using unsupported backend");
                    Self::unsupported()
                }
            }
        }
    }

    #[cfg(feature = "cuda")]
    fn cuda_or_unsupported() -> Self {
        match cuda::CudaBackend::new() {
            Ok(backend) => Self::new(Arc::new(backend)),
            Err(err) => {
                tracing::warn!("Cuda backend unavailable, falling back to unsupported: {err}");
                Self::unsupported()
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn cuda_or_unsupported() -> Self {
        tracing::warn!("Cuda backend requested but gpumaths was built without the `cuda` feature");
        Self::unsupported()
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Number of items of `kernel` a stream of `mem_size` bytes can hold
    pub fn max_slots(&self, variant: Variant, kernel: Kernel, mem_size: usize) -> usize {
        if !self.is_available() {
            return 0;
        }
        sizing::max_slots(variant, kernel, mem_size)
    }

    /// Stream size needed to hold `num_items` items of `kernel`
    pub fn stream_size_containing(&self, variant: Variant, kernel: Kernel, num_items: usize) -> usize {
        if !self.is_available() {
            return 0;
        }
        sizing::required_memory(variant, kernel, num_items)
    }

    pub fn open_pool(&self, stream_count: usize, memory_per_stream: usize) -> Result<StreamPool> {
        if !self.is_available() {
            return Err(GpuMathsError::Unsupported("accelerator stream pool"));
        }
        StreamPool::open(self.backend.clone(), stream_count, memory_per_stream)
    }

    pub fn open_configured_pool(&self, config: &PoolConfig) -> Result<StreamPool> {
        self.open_pool(config.stream_count, config.memory_per_stream()?)
    }

    pub fn reset_device(&self) -> Result<()> {
        self.backend
            .reset_device()
            .map_err(GpuMathsError::operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_reports_no_capacity() {
        let acc = Accelerator::unsupported();
        assert!(!acc.is_available());
        for variant in Variant::ALL {
            for kernel in Kernel::ALL {
                assert_eq!(acc.max_slots(variant, kernel, 1 << 30), 0);
                assert_eq!(acc.stream_size_containing(variant, kernel, 1024), 0);
            }
        }
        assert_eq!(
            acc.open_pool(2, 65536).unwrap_err(),
            GpuMathsError::Unsupported("accelerator stream pool")
        );
    }

    #[test]
    fn sim_reports_capacity() {
        let acc = Accelerator::from_mode(&BackendMode::Sim(Default::default()));
        assert!(acc.is_available());
        assert_eq!(acc.name(), "sim");
        let mem = acc.stream_size_containing(Variant::W4096, Kernel::ElGamal, 1024);
        assert_eq!(acc.max_slots(Variant::W4096, Kernel::ElGamal, mem), 1024);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn auto_without_cuda_is_unsupported() {
        assert!(!Accelerator::from_mode(&BackendMode::Auto).is_available());
        assert!(!Accelerator::from_mode(&BackendMode::Cuda).is_available());
    }
}
