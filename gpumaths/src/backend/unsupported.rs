//! Stub out the native protocol with reduced functionality
//!
//! Selected on hosts without accelerator so that dependent code builds and runs everywhere.
use super::{NativeBackend, RawStream};
use crate::env::{Kernel, Variant};
use crate::error::NativeError;

const MSG: &str = "gpumaths stubbed build doesn't support CUDA stream pool";

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedBackend;

fn unsupported<T>() -> Result<T, NativeError> {
    Err(NativeError::new(MSG))
}

impl NativeBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn create_stream(&self, _capacity: usize) -> Result<RawStream, NativeError> {
        unsupported()
    }

    fn destroy_stream(&self, _stream: RawStream) -> Result<(), NativeError> {
        unsupported()
    }

    fn put(
        &self,
        _stream: RawStream,
        _variant: Variant,
        _kernel: Kernel,
        _num_slots: usize,
        _staged: &[u8],
    ) -> Result<(), NativeError> {
        unsupported()
    }

    fn run(&self, _stream: RawStream, _variant: Variant) -> Result<(), NativeError> {
        unsupported()
    }

    fn download(&self, _stream: RawStream, _variant: Variant) -> Result<(), NativeError> {
        unsupported()
    }

    fn synchronize(&self, _stream: RawStream) -> Result<(), NativeError> {
        unsupported()
    }

    fn read_outputs(
        &self,
        _stream: RawStream,
        _variant: Variant,
        _dst: &mut [u8],
    ) -> Result<(), NativeError> {
        unsupported()
    }

    fn reset_device(&self) -> Result<(), NativeError> {
        unsupported()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuMathsError;
    use crate::pool::StreamPool;
    use std::sync::Arc;

    #[test]
    fn every_operation_fails() {
        let be = UnsupportedBackend;
        let s = RawStream::from_token(1);
        assert_eq!(be.create_stream(1024), Err(NativeError::new(MSG)));
        assert!(be.destroy_stream(s).is_err());
        assert!(be.put(s, Variant::W2048, Kernel::ElGamal, 1, &[]).is_err());
        assert!(be.run(s, Variant::W2048).is_err());
        assert!(be.download(s, Variant::W2048).is_err());
        assert!(be.synchronize(s).is_err());
        assert!(be.read_outputs(s, Variant::W2048, &mut []).is_err());
        assert!(be.reset_device().is_err());
    }

    #[test]
    fn pool_open_fails_directly() {
        // Bypassing the Accelerator still surfaces a resource error, never a panic
        let err = StreamPool::open(Arc::new(UnsupportedBackend), 2, 65536).unwrap_err();
        assert_eq!(err, GpuMathsError::Resource(MSG.to_string()));
    }
}
