//! Cuda backend on top of `libpowmosm75`
//!
//! Each entry point of the native library exists once per modulus width. The `dispatch!` macro
//! selects the symbol matching a [`Variant`].
use super::{NativeBackend, RawStream};
use crate::env::{Kernel, Variant};
use crate::error::NativeError;
use gpumaths_cuda_backend::cuda_bind::*;
use std::ffi::{c_char, c_uint, c_void, CStr};

macro_rules! dispatch {
    ($variant:expr, $f2048:ident, $f3200:ident, $f4096:ident ($($arg:expr),*)) => {
        match $variant {
            Variant::W2048 => $f2048($($arg),*),
            Variant::W3200 => $f3200($($arg),*),
            Variant::W4096 => $f4096($($arg),*),
        }
    };
}

/// Copies a C string into a Rust error and frees the C string
///
/// # Safety
///
/// `c_str` must be null or a nul terminated string allocated with `malloc`
unsafe fn take_error(c_str: *mut c_char) -> Result<(), NativeError> {
    if c_str.is_null() {
        return Ok(());
    }
    let msg = CStr::from_ptr(c_str).to_string_lossy().into_owned();
    libc::free(c_str as *mut c_void);
    Err(NativeError(msg))
}

fn kernel_id(kernel: Kernel) -> enum_kernel {
    match kernel {
        Kernel::PowmOdd => KERNEL_POWMOSM,
        Kernel::ElGamal => KERNEL_ELGAMAL,
    }
}

// Tokens are the native stream addresses
fn as_ptr(stream: RawStream) -> *mut c_void {
    stream.token() as usize as *mut c_void
}

fn slots(num_slots: usize) -> Result<c_uint, NativeError> {
    c_uint::try_from(num_slots)
        .map_err(|_| NativeError::new(format!("{num_slots} slots exceed the native slot count")))
}

#[derive(Debug)]
pub struct CudaBackend {
    _private: (),
}

impl CudaBackend {
    /// Bind to the native library
    ///
    /// Refuses to start if the native layouts disagree with the sizing tables, since every
    /// staged batch would then be misread by the kernels.
    pub fn new() -> Result<Self, NativeError> {
        for variant in Variant::ALL {
            for kernel in Kernel::ALL {
                let id = kernel_id(kernel);
                let native = unsafe {
                    (
                        dispatch!(variant, getInputSize2048, getInputSize3200, getInputSize4096(id)),
                        dispatch!(variant, getOutputSize2048, getOutputSize3200, getOutputSize4096(id)),
                        dispatch!(
                            variant,
                            getConstantsSize2048,
                            getConstantsSize3200,
                            getConstantsSize4096(id)
                        ),
                    )
                };
                let expected = (
                    variant.input_size(kernel),
                    variant.output_size(kernel),
                    variant.constants_size(kernel),
                );
                if native != expected {
                    return Err(NativeError::new(format!(
                        "{kernel} {variant}: native layout {native:?} doesn't match {expected:?}"
                    )));
                }
            }
        }
        Ok(Self { _private: () })
    }
}

impl NativeBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    #[tracing::instrument(level = "trace", skip(self), ret)]
    fn create_stream(&self, capacity: usize) -> Result<RawStream, NativeError> {
        let created = unsafe { createStream(streamCreateInfo { capacity }) };
        if let Err(err) = unsafe { take_error(created.error) } {
            if !created.result.is_null() {
                // Don't leak a half-initialized stream
                if let Err(destroy_err) = unsafe { take_error(destroyStream(created.result)) } {
                    tracing::error!("Couldn't release partially created stream: {destroy_err}");
                }
            }
            return Err(err);
        }
        if created.result.is_null() {
            return Err(NativeError::new("createStream returned a null stream"));
        }
        Ok(RawStream::from_token(created.result as usize as u64))
    }

    #[tracing::instrument(level = "trace", skip(self), ret)]
    fn destroy_stream(&self, stream: RawStream) -> Result<(), NativeError> {
        unsafe { take_error(destroyStream(as_ptr(stream))) }
    }

    fn put(
        &self,
        stream: RawStream,
        variant: Variant,
        kernel: Kernel,
        num_slots: usize,
        staged: &[u8],
    ) -> Result<(), NativeError> {
        let ptr = as_ptr(stream);
        let id = kernel_id(kernel);
        let n = slots(num_slots)?;
        unsafe {
            let dst = dispatch!(variant, getCpuInputs2048, getCpuInputs3200, getCpuInputs4096(ptr, id));
            if dst.is_null() {
                return Err(NativeError::new("stream has no host input region"));
            }
            // Capacity was checked against the stream arena by the caller
            std::ptr::copy_nonoverlapping(staged.as_ptr(), dst as *mut u8, staged.len());
            take_error(dispatch!(variant, upload2048, upload3200, upload4096(n, ptr, id)))
        }
    }

    fn run(&self, stream: RawStream, variant: Variant) -> Result<(), NativeError> {
        let ptr = as_ptr(stream);
        unsafe { take_error(dispatch!(variant, run2048, run3200, run4096(ptr))) }
    }

    fn download(&self, stream: RawStream, variant: Variant) -> Result<(), NativeError> {
        let ptr = as_ptr(stream);
        unsafe { take_error(dispatch!(variant, download2048, download3200, download4096(ptr))) }
    }

    fn synchronize(&self, stream: RawStream) -> Result<(), NativeError> {
        unsafe { take_error(getResults(as_ptr(stream))) }
    }

    fn read_outputs(
        &self,
        stream: RawStream,
        variant: Variant,
        dst: &mut [u8],
    ) -> Result<(), NativeError> {
        let ptr = as_ptr(stream);
        unsafe {
            let src = dispatch!(variant, getCpuOutputs2048, getCpuOutputs3200, getCpuOutputs4096(ptr));
            if src.is_null() {
                return Err(NativeError::new("stream has no host output region"));
            }
            std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    fn reset_device(&self) -> Result<(), NativeError> {
        unsafe { take_error(resetDevice()) }
    }
}
