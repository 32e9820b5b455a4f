use std::ffi::{c_char, c_uint, c_void};

/// Kernel selector understood by every per-width entry point
#[allow(non_camel_case_types)]
pub type enum_kernel = c_uint;

/// `x**y mod p` for odd `p`
pub const KERNEL_POWMOSM: enum_kernel = 0;
/// ElGamal share: `ecrKey *= key * g**privateKey`, `cypher *= publicCypherKey**privateKey`
pub const KERNEL_ELGAMAL: enum_kernel = 1;
pub const KERNEL_REVEAL: enum_kernel = 2;
pub const KERNEL_STRIP: enum_kernel = 3;
pub const KERNEL_MUL2: enum_kernel = 4;
pub const KERNEL_MUL3: enum_kernel = 5;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct streamCreateInfo {
    /// Size in bytes of the device arena bound to the stream
    pub capacity: usize,
}

/// Result of `createStream`. When `error` is non null it has been allocated with `malloc` and
/// must be released with `free` by the caller.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct createStreamReturn {
    pub result: *mut c_void,
    pub error: *mut c_char,
}

// Every function returning `*mut c_char` reports an error as a `malloc`ed C string, or null on
// success. The caller owns the string.
extern "C" {
    /// Create a Cuda stream together with its pinned host buffers and a device arena of
    /// `info.capacity` bytes
    pub fn createStream(info: streamCreateInfo) -> createStreamReturn;

    /// Destroy the stream `stream` and release every buffer bound to it
    pub fn destroyStream(stream: *mut c_void) -> *mut c_char;

    /// Wait for every operation enqueued on `stream` and check the kernel error report
    pub fn getResults(stream: *mut c_void) -> *mut c_char;

    /// Reset the Cuda device, flushing profiler data
    pub fn resetDevice() -> *mut c_char;

    /// Pinned host input region of `stream`. The constants region comes first, followed by the
    /// input slots.
    pub fn getCpuInputs2048(stream: *mut c_void, kernel: enum_kernel) -> *mut c_void;
    pub fn getCpuInputs3200(stream: *mut c_void, kernel: enum_kernel) -> *mut c_void;
    pub fn getCpuInputs4096(stream: *mut c_void, kernel: enum_kernel) -> *mut c_void;

    /// Pinned host output region of `stream`, valid once `getResults` returned
    pub fn getCpuOutputs2048(stream: *mut c_void) -> *mut c_void;
    pub fn getCpuOutputs3200(stream: *mut c_void) -> *mut c_void;
    pub fn getCpuOutputs4096(stream: *mut c_void) -> *mut c_void;

    /// Enqueue an asynchronous copy of `num_slots` staged slots (and the constants) to the GPU
    pub fn upload2048(num_slots: c_uint, stream: *mut c_void, kernel: enum_kernel) -> *mut c_char;
    pub fn upload3200(num_slots: c_uint, stream: *mut c_void, kernel: enum_kernel) -> *mut c_char;
    pub fn upload4096(num_slots: c_uint, stream: *mut c_void, kernel: enum_kernel) -> *mut c_char;

    /// Enqueue the kernel selected by the last upload on `stream`
    pub fn run2048(stream: *mut c_void) -> *mut c_char;
    pub fn run3200(stream: *mut c_void) -> *mut c_char;
    pub fn run4096(stream: *mut c_void) -> *mut c_char;

    /// Enqueue an asynchronous copy of the output slots back to the pinned host region
    pub fn download2048(stream: *mut c_void) -> *mut c_char;
    pub fn download3200(stream: *mut c_void) -> *mut c_char;
    pub fn download4096(stream: *mut c_void) -> *mut c_char;

    /// Upload, run and download in a single call
    pub fn enqueue2048(num_slots: c_uint, stream: *mut c_void, kernel: enum_kernel)
        -> *mut c_char;
    pub fn enqueue3200(num_slots: c_uint, stream: *mut c_void, kernel: enum_kernel)
        -> *mut c_char;
    pub fn enqueue4096(num_slots: c_uint, stream: *mut c_void, kernel: enum_kernel)
        -> *mut c_char;

    /// Size in bytes of one input slot
    pub fn getInputSize2048(kernel: enum_kernel) -> usize;
    pub fn getInputSize3200(kernel: enum_kernel) -> usize;
    pub fn getInputSize4096(kernel: enum_kernel) -> usize;

    /// Size in bytes of one output slot
    pub fn getOutputSize2048(kernel: enum_kernel) -> usize;
    pub fn getOutputSize3200(kernel: enum_kernel) -> usize;
    pub fn getOutputSize4096(kernel: enum_kernel) -> usize;

    /// Size in bytes of the per-batch constants region
    pub fn getConstantsSize2048(kernel: enum_kernel) -> usize;
    pub fn getConstantsSize3200(kernel: enum_kernel) -> usize;
    pub fn getConstantsSize4096(kernel: enum_kernel) -> usize;
}
