use thiserror::Error;

/// Error string reported by a native backend, kept verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Common error type exposed to user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuMathsError {
    // Configuration errors
    #[error("Prime of {bits} bits was too big for any available gpumaths environment")]
    NoVariant { bits: u64 },
    #[error("Invalid gpumaths configuration: {0}")]
    Config(String),

    #[error("Couldn't allocate accelerator stream: {0}")]
    Resource(String),

    // Recoverable by the caller with a smaller batch or a larger pool
    #[error("Batch of {items} items requires {required} B but the stream only holds {capacity} B")]
    Sizing {
        items: usize,
        required: usize,
        capacity: usize,
    },
    #[error("Field `{field}` is {len} B long and doesn't fit in a {width} B word")]
    InputTooWide {
        field: &'static str,
        len: usize,
        width: usize,
    },
    #[error("Buffers of a chunked batch disagree in length: {0}")]
    BatchShape(String),

    #[error("Accelerator operation failed: {0}")]
    Operation(String),
    #[error("Stream pool is closed")]
    PoolClosed,
    #[error("Couldn't destroy accelerator stream: {0}")]
    Destroy(String),
    #[error("gpumaths build doesn't support {0}")]
    Unsupported(&'static str),
    #[error("Batch waiter terminated before delivering its result")]
    DeliveryLost,
}

impl GpuMathsError {
    pub(crate) fn operation(err: NativeError) -> Self {
        Self::Operation(err.0)
    }
}

pub type Result<T> = std::result::Result<T, GpuMathsError>;
