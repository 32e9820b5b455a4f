//! Define gpumaths configuration
//! Provide mechanism to load it from Toml-file
//!
//! ```toml
//! [backend]
//! Sim = { device_memory = 1073741824, kernel_latency_us = 0 }
//!
//! [pool]
//! stream_count = 2
//! memory = { Slots = { kernel = "ElGamal", modulus_bits = 4096, slots = 1024 } }
//! ```
use crate::backend::sim::SimConfig;
use crate::env::{Kernel, Variant};
use crate::error::{GpuMathsError, Result};
use crate::sizing;

/// Native backend to use
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum BackendMode {
    /// Cuda when compiled in and usable, stub otherwise
    #[default]
    Auto,
    Cuda,
    Sim(SimConfig),
    Unsupported,
}

/// Per-stream arena size, either raw or derived from a workload
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum PoolMemory {
    Bytes(usize),
    /// Enough room for `slots` items of `kernel` on the variant holding `modulus_bits`
    Slots {
        kernel: Kernel,
        modulus_bits: u64,
        slots: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct PoolConfig {
    pub stream_count: usize,
    pub memory: PoolMemory,
}

impl PoolConfig {
    pub fn memory_per_stream(&self) -> Result<usize> {
        match &self.memory {
            PoolMemory::Bytes(b) => Ok(*b),
            PoolMemory::Slots {
                kernel,
                modulus_bits,
                slots,
            } => {
                let variant = Variant::for_bit_len(*modulus_bits)?;
                sizing::checked_required_memory(variant, *kernel, *slots).ok_or_else(|| {
                    GpuMathsError::Config(format!(
                        "{slots} {kernel} slots at {variant} do not fit in a stream size"
                    ))
                })
            }
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            stream_count: 2,
            memory: PoolMemory::Bytes(65536),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct GpuMathsConfig {
    #[serde(default)]
    pub backend: BackendMode,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl GpuMathsConfig {
    /// Provide Serde mechanisms from TOML file
    pub fn from_toml(file: &str) -> Self {
        let file_str = match std::fs::read_to_string(file) {
            Ok(str) => str,
            Err(err) => {
                panic!("Error: `{file}`:: {err}");
            }
        };

        match file_str.parse() {
            Ok(cfg) => cfg,
            Err(err) => panic!("Toml error in `{file}`: {err}"),
        }
    }
}

impl std::str::FromStr for GpuMathsConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        toml::from_str(s)
    }
}
