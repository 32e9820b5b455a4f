//! Fixed-width execution environments
//!
//! The native kernels are compiled for a handful of modulus widths. A [`Variant`] describes one
//! of them and carries the memory layout of every [`Kernel`] at that width.
use crate::error::{GpuMathsError, Result};
use crate::group::CyclicGroup;

/// Batched operation run by the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
pub enum Kernel {
    /// `x**y mod p` for an odd prime `p`
    PowmOdd,
    /// ElGamal share of the mix-network precomputation
    ElGamal,
}

impl Kernel {
    pub const ALL: [Kernel; 2] = [Kernel::PowmOdd, Kernel::ElGamal];

    /// Number of words read per slot
    /// PowmOdd: x, y
    /// ElGamal: private_key, key, ecr_key, cypher
    pub const fn input_words(self) -> usize {
        match self {
            Kernel::PowmOdd => 2,
            Kernel::ElGamal => 4,
        }
    }

    /// Number of words written per slot
    /// PowmOdd: result
    /// ElGamal: ecr_key, cypher
    pub const fn output_words(self) -> usize {
        match self {
            Kernel::PowmOdd => 1,
            Kernel::ElGamal => 2,
        }
    }

    /// Number of words shared by the whole batch
    /// PowmOdd: prime
    /// ElGamal: public_cypher_key, prime, g
    pub const fn constant_words(self) -> usize {
        match self {
            Kernel::PowmOdd => 1,
            Kernel::ElGamal => 3,
        }
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kernel::PowmOdd => write!(f, "powm_odd"),
            Kernel::ElGamal => write!(f, "elgamal"),
        }
    }
}

/// Modulus width the native kernels are specialized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
pub enum Variant {
    W2048,
    W3200,
    W4096,
}

impl Variant {
    /// Ordered by increasing width
    pub const ALL: [Variant; 3] = [Variant::W2048, Variant::W3200, Variant::W4096];

    pub const fn bit_len(self) -> usize {
        match self {
            Variant::W2048 => 2048,
            Variant::W3200 => 3200,
            Variant::W4096 => 4096,
        }
    }

    pub const fn byte_len(self) -> usize {
        self.bit_len() / 8
    }

    /// Returns size in bytes
    pub const fn input_size(self, kernel: Kernel) -> usize {
        kernel.input_words() * self.byte_len()
    }

    /// Returns size in bytes
    pub const fn output_size(self, kernel: Kernel) -> usize {
        kernel.output_words() * self.byte_len()
    }

    /// Returns size in bytes
    pub const fn constants_size(self, kernel: Kernel) -> usize {
        kernel.constant_words() * self.byte_len()
    }

    /// Smallest variant able to hold a modulus of `bits` bits
    pub fn for_bit_len(bits: u64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| bits <= v.bit_len() as u64)
            .ok_or(GpuMathsError::NoVariant { bits })
    }

    /// Smallest variant able to hold the group prime
    ///
    /// # Panics
    ///
    /// A prime wider than every variant is a deployment error and aborts rather than silently
    /// truncating operands.
    pub fn for_group(group: &CyclicGroup) -> Self {
        match Self::for_bit_len(group.bit_len()) {
            Ok(variant) => variant,
            Err(err) => panic!("{err}: {:x}", group.p()),
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gpumaths{}", self.bit_len())
    }
}
