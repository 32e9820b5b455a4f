//! Modular exponentiation batches, base^exponent mod prime with an odd prime
use super::{check_lengths, run_chunked, submit, BatchInput, BatchResult, Delivery};
use super::{SlotReader, SlotWriter};
use crate::env::{Kernel, Variant};
use crate::error::Result;
use crate::group::CyclicGroup;
use crate::pool::{Stream, StreamPool};
use num_bigint::BigUint;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpInputSlot {
    pub base: Vec<u8>,
    pub exponent: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpInput {
    pub slots: Vec<ExpInputSlot>,
    pub prime: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpOutputSlot {
    pub result: Vec<u8>,
}

impl BatchInput for ExpInput {
    const KERNEL: Kernel = Kernel::PowmOdd;
    type Output = ExpOutputSlot;

    fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn write_constants(&self, w: &mut SlotWriter<'_>) -> Result<()> {
        w.put("prime", &self.prime)
    }

    fn write_slot(&self, index: usize, w: &mut SlotWriter<'_>) -> Result<()> {
        let slot = &self.slots[index];
        w.put("base", &slot.base)?;
        w.put("exponent", &slot.exponent)
    }

    fn read_slot(r: &mut SlotReader<'_>) -> ExpOutputSlot {
        ExpOutputSlot { result: r.take() }
    }
}

pub fn exp(
    input: &ExpInput,
    variant: Variant,
    stream: Stream,
) -> Result<Delivery<BatchResult<ExpOutputSlot>>> {
    submit(input, variant, stream)
}

/// results[i] = bases[i]^exponents[i] mod p, spread over the pool streams
///
/// Panics when no variant is wide enough for the group.
pub fn exp_chunk(
    pool: &StreamPool,
    group: &CyclicGroup,
    bases: &[BigUint],
    exponents: &[BigUint],
    results: &mut [BigUint],
) -> Result<()> {
    let len = bases.len();
    check_lengths(
        len,
        &[("exponents", exponents.len()), ("results", results.len())],
    )?;
    let variant = Variant::for_group(group);
    let prime = group.p_bytes();

    let outputs = run_chunked(pool, variant, len, |range| {
        Ok(ExpInput {
            slots: range
                .map(|i| ExpInputSlot {
                    base: bases[i].to_bytes_be(),
                    exponent: exponents[i].to_bytes_be(),
                })
                .collect(),
            prime: prime.clone(),
        })
    })?;

    for (out, result) in outputs.iter().zip(results) {
        *result = BigUint::from_bytes_be(&out.result);
    }
    Ok(())
}
