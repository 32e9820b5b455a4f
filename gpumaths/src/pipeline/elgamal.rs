//! ElGamal batches
//!
//! Per item: ecr_key <- ecr_key * key * g^private_key and
//! cypher <- cypher * public_cypher_key^private_key, every operation mod prime.
use super::{check_lengths, run_chunked, submit, BatchInput, BatchResult, Delivery};
use super::{SlotReader, SlotWriter};
use crate::env::{Kernel, Variant};
use crate::error::Result;
use crate::group::CyclicGroup;
use crate::pool::{Stream, StreamPool};
use num_bigint::BigUint;

/// Big-endian operands of one item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElGamalInputSlot {
    pub private_key: Vec<u8>,
    pub key: Vec<u8>,
    pub ecr_key: Vec<u8>,
    pub cypher: Vec<u8>,
}

impl ElGamalInputSlot {
    pub fn new(private_key: &BigUint, key: &BigUint, ecr_key: &BigUint, cypher: &BigUint) -> Self {
        Self {
            private_key: private_key.to_bytes_be(),
            key: key.to_bytes_be(),
            ecr_key: ecr_key.to_bytes_be(),
            cypher: cypher.to_bytes_be(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElGamalInput {
    pub slots: Vec<ElGamalInputSlot>,
    pub public_cypher_key: Vec<u8>,
    pub prime: Vec<u8>,
    pub g: Vec<u8>,
}

impl ElGamalInput {
    /// Empty batch bound to `group`
    pub fn new(group: &CyclicGroup, public_cypher_key: &BigUint) -> Self {
        Self {
            slots: Vec::new(),
            public_cypher_key: public_cypher_key.to_bytes_be(),
            prime: group.p_bytes(),
            g: group.g_bytes(),
        }
    }
}

/// Big-endian results of one item, at the full variant width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElGamalOutputSlot {
    pub ecr_key: Vec<u8>,
    pub cypher: Vec<u8>,
}

impl BatchInput for ElGamalInput {
    const KERNEL: Kernel = Kernel::ElGamal;
    type Output = ElGamalOutputSlot;

    fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn write_constants(&self, w: &mut SlotWriter<'_>) -> Result<()> {
        w.put("public_cypher_key", &self.public_cypher_key)?;
        w.put("prime", &self.prime)?;
        w.put("g", &self.g)
    }

    fn write_slot(&self, index: usize, w: &mut SlotWriter<'_>) -> Result<()> {
        let slot = &self.slots[index];
        w.put("private_key", &slot.private_key)?;
        w.put("key", &slot.key)?;
        w.put("ecr_key", &slot.ecr_key)?;
        w.put("cypher", &slot.cypher)
    }

    fn read_slot(r: &mut SlotReader<'_>) -> ElGamalOutputSlot {
        ElGamalOutputSlot {
            ecr_key: r.take(),
            cypher: r.take(),
        }
    }
}

/// Submit an ElGamal batch on `stream`
pub fn elgamal(
    input: &ElGamalInput,
    variant: Variant,
    stream: Stream,
) -> Result<Delivery<BatchResult<ElGamalOutputSlot>>> {
    submit(input, variant, stream)
}

/// ElGamal over whole buffers, results written back into `ecr_keys` and `cyphers`
///
/// Items are cut into batches as large as a pool stream can hold, and batches run concurrently
/// on as many streams as the pool lends. Panics when no variant is wide enough for the group.
pub fn elgamal_chunk(
    pool: &StreamPool,
    group: &CyclicGroup,
    private_keys: &[BigUint],
    keys: &[BigUint],
    public_cypher_key: &BigUint,
    ecr_keys: &mut [BigUint],
    cyphers: &mut [BigUint],
) -> Result<()> {
    let len = private_keys.len();
    check_lengths(
        len,
        &[
            ("keys", keys.len()),
            ("ecr_keys", ecr_keys.len()),
            ("cyphers", cyphers.len()),
        ],
    )?;
    let variant = Variant::for_group(group);

    let outputs = {
        let (ecr_keys, cyphers) = (&*ecr_keys, &*cyphers);
        run_chunked(pool, variant, len, |range| {
            let mut input = ElGamalInput::new(group, public_cypher_key);
            input.slots = range
                .map(|i| ElGamalInputSlot::new(&private_keys[i], &keys[i], &ecr_keys[i], &cyphers[i]))
                .collect();
            Ok(input)
        })?
    };

    for ((out, ecr_key), cypher) in outputs.iter().zip(ecr_keys).zip(cyphers) {
        *ecr_key = BigUint::from_bytes_be(&out.ecr_key);
        *cypher = BigUint::from_bytes_be(&out.cypher);
    }
    Ok(())
}
