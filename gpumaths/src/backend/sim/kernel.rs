//! Host model of the batched kernels
//!
//! Words are little-endian and zero-filled to the variant width, as in the device arena.
use crate::env::{Kernel, Variant};
use num_bigint::BigUint;
use rayon::prelude::*;

fn word(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_le(bytes)
}

fn put_word(dst: &mut [u8], value: &BigUint) {
    let bytes = value.to_bytes_le();
    dst[..bytes.len()].copy_from_slice(&bytes);
    dst[bytes.len()..].fill(0);
}

/// Run `kernel` over every slot of `inputs`, writing `outputs`
pub(super) fn execute(
    variant: Variant,
    kernel: Kernel,
    constants: &[u8],
    inputs: &[u8],
    outputs: &mut [u8],
) -> Result<(), String> {
    let w = variant.byte_len();
    let in_size = variant.input_size(kernel);
    let out_size = variant.output_size(kernel);
    if inputs.len() % in_size != 0 || inputs.len() / in_size != outputs.len() / out_size {
        return Err(format!(
            "{kernel} {variant}: malformed arena ({} B of inputs, {} B of outputs)",
            inputs.len(),
            outputs.len()
        ));
    }

    let consts = constants.chunks_exact(w).map(word).collect::<Vec<_>>();
    // Montgomery kernels only handle odd moduli
    let p = match kernel {
        Kernel::PowmOdd => &consts[0],
        Kernel::ElGamal => &consts[1],
    };
    if !p.bit(0) {
        return Err(format!("{kernel} {variant}: modulus must be odd"));
    }

    let slots = inputs
        .par_chunks_exact(in_size)
        .zip(outputs.par_chunks_exact_mut(out_size));
    match kernel {
        Kernel::PowmOdd => slots.for_each(|(input, output)| {
            let x = word(&input[..w]);
            let y = word(&input[w..2 * w]);
            put_word(output, &x.modpow(&y, p));
        }),
        Kernel::ElGamal => {
            let public_cypher_key = &consts[0];
            let g = &consts[2];
            slots.for_each(|(input, output)| {
                let private_key = word(&input[..w]);
                let key = word(&input[w..2 * w]);
                let ecr_key = word(&input[2 * w..3 * w]);
                let cypher = word(&input[3 * w..4 * w]);

                let ecr_key = (ecr_key * key * g.modpow(&private_key, p)) % p;
                let cypher = (cypher * public_cypher_key.modpow(&private_key, p)) % p;

                let (ecr_out, cypher_out) = output.split_at_mut(w);
                put_word(ecr_out, &ecr_key);
                put_word(cypher_out, &cypher);
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le(v: u64, w: usize) -> Vec<u8> {
        let mut out = vec![0u8; w];
        out[..8].copy_from_slice(&v.to_le_bytes());
        out
    }

    #[test]
    fn powm_two_slots() {
        let v = Variant::W2048;
        let w = v.byte_len();
        let constants = le(101, w);
        let inputs = [le(7, w), le(5, w), le(2, w), le(10, w)].concat();
        let mut outputs = vec![0xffu8; 2 * w];

        execute(v, Kernel::PowmOdd, &constants, &inputs, &mut outputs).unwrap();
        assert_eq!(outputs[..w], le(41, w)[..]);
        // 2^10 = 1024 = 14 mod 101
        assert_eq!(outputs[w..], le(14, w)[..]);
    }

    #[test]
    fn even_modulus_is_rejected() {
        let v = Variant::W2048;
        let w = v.byte_len();
        let err = execute(
            v,
            Kernel::PowmOdd,
            &le(100, w),
            &[le(7, w), le(5, w)].concat(),
            &mut vec![0u8; w],
        )
        .unwrap_err();
        assert!(err.contains("odd"));
    }
}
