//! Non-batched reference implementations
//!
//! These run one item at a time on the host and are the baseline the accelerator results are
//! compared against. They are also the fallback path for callers on hosts without accelerator.
use crate::group::CyclicGroup;
use num_bigint::BigUint;

/// ElGamal share of the precomputation
///
/// ecr_key <- ecr_key * key * g^private_key
/// cypher  <- cypher * public_cypher_key^private_key
pub fn elgamal(
    group: &CyclicGroup,
    key: &BigUint,
    private_key: &BigUint,
    public_cypher_key: &BigUint,
    ecr_key: &mut BigUint,
    cypher: &mut BigUint,
) {
    let tmp = group.exp_g(private_key);
    let tmp = group.mul(key, &tmp);
    *ecr_key = group.mul(&tmp, ecr_key);

    let tmp = group.exp(public_cypher_key, private_key);
    *cypher = group.mul(&tmp, cypher);
}

/// x^y mod p
pub fn exp(group: &CyclicGroup, x: &BigUint, y: &BigUint) -> BigUint {
    group.exp(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elgamal_small_group() {
        let group = CyclicGroup::from_hex("65", "2").unwrap(); // p = 101
        let key = BigUint::from(3u8);
        let private_key = BigUint::from(5u8);
        let public_cypher_key = BigUint::from(7u8);
        let mut ecr_key = BigUint::from(11u8);
        let mut cypher = BigUint::from(13u8);

        elgamal(
            &group,
            &key,
            &private_key,
            &public_cypher_key,
            &mut ecr_key,
            &mut cypher,
        );

        // 2^5 = 32, 32 * 3 = 96, 96 * 11 = 1056 = 46 mod 101
        assert_eq!(ecr_key, BigUint::from(46u8));
        // 7^5 = 16807 = 41 mod 101, 41 * 13 = 533 = 28 mod 101
        assert_eq!(cypher, BigUint::from(28u8));
    }

    #[test]
    fn exp_small_group() {
        let group = CyclicGroup::from_hex("65", "2").unwrap();
        assert_eq!(
            exp(&group, &BigUint::from(7u8), &BigUint::from(5u8)),
            BigUint::from(41u8)
        );
    }
}
