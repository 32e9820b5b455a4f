//! Minimal cyclic group collaborator
//!
//! The pipeline only needs the prime, the generator, a fixed-width serialization and a
//! membership predicate. Group arithmetic itself is delegated to `num-bigint`.
use crate::error::{GpuMathsError, Result};
use num_bigint::{BigUint, RandBigInt};
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclicGroup {
    p: BigUint,
    g: BigUint,
}

impl CyclicGroup {
    /// The kernels rely on Montgomery arithmetic and thus need an odd modulus
    pub fn new(p: BigUint, g: BigUint) -> Result<Self> {
        if p.bits() < 2 || !p.bit(0) {
            return Err(GpuMathsError::Config(format!(
                "group prime must be odd and greater than 2, got {p:x}"
            )));
        }
        if g <= BigUint::from(1u8) || g >= p {
            return Err(GpuMathsError::Config(format!(
                "generator {g:x} is outside of the group"
            )));
        }
        Ok(Self { p, g })
    }

    pub fn from_hex(p: &str, g: &str) -> Result<Self> {
        let parse = |name: &str, s: &str| {
            let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
            BigUint::parse_bytes(s.as_bytes(), 16)
                .ok_or_else(|| GpuMathsError::Config(format!("{name} isn't valid hexadecimal")))
        };
        Self::new(parse("prime", p)?, parse("generator", g)?)
    }

    /// Random odd modulus of exactly `bits` bits with generator 2
    ///
    /// Not a safe prime: only meant for throughput measurements and tests where the
    /// arithmetic, not the group structure, matters.
    pub fn benchmark_group<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> Self {
        assert!(bits >= 3, "benchmark group needs at least 3 bits");
        let mut p = rng.gen_biguint(bits);
        p.set_bit(bits - 1, true);
        p.set_bit(0, true);
        Self {
            p,
            g: BigUint::from(2u8),
        }
    }

    pub fn p(&self) -> &BigUint {
        &self.p
    }

    pub fn g(&self) -> &BigUint {
        &self.g
    }

    pub fn bit_len(&self) -> u64 {
        self.p.bits()
    }

    /// Big-endian, no leading zeros
    pub fn p_bytes(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    pub fn g_bytes(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }

    /// 0 < x < p
    pub fn inside(&self, x: &BigUint) -> bool {
        x.bits() != 0 && x < &self.p
    }

    /// Membership check on big-endian encoded values
    pub fn bytes_inside(&self, values: &[&[u8]]) -> bool {
        values
            .iter()
            .all(|bytes| self.inside(&BigUint::from_bytes_be(bytes)))
    }

    /// `count` values of the modulus width, redrawn together until every one is in the group
    pub fn random_bytes_inside<R: Rng + ?Sized>(&self, rng: &mut R, count: usize) -> Vec<Vec<u8>> {
        let width = self.p_bytes().len();
        let mut values = vec![vec![0u8; width]; count];
        loop {
            for value in values.iter_mut() {
                rng.fill_bytes(value.as_mut_slice());
            }
            let refs = values.iter().map(Vec::as_slice).collect::<Vec<_>>();
            if self.bytes_inside(&refs) {
                return values;
            }
        }
    }

    /// Uniform element in [1, p)
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> BigUint {
        rng.gen_biguint_range(&BigUint::from(1u8), &self.p)
    }

    pub fn mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a * b) % &self.p
    }

    pub fn exp(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        base.modpow(exponent, &self.p)
    }

    pub fn exp_g(&self, exponent: &BigUint) -> BigUint {
        self.g.modpow(exponent, &self.p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_even_modulus() {
        assert!(CyclicGroup::new(BigUint::from(100u32), BigUint::from(3u8)).is_err());
        assert!(CyclicGroup::new(BigUint::from(101u32), BigUint::from(1u8)).is_err());
        assert!(CyclicGroup::new(BigUint::from(101u32), BigUint::from(101u32)).is_err());
        assert!(CyclicGroup::new(BigUint::from(101u32), BigUint::from(2u8)).is_ok());
    }

    #[test]
    fn benchmark_group_has_requested_width() {
        let mut rng = StdRng::seed_from_u64(42);
        for bits in [2048, 3200, 4096] {
            let group = CyclicGroup::benchmark_group(bits, &mut rng);
            assert_eq!(group.bit_len(), bits);
            assert!(group.p().bit(0));
        }
    }

    #[test]
    fn membership() {
        let group = CyclicGroup::from_hex("65", "2").unwrap();
        assert!(group.bytes_inside(&[&[1], &[100]]));
        assert!(!group.bytes_inside(&[&[1], &[101]]));
        assert!(!group.bytes_inside(&[&[0]]));
        assert!(!group.bytes_inside(&[&[]]));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            assert!(group.inside(&group.random(&mut rng)));
        }
    }

    #[test]
    fn random_bytes_are_fixed_width_members() {
        let mut rng = StdRng::seed_from_u64(8);
        let group = CyclicGroup::benchmark_group(2048, &mut rng);
        for _ in 0..16 {
            let values = group.random_bytes_inside(&mut rng, 3);
            assert_eq!(values.len(), 3);
            for value in &values {
                assert_eq!(value.len(), 256);
                assert!(group.inside(&BigUint::from_bytes_be(value)));
            }
        }

        // 0x65 = 101: a single byte above 100 is rejected, so every draw lands in [1, 100]
        let small = CyclicGroup::from_hex("65", "2").unwrap();
        let values = small.random_bytes_inside(&mut rng, 4);
        assert!(values.iter().all(|v| v.len() == 1 && (1..=100).contains(&v[0])));
        assert!(small.random_bytes_inside(&mut rng, 0).is_empty());
    }
}
