use crate::error::{Error, ParameterError};

use super::modulus::{Modulus, MulOperand};

#[inline]
pub fn reverse_bits(value: usize, bit_count: u32) -> usize {
    if bit_count == 0 {
        0
    } else {
        value.reverse_bits() >> (usize::BITS - bit_count)
    }
}

/// Smallest primitive `degree`-th root of unity modulo a prime, where `degree`
/// is a power of two.
pub fn minimal_primitive_root(degree: u64, modulus: &Modulus) -> Option<u64> {
    let q = modulus.value();
    if degree < 2 || !modulus.is_prime() || (q - 1) % degree != 0 {
        return None;
    }
    let cofactor = (q - 1) / degree;
    let half = degree / 2;
    let root = (2..q)
        .map(|x| modulus.pow(x, cofactor))
        .find(|&r| modulus.pow(r, half) == q - 1)?;
    // Every primitive root is an odd power of `root`.
    let root_squared = modulus.mul(root, root);
    let mut power = root;
    let mut minimal = root;
    for _ in 0..half {
        minimal = minimal.min(power);
        power = modulus.mul(power, root_squared);
    }
    Some(minimal)
}

/// Precomputed tables for the negacyclic NTT over one prime.
///
/// The forward transform maps coefficients in natural order to evaluations at
/// `psi^(2 * bitrev(i) + 1)` stored at index `i`.
#[derive(Clone, Debug)]
pub struct NttTables {
    modulus: Modulus,
    coeff_count_power: u32,
    root: u64,
    // psi^bitrev(i) and psi^-bitrev(i)
    root_powers: Vec<MulOperand>,
    inv_root_powers: Vec<MulOperand>,
    inv_degree: MulOperand,
}

impl NttTables {
    pub fn new(coeff_count_power: u32, modulus: &Modulus) -> Result<Self, Error> {
        let n = 1usize << coeff_count_power;
        let root = minimal_primitive_root(2 * n as u64, modulus)
            .ok_or(Error::InvalidParameter(ParameterError::InvalidCoeffModulusNoNtt))?;
        let inv_root = modulus
            .inverse(root)
            .ok_or(Error::InvalidParameter(ParameterError::InvalidCoeffModulusNoNtt))?;

        let mut root_powers = vec![MulOperand::default(); n];
        let mut inv_root_powers = vec![MulOperand::default(); n];
        let mut power = 1;
        let mut inv_power = 1;
        for i in 0..n {
            let index = reverse_bits(i, coeff_count_power);
            root_powers[index] = modulus.operand(power);
            inv_root_powers[index] = modulus.operand(inv_power);
            power = modulus.mul(power, root);
            inv_power = modulus.mul(inv_power, inv_root);
        }
        let inv_degree = modulus
            .inverse(n as u64)
            .ok_or(Error::InvalidParameter(ParameterError::InvalidCoeffModulusNoNtt))?;

        Ok(Self {
            modulus: *modulus,
            coeff_count_power,
            root,
            root_powers,
            inv_root_powers,
            inv_degree: modulus.operand(inv_degree),
        })
    }

    pub fn modulus(&self) -> &Modulus {
        &self.modulus
    }

    pub fn coeff_count(&self) -> usize {
        1 << self.coeff_count_power
    }

    pub fn coeff_count_power(&self) -> u32 {
        self.coeff_count_power
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// In-place Cooley-Tukey transform, output in bit-reversed order.
    pub fn forward(&self, values: &mut [u64]) {
        let n = self.coeff_count();
        debug_assert_eq!(values.len(), n);
        let q = &self.modulus;
        let mut gap = n;
        let mut m = 1;
        while m < n {
            gap >>= 1;
            for i in 0..m {
                let root = &self.root_powers[m + i];
                let (lhs, rhs) = values[2 * i * gap..2 * (i + 1) * gap].split_at_mut(gap);
                for (x, y) in lhs.iter_mut().zip(rhs.iter_mut()) {
                    let u = *x;
                    let v = q.mul_operand(*y, root);
                    *x = q.add(u, v);
                    *y = q.sub(u, v);
                }
            }
            m <<= 1;
        }
    }

    /// In-place Gentleman-Sande transform, input in bit-reversed order.
    pub fn inverse(&self, values: &mut [u64]) {
        let n = self.coeff_count();
        debug_assert_eq!(values.len(), n);
        let q = &self.modulus;
        let mut gap = 1;
        let mut m = n;
        while m > 1 {
            let h = m >> 1;
            for i in 0..h {
                let root = &self.inv_root_powers[h + i];
                let (lhs, rhs) = values[2 * i * gap..2 * (i + 1) * gap].split_at_mut(gap);
                for (x, y) in lhs.iter_mut().zip(rhs.iter_mut()) {
                    let u = *x;
                    let v = *y;
                    *x = q.add(u, v);
                    *y = q.mul_operand(q.sub(u, v), root);
                }
            }
            gap <<= 1;
            m = h;
        }
        for x in values.iter_mut() {
            *x = q.mul_operand(*x, &self.inv_degree);
        }
    }
}
