use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ParameterError};

use super::prime::is_prime;

/// Largest bit count accepted for a [`Modulus`].
pub const MOD_BIT_COUNT_MAX: u32 = 61;

/// An integer modulus of at most 61 bits together with the constants needed for
/// Barrett reduction.
///
/// A value of zero is allowed as a sentinel (e.g. the plain modulus of a CKKS
/// parameter set).  Equality, ordering and hashing only look at the value.
#[derive(Clone, Copy, Deserialize, Serialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Modulus {
    value: u64,
    bit_count: u32,
    is_prime: bool,
    // floor(2^128 / value), low and high word.
    const_ratio: [u64; 2],
}

/// A multiplicand with a precomputed Shoup quotient `floor(operand * 2^64 / q)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MulOperand {
    pub operand: u64,
    pub quotient: u64,
}

impl Modulus {
    pub const ZERO: Modulus = Modulus {
        value: 0,
        bit_count: 0,
        is_prime: false,
        const_ratio: [0, 0],
    };

    pub fn new(value: u64) -> Result<Self, Error> {
        if value == 0 {
            return Ok(Self::ZERO);
        }
        let bit_count = u64::BITS - value.leading_zeros();
        if value == 1 || bit_count > MOD_BIT_COUNT_MAX {
            return Err(Error::InvalidParameter(ParameterError::InvalidModulus));
        }
        let ratio = u128::MAX / value as u128;
        Ok(Self {
            value,
            bit_count,
            is_prime: is_prime(value),
            const_ratio: [ratio as u64, (ratio >> 64) as u64],
        })
    }

    #[inline(always)]
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn bit_count(&self) -> u32 {
        self.bit_count
    }

    pub fn uint64_count(&self) -> usize {
        1
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn is_prime(&self) -> bool {
        self.is_prime
    }

    /// Subtracts the modulus once if `x >= q`, without branching on `x`.
    #[inline(always)]
    fn reduce_once(&self, x: u64) -> u64 {
        let (diff, borrow) = x.overflowing_sub(self.value);
        let mask = 0u64.wrapping_sub(borrow as u64);
        diff.wrapping_add(self.value & mask)
    }

    /// Barrett reduction of a 128-bit value.
    #[inline(always)]
    pub fn reduce_u128(&self, x: u128) -> u64 {
        debug_assert!(!self.is_zero());
        let x0 = x as u64;
        let x1 = (x >> 64) as u64;
        let [r0, r1] = self.const_ratio;

        let p00_hi = ((x0 as u128 * r0 as u128) >> 64) as u64;
        let p01 = x0 as u128 * r1 as u128;
        let p10 = x1 as u128 * r0 as u128;
        let mid = p00_hi as u128 + (p01 as u64) as u128 + (p10 as u64) as u128;
        let quotient = ((p01 >> 64) as u64)
            .wrapping_add((p10 >> 64) as u64)
            .wrapping_add((mid >> 64) as u64)
            .wrapping_add(x1.wrapping_mul(r1));

        let remainder = x0.wrapping_sub(quotient.wrapping_mul(self.value));
        self.reduce_once(self.reduce_once(remainder))
    }

    #[inline(always)]
    pub fn reduce(&self, x: u64) -> u64 {
        self.reduce_u128(x as u128)
    }

    /// Reduces a signed value into `[0, q)`.
    #[inline(always)]
    pub fn reduce_i64(&self, x: i64) -> u64 {
        let magnitude = self.reduce(x.unsigned_abs());
        if x < 0 {
            self.neg(magnitude)
        } else {
            magnitude
        }
    }

    #[inline(always)]
    pub fn add(&self, a: u64, b: u64) -> u64 {
        debug_assert!(a < self.value && b < self.value);
        self.reduce_once(a + b)
    }

    #[inline(always)]
    pub fn sub(&self, a: u64, b: u64) -> u64 {
        debug_assert!(a < self.value && b < self.value);
        let (diff, borrow) = a.overflowing_sub(b);
        let mask = 0u64.wrapping_sub(borrow as u64);
        diff.wrapping_add(self.value & mask)
    }

    #[inline(always)]
    pub fn neg(&self, a: u64) -> u64 {
        debug_assert!(a < self.value);
        let nonzero = 0u64.wrapping_sub((a != 0) as u64);
        (self.value - a) & nonzero
    }

    #[inline(always)]
    pub fn mul(&self, a: u64, b: u64) -> u64 {
        self.reduce_u128(a as u128 * b as u128)
    }

    #[inline(always)]
    pub fn mul_add(&self, a: u64, b: u64, c: u64) -> u64 {
        self.reduce_u128(a as u128 * b as u128 + c as u128)
    }

    pub fn operand(&self, operand: u64) -> MulOperand {
        debug_assert!(operand < self.value);
        MulOperand {
            operand,
            quotient: (((operand as u128) << 64) / self.value as u128) as u64,
        }
    }

    /// Shoup multiplication by a precomputed operand.
    #[inline(always)]
    pub fn mul_operand(&self, x: u64, y: &MulOperand) -> u64 {
        let estimate = ((x as u128 * y.quotient as u128) >> 64) as u64;
        let product = x
            .wrapping_mul(y.operand)
            .wrapping_sub(estimate.wrapping_mul(self.value));
        self.reduce_once(product)
    }

    /// This method is constant-time only with respect to `base`.  Depending on
    /// `exp`, timing can and will vary.
    pub fn pow(&self, mut base: u64, mut exp: u64) -> u64 {
        let mut result = self.reduce(1);
        base = self.reduce(base);
        while exp != 0 {
            if exp & 1 == 1 {
                result = self.mul(result, base);
            }
            exp >>= 1;
            base = self.mul(base, base);
        }
        result
    }

    /// Multiplicative inverse, if `a` is invertible modulo this modulus.
    pub fn inverse(&self, a: u64) -> Option<u64> {
        let a = self.reduce(a);
        if a == 0 {
            return None;
        }
        let (mut old_r, mut r) = (a as i128, self.value as i128);
        let (mut old_s, mut s) = (1i128, 0i128);
        while r != 0 {
            let quotient = old_r / r;
            (old_r, r) = (r, old_r - quotient * r);
            (old_s, s) = (s, old_s - quotient * s);
        }
        if old_r != 1 {
            return None;
        }
        Some(old_s.rem_euclid(self.value as i128) as u64)
    }

    /// Maps `x` in `[0, q)` to its centered representative in `(-q/2, q/2]`.
    #[inline(always)]
    pub fn center(&self, x: u64) -> i64 {
        if x > self.value >> 1 {
            x as i64 - self.value as i64
        } else {
            x as i64
        }
    }
}

impl Default for Modulus {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for Modulus {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Modulus {}

impl PartialOrd for Modulus {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Modulus {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for Modulus {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Debug for Modulus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modulus({})", self.value)
    }
}

impl TryFrom<u64> for Modulus {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Modulus> for u64 {
    fn from(modulus: Modulus) -> Self {
        modulus.value
    }
}
