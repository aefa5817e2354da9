use std::collections::BTreeMap;

use num_integer::Integer;

use crate::{
    error::{Error, ParameterError},
    params::SecurityLevel,
};

use super::modulus::Modulus;

pub const POLY_MOD_DEGREE_MIN: usize = 2;
pub const POLY_MOD_DEGREE_MAX: usize = 131072;
pub const COEFF_MOD_COUNT_MAX: usize = 64;
pub const USER_MOD_BIT_COUNT_MIN: u32 = 2;
pub const USER_MOD_BIT_COUNT_MAX: u32 = 60;
pub const PLAIN_MOD_BIT_COUNT_MIN: u32 = 2;
pub const PLAIN_MOD_BIT_COUNT_MAX: u32 = 60;

// These bases make Miller-Rabin deterministic for every 64-bit input.
const MILLER_RABIN_BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    (a as u128 * b as u128 % m as u128) as u64
}

fn pow_mod(mut base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1 % m;
    base %= m;
    while exp != 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

/// Deterministic primality test. Moduli are public, so timing does not matter
/// here.
pub fn is_prime(value: u64) -> bool {
    if value < 2 {
        return false;
    }
    for &p in &MILLER_RABIN_BASES {
        if value % p == 0 {
            return value == p;
        }
    }
    let mut d = value - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }
    'witness: for &a in &MILLER_RABIN_BASES {
        let mut x = pow_mod(a, d, value);
        if x == 1 || x == value - 1 {
            continue;
        }
        for _ in 1..r {
            x = mul_mod(x, x, value);
            if x == value - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Returns `count` distinct primes of exactly `bit_size` bits that are congruent
/// to 1 modulo `factor`, largest first, skipping any value in `exclude`.
pub fn get_primes(
    factor: u64,
    bit_size: u32,
    count: usize,
    exclude: &[u64],
) -> Result<Vec<Modulus>, Error> {
    if !(USER_MOD_BIT_COUNT_MIN..=USER_MOD_BIT_COUNT_MAX).contains(&bit_size) {
        return Err(ParameterError::InvalidCoeffModulusBitCount.into());
    }
    if factor == 0 || factor >= 1 << bit_size {
        return Err(ParameterError::NoPrimeFound.into());
    }
    let lower_bound = 1u64 << (bit_size - 1);
    let mut value = ((1u64 << bit_size) - 1) / factor * factor + 1;
    let mut primes = Vec::with_capacity(count);
    while primes.len() < count && value > lower_bound {
        if !exclude.contains(&value) && is_prime(value) {
            primes.push(Modulus::new(value)?);
        }
        value = match value.checked_sub(factor) {
            Some(v) => v,
            None => break,
        };
    }
    if primes.len() < count {
        return Err(ParameterError::NoPrimeFound.into());
    }
    Ok(primes)
}

fn check_degree(poly_modulus_degree: usize) -> Result<(), Error> {
    if !(POLY_MOD_DEGREE_MIN..=POLY_MOD_DEGREE_MAX).contains(&poly_modulus_degree)
        || !poly_modulus_degree.is_power_of_two()
    {
        return Err(ParameterError::InvalidPolyModulusDegree.into());
    }
    Ok(())
}

fn create_with_factor(
    factor: u64,
    bit_sizes: &[u32],
    exclude: &[u64],
) -> Result<Vec<Modulus>, Error> {
    if bit_sizes.is_empty() || bit_sizes.len() > COEFF_MOD_COUNT_MAX {
        return Err(ParameterError::InvalidCoeffModulusSize.into());
    }
    let mut counts = BTreeMap::<u32, usize>::new();
    for &bits in bit_sizes {
        *counts.entry(bits).or_default() += 1;
    }
    let mut primes_by_size = BTreeMap::new();
    for (bits, count) in counts {
        primes_by_size.insert(bits, get_primes(factor, bits, count, exclude)?.into_iter());
    }
    bit_sizes
        .iter()
        .map(|bits| {
            primes_by_size
                .get_mut(bits)
                .and_then(Iterator::next)
                .ok_or(Error::InvalidParameter(ParameterError::NoPrimeFound))
        })
        .collect()
}

/// Constructors for coefficient modulus chains.
pub struct CoeffModulus;

impl CoeffModulus {
    /// Largest total coefficient modulus bit count that meets `sec_level` for the
    /// given degree, according to the HomomorphicEncryption.org tables.  Returns
    /// 0 for degrees without a table entry.
    pub fn max_bit_count(poly_modulus_degree: usize, sec_level: SecurityLevel) -> u32 {
        let table: [u32; 6] = match sec_level {
            SecurityLevel::None => return u32::MAX,
            SecurityLevel::Tc128 => [27, 54, 109, 218, 438, 881],
            SecurityLevel::Tc192 => [19, 37, 75, 152, 305, 611],
            SecurityLevel::Tc256 => [14, 29, 58, 118, 237, 476],
        };
        match poly_modulus_degree {
            1024 => table[0],
            2048 => table[1],
            4096 => table[2],
            8192 => table[3],
            16384 => table[4],
            32768 => table[5],
            _ => 0,
        }
    }

    /// Default coefficient modulus for BFV and BGV.  The chain uses the whole
    /// bit budget of `sec_level`; the last prime becomes the special prime.
    pub fn bfv_default(
        poly_modulus_degree: usize,
        sec_level: SecurityLevel,
    ) -> Result<Vec<Modulus>, Error> {
        let bit_sizes: &[u32] = match (sec_level, poly_modulus_degree) {
            (SecurityLevel::Tc128, 1024) => &[27],
            (SecurityLevel::Tc128, 2048) => &[54],
            (SecurityLevel::Tc128, 4096) => &[36, 36, 37],
            (SecurityLevel::Tc128, 8192) => &[43, 43, 44, 44, 44],
            (SecurityLevel::Tc128, 16384) => &[48, 48, 48, 49, 49, 49, 49, 49, 49],
            (SecurityLevel::Tc128, 32768) => &[
                55, 55, 55, 55, 55, 55, 55, 55, 55, 55, 55, 55, 55, 55, 55, 56,
            ],
            (SecurityLevel::Tc192, 1024) => &[19],
            (SecurityLevel::Tc192, 2048) => &[37],
            (SecurityLevel::Tc192, 4096) => &[25, 25, 25],
            (SecurityLevel::Tc192, 8192) => &[50, 50, 52],
            (SecurityLevel::Tc192, 16384) => &[50, 50, 50, 51, 52, 52],
            (SecurityLevel::Tc192, 32768) => &[55, 55, 55, 55, 55, 55, 55, 55, 55, 58, 58],
            (SecurityLevel::Tc256, 1024) => &[14],
            (SecurityLevel::Tc256, 2048) => &[29],
            (SecurityLevel::Tc256, 4096) => &[29, 29],
            (SecurityLevel::Tc256, 8192) => &[39, 39, 40],
            (SecurityLevel::Tc256, 16384) => &[47, 47, 47, 48, 48],
            (SecurityLevel::Tc256, 32768) => &[52, 52, 52, 52, 52, 52, 52, 52, 60],
            _ => return Err(ParameterError::InvalidPolyModulusDegree.into()),
        };
        Self::create(poly_modulus_degree, bit_sizes)
    }

    /// NTT-friendly primes (`q = 1 mod 2n`) of the requested sizes, in the order
    /// of `bit_sizes`.
    pub fn create(poly_modulus_degree: usize, bit_sizes: &[u32]) -> Result<Vec<Modulus>, Error> {
        check_degree(poly_modulus_degree)?;
        create_with_factor(2 * poly_modulus_degree as u64, bit_sizes, &[])
    }

    /// Like [`CoeffModulus::create`], but the primes are also congruent to 1
    /// modulo `plain_modulus` and never equal to it.
    pub fn create_with_plain_modulus(
        poly_modulus_degree: usize,
        plain_modulus: &Modulus,
        bit_sizes: &[u32],
    ) -> Result<Vec<Modulus>, Error> {
        check_degree(poly_modulus_degree)?;
        if plain_modulus.is_zero() {
            return Err(ParameterError::InvalidPlainModulusBitCount.into());
        }
        let factor = (2 * poly_modulus_degree as u64).lcm(&plain_modulus.value());
        create_with_factor(factor, bit_sizes, &[plain_modulus.value()])
    }
}

/// Constructors for plain moduli.
pub struct PlainModulus;

impl PlainModulus {
    /// A prime plain modulus that enables batching for the given degree.
    pub fn batching(poly_modulus_degree: usize, bit_size: u32) -> Result<Modulus, Error> {
        let mut primes = CoeffModulus::create(poly_modulus_degree, &[bit_size])?;
        primes.pop().ok_or(Error::InvalidParameter(ParameterError::NoPrimeFound))
    }

    pub fn batching_many(
        poly_modulus_degree: usize,
        bit_sizes: &[u32],
    ) -> Result<Vec<Modulus>, Error> {
        CoeffModulus::create(poly_modulus_degree, bit_sizes)
    }
}
