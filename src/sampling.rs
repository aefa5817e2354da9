//! Distributions for secrets, errors and uniform masks.

use crypto_bigint::rand_core::{CryptoRng, RngCore};
use rand::Rng;

use crate::ring::Modulus;

// We approximate the discrete gaussian distribution of variance 10 with the
// centered binomial distribution of variance 10.  So the number of iterations
// and the maximum magnitude is 20.
pub const NOISE_ITERATIONS: usize = 20;

fn sample_binomial(rng: &mut (impl CryptoRng + RngCore), iterations: usize) -> u32 {
    debug_assert!(2 * iterations < u64::BITS as usize);
    let bound: u64 = 1 << (2 * iterations);
    let bits = rng.next_u64() & bound.wrapping_sub(1);
    bits.count_ones()
}

/// `count` samples from the centered binomial distribution with `2 * iterations`
/// coin flips.
pub fn sample_centered_binomial(
    rng: &mut (impl CryptoRng + RngCore),
    count: usize,
    iterations: usize,
) -> Vec<i64> {
    (0..count)
        .map(|_| sample_binomial(rng, iterations) as i64 - iterations as i64)
        .collect()
}

/// Uniform coefficients in `{-1, 0, 1}`.
pub fn sample_ternary(rng: &mut (impl CryptoRng + RngCore), count: usize) -> Vec<i64> {
    (0..count).map(|_| rng.gen_range(-1i64..=1)).collect()
}

/// Fills `out`, a polynomial over `moduli`, with uniform residues.  Rejection
/// sampling keeps the output a deterministic function of the generator's
/// stream, so the same seed always reproduces the same polynomial.
pub fn sample_uniform(rng: &mut (impl CryptoRng + RngCore), moduli: &[Modulus], out: &mut [u64]) {
    let n = out.len() / moduli.len();
    for (row, q) in out.chunks_exact_mut(n).zip(moduli.iter().cycle()) {
        let zone = u64::MAX - u64::MAX % q.value();
        for x in row.iter_mut() {
            *x = loop {
                let candidate = rng.next_u64();
                if candidate < zone {
                    break q.reduce(candidate);
                }
            };
        }
    }
}
