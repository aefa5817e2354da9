//! Coefficient-wise operations on RNS polynomials.  A polynomial over `k`
//! moduli is a slice of `k * n` words; slices holding several polynomials
//! (e.g. all components of a ciphertext) are accepted where noted.

use super::{for_each_chunk, modulus::Modulus, ntt::reverse_bits, NttTables};

#[inline]
fn rows<'a>(poly: &'a [u64], moduli: &'a [Modulus]) -> impl Iterator<Item = (&'a [u64], &'a Modulus)> {
    let n = poly.len() / moduli.len();
    poly.chunks_exact(n).zip(moduli.iter().cycle())
}

#[inline]
fn rows_mut<'a>(
    poly: &'a mut [u64],
    moduli: &'a [Modulus],
) -> impl Iterator<Item = (&'a mut [u64], &'a Modulus)> {
    let n = poly.len() / moduli.len();
    poly.chunks_exact_mut(n).zip(moduli.iter().cycle())
}

pub fn add_assign(a: &mut [u64], b: &[u64], moduli: &[Modulus]) {
    debug_assert_eq!(a.len(), b.len());
    for ((a, q), (b, _)) in rows_mut(a, moduli).zip(rows(b, moduli)) {
        for (x, y) in a.iter_mut().zip(b) {
            *x = q.add(*x, *y);
        }
    }
}

pub fn sub_assign(a: &mut [u64], b: &[u64], moduli: &[Modulus]) {
    debug_assert_eq!(a.len(), b.len());
    for ((a, q), (b, _)) in rows_mut(a, moduli).zip(rows(b, moduli)) {
        for (x, y) in a.iter_mut().zip(b) {
            *x = q.sub(*x, *y);
        }
    }
}

pub fn negate(a: &mut [u64], moduli: &[Modulus]) {
    for (a, q) in rows_mut(a, moduli) {
        for x in a.iter_mut() {
            *x = q.neg(*x);
        }
    }
}

/// Coefficient-wise product, i.e. polynomial product in NTT form.
pub fn mul_assign(a: &mut [u64], b: &[u64], moduli: &[Modulus]) {
    debug_assert_eq!(a.len(), b.len());
    for ((a, q), (b, _)) in rows_mut(a, moduli).zip(rows(b, moduli)) {
        for (x, y) in a.iter_mut().zip(b) {
            *x = q.mul(*x, *y);
        }
    }
}

/// `acc += a * b` coefficient-wise.
pub fn mul_acc(acc: &mut [u64], a: &[u64], b: &[u64], moduli: &[Modulus]) {
    debug_assert!(acc.len() == a.len() && a.len() == b.len());
    for (((acc, q), (a, _)), (b, _)) in rows_mut(acc, moduli).zip(rows(a, moduli)).zip(rows(b, moduli)) {
        for ((z, x), y) in acc.iter_mut().zip(a).zip(b) {
            *z = q.mul_add(*x, *y, *z);
        }
    }
}

/// Multiplies by an integer scalar, reduced separately for each modulus.
pub fn mul_scalar(a: &mut [u64], scalar: u64, moduli: &[Modulus]) {
    for (a, q) in rows_mut(a, moduli) {
        let scalar = q.operand(q.reduce(scalar));
        for x in a.iter_mut() {
            *x = q.mul_operand(*x, &scalar);
        }
    }
}

/// Writes small signed coefficients into every row of `out`.
pub fn set_signed(values: &[i64], moduli: &[Modulus], out: &mut [u64]) {
    for (row, q) in rows_mut(out, moduli) {
        for (x, v) in row.iter_mut().zip(values) {
            *x = q.reduce_i64(*v);
        }
    }
}

/// Forward NTT of every row; `poly` may hold several polynomials over `tables`.
pub fn ntt_forward(poly: &mut [u64], tables: &[NttTables]) {
    let n = tables[0].coeff_count();
    let k = tables.len();
    for_each_chunk(poly, n, |i, row| tables[i % k].forward(row));
}

pub fn ntt_inverse(poly: &mut [u64], tables: &[NttTables]) {
    let n = tables[0].coeff_count();
    let k = tables.len();
    for_each_chunk(poly, n, |i, row| tables[i % k].inverse(row));
}

/// Applies `X -> X^galois_elt` to a polynomial in coefficient form.
pub fn apply_galois(input: &[u64], galois_elt: u32, moduli: &[Modulus], out: &mut [u64]) {
    debug_assert_eq!(input.len(), out.len());
    let n = input.len() / moduli.len();
    let mask = 2 * n - 1;
    for ((input, q), (out, _)) in rows(input, moduli).zip(rows_mut(out, moduli)) {
        let mut index = 0usize;
        for &coeff in input {
            let target = index & mask;
            if target < n {
                out[target] = coeff;
            } else {
                out[target - n] = q.neg(coeff);
            }
            index = index.wrapping_add(galois_elt as usize);
        }
    }
}

/// Index map that realizes `X -> X^galois_elt` on the bit-reversed evaluation
/// order produced by [`NttTables::forward`].
pub fn galois_ntt_permutation(galois_elt: u32, coeff_count_power: u32) -> Vec<usize> {
    let n = 1usize << coeff_count_power;
    let mask = 2 * n - 1;
    (0..n)
        .map(|i| {
            let point = 2 * reverse_bits(i, coeff_count_power) + 1;
            let image = (point * galois_elt as usize) & mask;
            reverse_bits((image - 1) >> 1, coeff_count_power)
        })
        .collect()
}

/// Applies a permutation from [`galois_ntt_permutation`] to every row.
pub fn apply_galois_ntt(input: &[u64], permutation: &[usize], out: &mut [u64]) {
    let n = permutation.len();
    for (input, out) in input.chunks_exact(n).zip(out.chunks_exact_mut(n)) {
        for (x, &source) in out.iter_mut().zip(permutation) {
            *x = input[source];
        }
    }
}

/// Infinity norm of the centered representatives of a single-modulus row.
pub fn max_centered_magnitude(row: &[u64], q: &Modulus) -> u64 {
    row.iter()
        .map(|&x| q.center(x).unsigned_abs())
        .max()
        .unwrap_or(0)
}
