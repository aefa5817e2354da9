use num_bigint::{BigInt, BigUint, Sign};
use num_integer::Integer;
use num_traits::{ToPrimitive, Zero};

use crate::error::{Error, ParameterError};

use super::modulus::{Modulus, MulOperand};

/// A set of pairwise coprime moduli with the constants for CRT composition and
/// for dividing out the last modulus.
#[derive(Clone, Debug)]
pub struct RnsBase {
    moduli: Vec<Modulus>,
    product: BigUint,
    half_product: BigUint,
    punctured_products: Vec<BigUint>,
    inv_punctured_products: Vec<MulOperand>,
    // (q_last)^-1 mod q_i for every modulus but the last one.
    inv_last: Vec<MulOperand>,
}

impl RnsBase {
    pub fn new(moduli: &[Modulus]) -> Result<Self, Error> {
        if moduli.is_empty() || moduli.iter().any(Modulus::is_zero) {
            return Err(ParameterError::FailedCreatingRnsBase.into());
        }
        for (i, qi) in moduli.iter().enumerate() {
            for qj in &moduli[..i] {
                if qi.value().gcd(&qj.value()) != 1 {
                    return Err(ParameterError::FailedCreatingRnsBase.into());
                }
            }
        }

        let product = moduli
            .iter()
            .fold(BigUint::from(1u64), |acc, q| acc * q.value());
        let mut punctured_products = Vec::with_capacity(moduli.len());
        let mut inv_punctured_products = Vec::with_capacity(moduli.len());
        for (i, qi) in moduli.iter().enumerate() {
            punctured_products.push(&product / qi.value());
            let punctured_mod_qi = moduli
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .fold(qi.reduce(1), |acc, (_, qj)| qi.mul(acc, qi.reduce(qj.value())));
            let inverse = qi
                .inverse(punctured_mod_qi)
                .ok_or(Error::InvalidParameter(ParameterError::FailedCreatingRnsBase))?;
            inv_punctured_products.push(qi.operand(inverse));
        }

        let (last, rest) = moduli
            .split_last()
            .ok_or(Error::InvalidParameter(ParameterError::FailedCreatingRnsBase))?;
        let inv_last = rest
            .iter()
            .map(|qi| {
                qi.inverse(last.value())
                    .map(|inverse| qi.operand(inverse))
                    .ok_or(Error::InvalidParameter(ParameterError::FailedCreatingRnsBase))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            moduli: moduli.to_vec(),
            half_product: &product >> 1,
            product,
            punctured_products,
            inv_punctured_products,
            inv_last,
        })
    }

    pub fn len(&self) -> usize {
        self.moduli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moduli.is_empty()
    }

    pub fn moduli(&self) -> &[Modulus] {
        &self.moduli
    }

    pub fn product(&self) -> &BigUint {
        &self.product
    }

    pub fn product_bit_count(&self) -> u32 {
        self.product.bits() as u32
    }

    /// The integer in `[0, Q)` with the given residues (`residues[i]` belongs to
    /// modulus `i`).
    pub fn compose(&self, residues: impl IntoIterator<Item = u64>) -> BigUint {
        let mut acc = BigUint::zero();
        for (((residue, q), inverse), punctured) in residues
            .into_iter()
            .zip(&self.moduli)
            .zip(&self.inv_punctured_products)
            .zip(&self.punctured_products)
        {
            acc += punctured * q.mul_operand(residue, inverse);
        }
        acc % &self.product
    }

    /// Centered lift into `(-Q/2, Q/2]`.
    pub fn compose_centered(&self, residues: impl IntoIterator<Item = u64>) -> BigInt {
        let value = self.compose(residues);
        if value > self.half_product {
            BigInt::from(value) - BigInt::from(self.product.clone())
        } else {
            BigInt::from(value)
        }
    }

    /// Composes every coefficient of a polynomial over this base.
    pub fn compose_poly(&self, poly: &[u64]) -> Vec<BigUint> {
        let n = poly.len() / self.len();
        (0..n)
            .map(|j| self.compose((0..self.len()).map(|i| poly[i * n + j])))
            .collect()
    }

    pub fn compose_poly_centered(&self, poly: &[u64]) -> Vec<BigInt> {
        let n = poly.len() / self.len();
        (0..n)
            .map(|j| self.compose_centered((0..self.len()).map(|i| poly[i * n + j])))
            .collect()
    }

    /// Reduces signed integers into a polynomial over this base.
    pub fn decompose_poly(&self, values: &[BigInt], out: &mut [u64]) {
        let n = values.len();
        debug_assert_eq!(out.len(), n * self.len());
        for (q, row) in self.moduli.iter().zip(out.chunks_exact_mut(n)) {
            for (x, value) in row.iter_mut().zip(values) {
                let magnitude = (value.magnitude() % q.value()).to_u64().unwrap_or_default();
                *x = match value.sign() {
                    Sign::Minus => q.neg(magnitude),
                    _ => magnitude,
                };
            }
        }
    }

    /// `round(x / q_last)` for a polynomial in coefficient form over this base,
    /// written over all moduli but the last.
    pub fn divide_and_round_q_last(&self, input: &[u64], out: &mut [u64]) {
        let k = self.len();
        let n = input.len() / k;
        debug_assert_eq!(out.len(), (k - 1) * n);
        let q_last = &self.moduli[k - 1];
        let last = &input[(k - 1) * n..];
        let half = q_last.value() >> 1;

        for (i, (qi, inverse)) in self.moduli.iter().zip(&self.inv_last).enumerate() {
            let half_mod = qi.reduce(half);
            let row = &input[i * n..(i + 1) * n];
            for ((x, &c), &c_last) in out[i * n..(i + 1) * n].iter_mut().zip(row).zip(last) {
                let remainder = qi.sub(qi.reduce(q_last.add(c_last, half)), half_mod);
                *x = qi.mul_operand(qi.sub(c, remainder), inverse);
            }
        }
    }

    /// Divides by `q_last` after subtracting the smallest multiple of
    /// `plain_modulus` that makes the division exact.  The result is congruent
    /// to `x * q_last^-1` modulo `plain_modulus`.
    pub fn mod_t_and_divide_q_last(
        &self,
        input: &[u64],
        plain_modulus: &Modulus,
        out: &mut [u64],
    ) -> Result<(), Error> {
        let k = self.len();
        let n = input.len() / k;
        debug_assert_eq!(out.len(), (k - 1) * n);
        let q_last = &self.moduli[k - 1];
        let last = &input[(k - 1) * n..];
        let inv_t = q_last
            .inverse(plain_modulus.value())
            .ok_or(Error::InvalidParameter(ParameterError::InvalidPlainModulusCoprimality))?;
        let correction: Vec<i64> = last
            .iter()
            .map(|&c| q_last.center(q_last.mul(c, inv_t)))
            .collect();

        for (i, (qi, inverse)) in self.moduli.iter().zip(&self.inv_last).enumerate() {
            let t_mod = qi.reduce(plain_modulus.value());
            let row = &input[i * n..(i + 1) * n];
            for ((x, &c), &v) in out[i * n..(i + 1) * n].iter_mut().zip(row).zip(&correction) {
                let delta = qi.mul(t_mod, qi.reduce_i64(v));
                *x = qi.mul_operand(qi.sub(c, delta), inverse);
            }
        }
        Ok(())
    }
}
