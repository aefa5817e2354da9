//! Canonical embedding for CKKS.
//!
//! A real polynomial is identified with its evaluations at the primitive
//! `2n`-th complex roots of unity.  Evaluations at conjugate roots are
//! conjugate, so `n/2` of them determine the polynomial; these are the slots.
//! Encoding runs the inverse transform, scales and rounds.

use std::f64::consts::PI;

use num_bigint::BigInt;
use num_complex::Complex64;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

use crate::{
    batch_encoder::slot_index_map,
    context::{Context, ContextData},
    error::{EncodingError, Error, ParameterError},
    params::{ParmsId, SchemeType},
    plaintext::Plaintext,
    ring::{ntt::reverse_bits, poly},
};

// Above this magnitude rounded coefficients no longer fit an i64 comfortably.
const I64_LIMIT: f64 = (1u64 << 62) as f64;

#[derive(Debug)]
pub struct CkksEncoder {
    context: Context,
    coeff_count_power: u32,
    index_map: Vec<usize>,
    // psi^bitrev(i) and its conjugate for psi = exp(i pi / n)
    root_powers: Vec<Complex64>,
    inv_root_powers: Vec<Complex64>,
}

impl CkksEncoder {
    pub fn new(context: &Context) -> Result<Self, Error> {
        let data = context.first_data()?;
        if data.scheme() != SchemeType::Ckks {
            return Err(ParameterError::InvalidScheme.into());
        }
        let power = data.coeff_count_power();
        let n = 1usize << power;
        let mut root_powers = vec![Complex64::zero(); n];
        let mut inv_root_powers = vec![Complex64::zero(); n];
        for i in 0..n {
            let root = Complex64::from_polar(1.0, PI * i as f64 / n as f64);
            let index = reverse_bits(i, power);
            root_powers[index] = root;
            inv_root_powers[index] = root.conj();
        }
        Ok(Self {
            context: context.clone(),
            coeff_count_power: power,
            index_map: slot_index_map(power),
            root_powers,
            inv_root_powers,
        })
    }

    pub fn slot_count(&self) -> usize {
        (1 << self.coeff_count_power) / 2
    }

    fn forward(&self, values: &mut [Complex64]) {
        let n = values.len();
        let mut gap = n;
        let mut m = 1;
        while m < n {
            gap >>= 1;
            for i in 0..m {
                let root = self.root_powers[m + i];
                let (lhs, rhs) = values[2 * i * gap..2 * (i + 1) * gap].split_at_mut(gap);
                for (x, y) in lhs.iter_mut().zip(rhs.iter_mut()) {
                    let u = *x;
                    let v = *y * root;
                    *x = u + v;
                    *y = u - v;
                }
            }
            m <<= 1;
        }
    }

    fn inverse(&self, values: &mut [Complex64]) {
        let n = values.len();
        let mut gap = 1;
        let mut m = n;
        while m > 1 {
            let h = m >> 1;
            for i in 0..h {
                let root = self.inv_root_powers[h + i];
                let (lhs, rhs) = values[2 * i * gap..2 * (i + 1) * gap].split_at_mut(gap);
                for (x, y) in lhs.iter_mut().zip(rhs.iter_mut()) {
                    let u = *x;
                    let v = *y;
                    *x = u + v;
                    *y = (u - v) * root;
                }
            }
            gap <<= 1;
            m = h;
        }
        let inv_n = 1.0 / n as f64;
        for x in values.iter_mut() {
            *x *= inv_n;
        }
    }

    fn check_scale(scale: f64, data: &ContextData) -> Result<(), Error> {
        if !(scale.is_finite() && scale > 0.0)
            || scale.log2().floor() as i64 + 1 >= data.total_coeff_modulus_bit_count() as i64
        {
            return Err(EncodingError::InvalidScale.into());
        }
        Ok(())
    }

    /// Reduces rounded coefficients into the level and transforms to NTT form.
    fn encode_coeffs(
        &self,
        coeffs: &[f64],
        data: &ContextData,
        scale: f64,
    ) -> Result<Plaintext, Error> {
        let max = coeffs.iter().fold(0.0f64, |max, x| max.max(x.abs()));
        if !max.is_finite() || max.max(1.0).log2().ceil() as u32 >= data.total_coeff_modulus_bit_count() {
            return Err(EncodingError::Overflow.into());
        }

        let n = coeffs.len();
        let mut out = vec![0; n * data.coeff_modulus_size()];
        if max < I64_LIMIT {
            for (row, q) in out.chunks_exact_mut(n).zip(data.coeff_modulus()) {
                for (x, &c) in row.iter_mut().zip(coeffs) {
                    *x = q.reduce_i64(c as i64);
                }
            }
        } else {
            let values: Vec<BigInt> = coeffs
                .iter()
                .map(|&c| BigInt::from_f64(c).unwrap_or_default())
                .collect();
            data.rns_base().decompose_poly(&values, &mut out);
        }
        poly::ntt_forward(&mut out, data.ntt_tables());
        Ok(Plaintext::from_ntt(out, data.parms_id(), scale))
    }

    /// Encodes up to `slot_count` values at `parms_id`; missing slots are zero.
    pub fn encode_complex(
        &self,
        values: &[Complex64],
        parms_id: &ParmsId,
        scale: f64,
    ) -> Result<Plaintext, Error> {
        let slots = self.slot_count();
        if values.len() > slots {
            return Err(EncodingError::TooManyValues.into());
        }
        let data = self.context.data(parms_id)?;
        Self::check_scale(scale, &data)?;

        let mut buffer = vec![Complex64::zero(); 2 * slots];
        for (i, z) in values.iter().enumerate() {
            buffer[self.index_map[i]] = *z;
            buffer[self.index_map[slots + i]] = z.conj();
        }
        self.inverse(&mut buffer);
        let coeffs: Vec<f64> = buffer.iter().map(|z| (z.re * scale).round()).collect();
        self.encode_coeffs(&coeffs, &data, scale)
    }

    pub fn encode_f64(&self, values: &[f64], parms_id: &ParmsId, scale: f64) -> Result<Plaintext, Error> {
        let values: Vec<Complex64> = values.iter().map(|&x| Complex64::new(x, 0.0)).collect();
        self.encode_complex(&values, parms_id, scale)
    }

    /// Puts `value` in every slot.  This is a constant polynomial.
    pub fn encode_scalar_f64(&self, value: f64, parms_id: &ParmsId, scale: f64) -> Result<Plaintext, Error> {
        let data = self.context.data(parms_id)?;
        Self::check_scale(scale, &data)?;
        let mut coeffs = vec![0.0; 2 * self.slot_count()];
        coeffs[0] = (value * scale).round();
        self.encode_coeffs(&coeffs, &data, scale)
    }

    pub fn encode_scalar_complex(
        &self,
        value: Complex64,
        parms_id: &ParmsId,
        scale: f64,
    ) -> Result<Plaintext, Error> {
        self.encode_complex(&vec![value; self.slot_count()], parms_id, scale)
    }

    /// Puts the integer `value` in every slot with scale 1.
    pub fn encode_i64(&self, value: i64, parms_id: &ParmsId) -> Result<Plaintext, Error> {
        let data = self.context.data(parms_id)?;
        if u64::BITS - value.unsigned_abs().leading_zeros() >= data.total_coeff_modulus_bit_count() {
            return Err(EncodingError::Overflow.into());
        }
        let n = data.poly_modulus_degree();
        let mut out = vec![0; n * data.coeff_modulus_size()];
        for (row, q) in out.chunks_exact_mut(n).zip(data.coeff_modulus()) {
            row.fill(q.reduce_i64(value));
        }
        Ok(Plaintext::from_ntt(out, *parms_id, 1.0))
    }

    pub fn decode_complex(&self, plain: &Plaintext) -> Result<Vec<Complex64>, Error> {
        if !plain.is_ntt_form() {
            return Err(Error::InvalidOperand("plaintext is not in NTT form"));
        }
        let data = self.context.data(&plain.parms_id())?;
        let n = data.poly_modulus_degree();
        if plain.coeff_count() != n * data.coeff_modulus_size() {
            return Err(Error::InvalidOperand("plaintext size does not match its level"));
        }
        let scale = plain.scale();
        if !(scale.is_finite() && scale > 0.0) {
            return Err(EncodingError::InvalidScale.into());
        }

        let mut coeffs = plain.data().to_vec();
        poly::ntt_inverse(&mut coeffs, data.ntt_tables());
        let mut buffer: Vec<Complex64> = if data.coeff_modulus_size() == 1 {
            let q = &data.coeff_modulus()[0];
            coeffs
                .iter()
                .map(|&x| Complex64::new(q.center(x) as f64 / scale, 0.0))
                .collect()
        } else {
            data.rns_base()
                .compose_poly_centered(&coeffs)
                .iter()
                .map(|x| Complex64::new(x.to_f64().unwrap_or_default() / scale, 0.0))
                .collect()
        };
        self.forward(&mut buffer);
        Ok(self.index_map[..self.slot_count()]
            .iter()
            .map(|&index| buffer[index])
            .collect())
    }

    /// Real parts of the slots.
    pub fn decode_f64(&self, plain: &Plaintext) -> Result<Vec<f64>, Error> {
        Ok(self.decode_complex(plain)?.into_iter().map(|z| z.re).collect())
    }
}
