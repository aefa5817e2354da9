//! Slot encoding for BFV and BGV.
//!
//! With a prime plain modulus `t = 1 mod 2n`, a plaintext polynomial is
//! determined by its evaluations at the `n` primitive `2n`-th roots of unity
//! modulo `t`.  These evaluations are the slots, arranged as a 2 x n/2 matrix:
//! row `r`, column `c` holds the evaluation at `psi^(+-3^c)`.  The Galois
//! element `3^k` then rotates both rows left by `k` and `2n - 1` swaps them.

use crate::{
    context::Context,
    error::{EncodingError, Error, ParameterError},
    params::SchemeType,
    plaintext::Plaintext,
    ring::{ntt::reverse_bits, Modulus, NttTables},
};

/// Position of every slot in the bit-reversed output of the forward NTT.
/// Shared with the CKKS encoder, whose slots use the same generator.
pub(crate) fn slot_index_map(coeff_count_power: u32) -> Vec<usize> {
    let n = 1usize << coeff_count_power;
    let slots = n / 2;
    let m = 2 * n;
    let mut map = vec![0; n];
    let mut pos = 1usize;
    for i in 0..slots {
        map[i] = reverse_bits((pos - 1) >> 1, coeff_count_power);
        map[slots + i] = reverse_bits((m - pos - 1) >> 1, coeff_count_power);
        pos = (pos * 3) & (m - 1);
    }
    map
}

#[derive(Debug)]
pub struct BatchEncoder {
    plain_modulus: Modulus,
    tables: NttTables,
    index_map: Vec<usize>,
}

impl BatchEncoder {
    pub fn new(context: &Context) -> Result<Self, Error> {
        let data = context.first_data()?;
        if !matches!(data.scheme(), SchemeType::Bfv | SchemeType::Bgv) {
            return Err(ParameterError::InvalidScheme.into());
        }
        let tables = data
            .plain_ntt_tables()
            .ok_or(Error::InvalidParameter(ParameterError::BatchingUnavailable))?
            .clone();
        Ok(Self {
            plain_modulus: *data.plain_modulus(),
            index_map: slot_index_map(data.coeff_count_power()),
            tables,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.tables.coeff_count()
    }

    fn encode_slots(&self, values: impl ExactSizeIterator<Item = u64>) -> Result<Plaintext, Error> {
        if values.len() > self.slot_count() {
            return Err(EncodingError::TooManyValues.into());
        }
        let mut coeffs = vec![0; self.slot_count()];
        for (&index, value) in self.index_map.iter().zip(values) {
            coeffs[index] = value;
        }
        self.tables.inverse(&mut coeffs);
        Ok(Plaintext::from_coeffs(coeffs))
    }

    /// Values go to the slots in row-major order; missing slots are zero.
    pub fn encode_u64(&self, values: &[u64]) -> Result<Plaintext, Error> {
        let t = self.plain_modulus.value();
        if values.iter().any(|&x| x >= t) {
            return Err(EncodingError::ValueOutOfRange.into());
        }
        self.encode_slots(values.iter().copied())
    }

    /// Values must lie in `[-(t-1)/2, (t-1)/2]`.
    pub fn encode_i64(&self, values: &[i64]) -> Result<Plaintext, Error> {
        let bound = (self.plain_modulus.value() - 1) / 2;
        if values.iter().any(|x| x.unsigned_abs() > bound) {
            return Err(EncodingError::ValueOutOfRange.into());
        }
        let t = &self.plain_modulus;
        self.encode_slots(values.iter().map(|&x| t.reduce_i64(x)))
    }

    fn decode_slots(&self, plain: &Plaintext) -> Result<Vec<u64>, Error> {
        if plain.is_ntt_form() {
            return Err(Error::InvalidOperand("plaintext is in NTT form"));
        }
        let t = self.plain_modulus.value();
        if plain.coeff_count() > self.slot_count() || plain.data().iter().any(|&x| x >= t) {
            return Err(Error::InvalidOperand("plaintext is not valid for the plain modulus"));
        }
        let mut values = plain.data().to_vec();
        values.resize(self.slot_count(), 0);
        self.tables.forward(&mut values);
        Ok(self.index_map.iter().map(|&index| values[index]).collect())
    }

    pub fn decode_u64(&self, plain: &Plaintext) -> Result<Vec<u64>, Error> {
        self.decode_slots(plain)
    }

    pub fn decode_i64(&self, plain: &Plaintext) -> Result<Vec<i64>, Error> {
        let t = &self.plain_modulus;
        Ok(self
            .decode_slots(plain)?
            .into_iter()
            .map(|x| t.center(x))
            .collect())
    }
}
