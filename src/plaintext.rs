use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    error::{Error, LoadError},
    params::{ParmsId, SchemeType},
    serialization::Persist,
};

/// A polynomial message.  In coefficient form it holds up to `n` coefficients
/// modulo the plain modulus and has a zero [`ParmsId`]; in NTT form (CKKS, or
/// after [`Evaluator::transform_plain_to_ntt`](crate::evaluator::Evaluator))
/// it holds one row per modulus of the level named by its `parms_id`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Plaintext {
    parms_id: ParmsId,
    scale: f64,
    data: Vec<u64>,
}

impl Plaintext {
    pub fn new() -> Self {
        Self {
            parms_id: ParmsId::ZERO,
            scale: 1.0,
            data: Vec::new(),
        }
    }

    pub fn with_coeff_count(coeff_count: usize) -> Self {
        Self::from_coeffs(vec![0; coeff_count])
    }

    pub fn from_coeffs(coeffs: Vec<u64>) -> Self {
        Self {
            data: coeffs,
            ..Self::new()
        }
    }

    pub(crate) fn from_ntt(data: Vec<u64>, parms_id: ParmsId, scale: f64) -> Self {
        Self {
            parms_id,
            scale,
            data,
        }
    }

    pub fn coeff_count(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// One past the highest nonzero coefficient.
    pub fn significant_coeff_count(&self) -> usize {
        self.data
            .iter()
            .rposition(|&x| x != 0)
            .map_or(0, |index| index + 1)
    }

    pub fn nonzero_coeff_count(&self) -> usize {
        self.data.iter().filter(|&&x| x != 0).count()
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&x| x == 0)
    }

    pub fn is_ntt_form(&self) -> bool {
        !self.parms_id.is_zero()
    }

    pub fn parms_id(&self) -> ParmsId {
        self.parms_id
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn data(&self) -> &[u64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u64] {
        &mut self.data
    }

    /// New coefficients are zero.
    pub fn resize(&mut self, coeff_count: usize) {
        self.data.resize(coeff_count, 0);
    }

    pub fn reserve(&mut self, capacity: usize) {
        self.data
            .reserve(capacity.saturating_sub(self.data.len()));
    }

    pub fn shrink_to_fit(&mut self) {
        self.data.shrink_to_fit();
    }

    /// Drops all coefficients and the allocation.
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.parms_id = ParmsId::ZERO;
        self.scale = 1.0;
    }

    pub fn set_zero(&mut self) {
        self.data.fill(0);
    }

    /// Zeroes coefficients `start..` .
    pub fn set_zero_from(&mut self, start: usize) {
        let start = start.min(self.data.len());
        self.data[start..].fill(0);
    }

    pub fn set_zero_range(&mut self, start: usize, count: usize) -> Result<(), Error> {
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::InvalidOperand("range exceeds the coefficient count"))?;
        self.data[start..end].fill(0);
        Ok(())
    }

    pub(crate) fn set_parms_id(&mut self, parms_id: ParmsId) {
        self.parms_id = parms_id;
    }
}

impl Default for Plaintext {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for Plaintext {
    type Output = u64;

    fn index(&self, index: usize) -> &u64 {
        &self.data[index]
    }
}

impl IndexMut<usize> for Plaintext {
    fn index_mut(&mut self, index: usize) -> &mut u64 {
        &mut self.data[index]
    }
}

/// Trailing zero coefficients do not count.
impl PartialEq for Plaintext {
    fn eq(&self, other: &Self) -> bool {
        let count = self.significant_coeff_count();
        self.parms_id == other.parms_id
            && self.scale == other.scale
            && count == other.significant_coeff_count()
            && self.data[..count] == other.data[..count]
    }
}

/// Hexadecimal coefficients from the highest power down, e.g.
/// `7FFx^3 + 1x^1 + 3`.
impl fmt::Display for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.significant_coeff_count();
        if count == 0 {
            return write!(f, "0");
        }
        let mut first = true;
        for power in (0..count).rev() {
            let coeff = self.data[power];
            if coeff == 0 {
                continue;
            }
            if !first {
                write!(f, " + ")?;
            }
            first = false;
            write!(f, "{:X}", coeff)?;
            if power > 0 {
                write!(f, "x^{}", power)?;
            }
        }
        Ok(())
    }
}

fn parse_term(term: &str) -> Option<(usize, u64)> {
    let (coeff, power) = match term.split_once("x^") {
        Some((coeff, power)) => {
            if power.is_empty() || !power.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            (coeff, power.parse().ok()?)
        }
        None => (term, 0),
    };
    if coeff.is_empty() || !coeff.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((power, u64::from_str_radix(coeff, 16).ok()?))
}

impl FromStr for Plaintext {
    type Err = Error;

    /// Parses the format written by [`Display`](fmt::Display).  Powers must
    /// strictly decrease.
    fn from_str(s: &str) -> Result<Self, Error> {
        const INVALID: Error = Error::InvalidOperand("invalid polynomial string");
        let s = s.trim();
        if s == "0" {
            return Ok(Self::new());
        }
        let mut coeffs = Vec::new();
        let mut last_power = None;
        for term in s.split(" + ") {
            let (power, coeff) = parse_term(term).ok_or(INVALID)?;
            if last_power.is_some_and(|last| power >= last) {
                return Err(INVALID);
            }
            if coeffs.is_empty() {
                coeffs.resize(power + 1, 0);
            }
            coeffs[power] = coeff;
            last_power = Some(power);
        }
        Ok(Self::from_coeffs(coeffs))
    }
}

impl Persist for Plaintext {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        if !context.parameters_set() {
            return Err(LoadError::ForeignParameters);
        }
        let parms = context.parameters();
        if !self.is_ntt_form() {
            if parms.scheme() == SchemeType::Ckks
                || self.data.len() > parms.poly_modulus_degree()
                || self.scale != 1.0
            {
                return Err(LoadError::InvalidData);
            }
            let t = parms.plain_modulus().value();
            if self.data.iter().any(|&x| x >= t) {
                return Err(LoadError::InvalidData);
            }
            return Ok(());
        }

        let data = context
            .get_context_data(&self.parms_id)
            .ok_or(LoadError::ForeignParameters)?;
        let n = data.poly_modulus_degree();
        if self.data.len() != n * data.coeff_modulus_size() {
            return Err(LoadError::InvalidData);
        }
        for (row, q) in self.data.chunks_exact(n).zip(data.coeff_modulus()) {
            if row.iter().any(|&x| x >= q.value()) {
                return Err(LoadError::InvalidData);
            }
        }
        if parms.scheme() == SchemeType::Ckks && !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(LoadError::InvalidData);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{context::tests::bfv_context, serialization::ComprMode};

    use super::*;

    #[test]
    fn coefficient_counts() {
        let mut plain = Plaintext::from_coeffs(vec![3, 0, 5, 0, 0]);
        assert_eq!(plain.coeff_count(), 5);
        assert_eq!(plain.significant_coeff_count(), 3);
        assert_eq!(plain.nonzero_coeff_count(), 2);
        assert!(!plain.is_zero());
        assert!(!plain.is_ntt_form());

        plain.set_zero_range(2, 2).unwrap();
        assert_eq!(plain.significant_coeff_count(), 1);
        assert!(plain.set_zero_range(4, 2).is_err());
        plain.set_zero_from(0);
        assert!(plain.is_zero());

        plain.reserve(64);
        assert!(plain.capacity() >= 64);
        plain.release();
        assert_eq!(plain.coeff_count(), 0);
        assert_eq!(plain.capacity(), 0);
    }

    #[test]
    fn hex_string_format() {
        let plain = Plaintext::from_coeffs(vec![3, 1, 0, 0x7FF, 0]);
        assert_eq!(plain.to_string(), "7FFx^3 + 1x^1 + 3");
        assert_eq!("7FFx^3 + 1x^1 + 3".parse::<Plaintext>().unwrap(), plain);
        assert_eq!(Plaintext::new().to_string(), "0");
        assert!("0".parse::<Plaintext>().unwrap().is_zero());
        assert_eq!("Ax^2".parse::<Plaintext>().unwrap()[2], 10);

        for bad in ["", "1 + 1x^1", "x^2", "1x^", "1y^2", "+1", "1x^2 +3", "Gx^1"] {
            assert!(bad.parse::<Plaintext>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn equality_ignores_trailing_zeros() {
        let mut a = Plaintext::from_coeffs(vec![1, 2]);
        let b = Plaintext::from_coeffs(vec![1, 2, 0, 0]);
        assert_eq!(a, b);
        a.resize(1);
        assert_ne!(a, b);
    }

    #[test]
    fn load_checks_coefficients() {
        let context = bfv_context(1024, &[30, 30], 20);
        let t = context.parameters().plain_modulus().value();
        let plain = Plaintext::from_coeffs(vec![1, t - 1, 7]);
        let bytes = plain.save(ComprMode::Zstd).unwrap();
        assert_eq!(Plaintext::load(&context, &bytes).unwrap(), plain);

        let bad = Plaintext::from_coeffs(vec![t]);
        let bytes = bad.save(ComprMode::None).unwrap();
        assert!(matches!(
            Plaintext::load(&context, &bytes),
            Err(Error::LoadError(LoadError::InvalidData))
        ));
    }
}
