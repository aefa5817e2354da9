use serde::{Deserialize, Serialize};

use crate::{
    context::{Context, ContextData},
    error::{Error, LoadError},
    params::{ParmsId, SchemeType},
    random::{PrngInfo, UniformRandomGenerator},
    sampling::sample_uniform,
    serialization::Persist,
};

/// Largest number of components a ciphertext may grow to.
pub const CIPHERTEXT_SIZE_MAX: usize = 16;

/// `size` polynomials at the level named by `parms_id`, stored one after the
/// other, each with `coeff_modulus_size` rows of `poly_modulus_degree`
/// residues.
///
/// A ciphertext holding a `seed` is in compact form: only `c0` is stored and
/// `c1` is replayed from the seed when the ciphertext is loaded.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ciphertext {
    parms_id: ParmsId,
    is_ntt_form: bool,
    size: usize,
    poly_modulus_degree: usize,
    coeff_modulus_size: usize,
    scale: f64,
    correction_factor: u64,
    data: Vec<u64>,
    seed: Option<PrngInfo>,
}

impl Ciphertext {
    /// An empty ciphertext that belongs to no level.
    pub fn new() -> Self {
        Self {
            parms_id: ParmsId::ZERO,
            is_ntt_form: false,
            size: 0,
            poly_modulus_degree: 0,
            coeff_modulus_size: 0,
            scale: 1.0,
            correction_factor: 1,
            data: Vec::new(),
            seed: None,
        }
    }

    /// A zero ciphertext of `size` components at `parms_id`, in the form the
    /// scheme computes in.
    pub fn new_at(context: &Context, parms_id: &ParmsId, size: usize) -> Result<Self, Error> {
        let data = context.data(parms_id)?;
        if !(2..=CIPHERTEXT_SIZE_MAX).contains(&size) {
            return Err(Error::InvalidOperand("ciphertext size is out of range"));
        }
        let n = data.poly_modulus_degree();
        let k = data.coeff_modulus_size();
        Ok(Self {
            parms_id: *parms_id,
            is_ntt_form: data.scheme() != SchemeType::Bfv,
            size,
            poly_modulus_degree: n,
            coeff_modulus_size: k,
            data: vec![0; size * n * k],
            ..Self::new()
        })
    }

    /// Wraps components computed at the level of `context_data`.
    pub(crate) fn from_data(context_data: &ContextData, is_ntt_form: bool, data: Vec<u64>) -> Self {
        let n = context_data.poly_modulus_degree();
        let k = context_data.coeff_modulus_size();
        debug_assert_eq!(data.len() % (n * k), 0);
        Self {
            parms_id: context_data.parms_id(),
            is_ntt_form,
            size: data.len() / (n * k),
            poly_modulus_degree: n,
            coeff_modulus_size: k,
            data,
            ..Self::new()
        }
    }

    /// Checks that the buffer matches the level the ciphertext claims to be at.
    pub(crate) fn check_shape(&self, context_data: &ContextData) -> Result<(), Error> {
        if self.seed.is_some()
            || self.size < 2
            || self.poly_modulus_degree != context_data.poly_modulus_degree()
            || self.coeff_modulus_size != context_data.coeff_modulus_size()
            || self.data.len() != self.size * self.poly_len()
        {
            return Err(Error::InvalidOperand("ciphertext is not valid for its level"));
        }
        Ok(())
    }

    pub fn parms_id(&self) -> ParmsId {
        self.parms_id
    }

    pub fn is_ntt_form(&self) -> bool {
        self.is_ntt_form
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of components the allocation can hold without growing.
    pub fn size_capacity(&self) -> usize {
        match self.poly_len() {
            0 => 0,
            len => self.data.capacity() / len,
        }
    }

    pub fn poly_modulus_degree(&self) -> usize {
        self.poly_modulus_degree
    }

    pub fn coeff_modulus_size(&self) -> usize {
        self.coeff_modulus_size
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// BGV only: the ciphertext decrypts to the message times this factor.
    pub fn correction_factor(&self) -> u64 {
        self.correction_factor
    }

    pub fn data(&self) -> &[u64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u64] {
        &mut self.data
    }

    fn poly_len(&self) -> usize {
        self.poly_modulus_degree * self.coeff_modulus_size
    }

    pub fn poly(&self, index: usize) -> &[u64] {
        let len = self.poly_len();
        &self.data[index * len..(index + 1) * len]
    }

    pub fn poly_mut(&mut self, index: usize) -> &mut [u64] {
        let len = self.poly_len();
        &mut self.data[index * len..(index + 1) * len]
    }

    pub fn reserve(&mut self, size_capacity: usize) -> Result<(), Error> {
        if size_capacity > CIPHERTEXT_SIZE_MAX {
            return Err(Error::InvalidOperand("ciphertext size is too large"));
        }
        let total = size_capacity * self.poly_len();
        self.data.reserve(total.saturating_sub(self.data.len()));
        Ok(())
    }

    /// Grows with zero components or truncates.  A ciphertext keeps at least
    /// two components.
    pub fn resize(&mut self, size: usize) -> Result<(), Error> {
        if !(2..=CIPHERTEXT_SIZE_MAX).contains(&size) {
            return Err(Error::InvalidOperand("ciphertext size is out of range"));
        }
        self.data.resize(size * self.poly_len(), 0);
        self.size = size;
        Ok(())
    }

    pub fn release(&mut self) {
        *self = Self::new();
    }

    /// Whether decryption needs no secret key, i.e. every component except
    /// `c0` is zero.
    pub fn is_transparent(&self) -> bool {
        self.size < 2 || self.data[self.poly_len()..].iter().all(|&x| x == 0)
    }

    pub(crate) fn set_parms_id(&mut self, parms_id: ParmsId, coeff_modulus_size: usize) {
        self.parms_id = parms_id;
        self.coeff_modulus_size = coeff_modulus_size;
    }

    pub(crate) fn set_ntt_form(&mut self, is_ntt_form: bool) {
        self.is_ntt_form = is_ntt_form;
    }

    pub(crate) fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    pub(crate) fn set_correction_factor(&mut self, correction_factor: u64) {
        self.correction_factor = correction_factor;
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn data_vec_mut(&mut self) -> &mut Vec<u64> {
        &mut self.data
    }

    /// Drops `c1` and keeps the seed it was sampled from.
    pub(crate) fn into_compact(mut self, seed: PrngInfo) -> Self {
        debug_assert_eq!(self.size, 2);
        self.data.truncate(self.poly_len());
        self.seed = Some(seed);
        self
    }

    fn expand_seed(&mut self, context: &Context) -> Result<(), LoadError> {
        let Some(seed) = self.seed.take() else {
            return Ok(());
        };
        if self.size != 2 || self.data.len() != self.poly_len() {
            return Err(LoadError::InvalidData);
        }
        let data = context
            .get_context_data(&self.parms_id)
            .ok_or(LoadError::ForeignParameters)?;
        let len = self.poly_len();
        self.data.resize(2 * len, 0);
        let mut rng = UniformRandomGenerator::new(seed);
        sample_uniform(&mut rng, data.coeff_modulus(), &mut self.data[len..]);
        Ok(())
    }
}

impl Default for Ciphertext {
    fn default() -> Self {
        Self::new()
    }
}

impl Persist for Ciphertext {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        let data = context
            .get_context_data(&self.parms_id)
            .ok_or(LoadError::ForeignParameters)?;
        if self.poly_modulus_degree != data.poly_modulus_degree()
            || self.coeff_modulus_size != data.coeff_modulus_size()
            || !(2..=CIPHERTEXT_SIZE_MAX).contains(&self.size)
        {
            return Err(LoadError::InvalidData);
        }
        self.expand_seed(context)?;
        if self.data.len() != self.size * self.poly_len() {
            return Err(LoadError::InvalidData);
        }
        let n = self.poly_modulus_degree;
        for (row, q) in self
            .data
            .chunks_exact(n)
            .zip(data.coeff_modulus().iter().cycle())
        {
            if row.iter().any(|&x| x >= q.value()) {
                return Err(LoadError::InvalidData);
            }
        }

        let scheme = data.scheme();
        let valid_metadata = match scheme {
            SchemeType::Bfv => self.scale == 1.0 && self.correction_factor == 1,
            SchemeType::Bgv => {
                self.is_ntt_form
                    && self.scale == 1.0
                    && self.correction_factor != 0
                    && self.correction_factor < data.plain_modulus().value()
            }
            SchemeType::Ckks => {
                self.is_ntt_form && self.scale.is_finite() && self.scale > 0.0
            }
            SchemeType::None => false,
        };
        if !valid_metadata {
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
    fn layout_and_resize() {
        let context = bfv_context(1024, &[30, 30, 30], 20);
        let mut ct = Ciphertext::new_at(&context, &context.first_parms_id(), 2).unwrap();
        assert_eq!(ct.size(), 2);
        assert_eq!(ct.coeff_modulus_size(), 2);
        assert_eq!(ct.data().len(), 2 * 2 * 1024);
        assert!(!ct.is_ntt_form());
        assert!(ct.is_transparent());

        ct.poly_mut(1)[5] = 1;
        assert!(!ct.is_transparent());

        ct.resize(3).unwrap();
        assert_eq!(ct.poly(2).len(), 2 * 1024);
        assert!(ct.poly(2).iter().all(|&x| x == 0));
        assert!(ct.resize(1).is_err());
        ct.reserve(5).unwrap();
        assert!(ct.size_capacity() >= 5);

        ct.release();
        assert_eq!(ct.size(), 0);
        assert_eq!(ct.size_capacity(), 0);
        assert!(Ciphertext::new_at(&context, &ParmsId::ZERO, 2).is_err());
        for size in [0, 1, CIPHERTEXT_SIZE_MAX + 1] {
            assert!(matches!(
                Ciphertext::new_at(&context, &context.first_parms_id(), size),
                Err(Error::InvalidOperand(_))
            ));
        }
    }

    #[test]
    fn load_validates_against_context() {
        let context = bfv_context(1024, &[30, 30, 30], 20);
        let mut ct = Ciphertext::new_at(&context, &context.first_parms_id(), 2).unwrap();
        ct.poly_mut(1)[0] = 17;
        let bytes = ct.save(ComprMode::Zstd).unwrap();
        assert_eq!(Ciphertext::load(&context, &bytes).unwrap(), ct);

        let other = bfv_context(2048, &[30, 30], 20);
        assert!(matches!(
            Ciphertext::load(&other, &bytes),
            Err(Error::LoadError(LoadError::ForeignParameters))
        ));

        let q = context.first_context_data().unwrap().coeff_modulus()[0].value();
        ct.poly_mut(0)[3] = q;
        let bytes = ct.save(ComprMode::None).unwrap();
        assert!(matches!(
            Ciphertext::load(&context, &bytes),
            Err(Error::LoadError(LoadError::InvalidData))
        ));
    }
}
