//! Key material and its generation.
//!
//! Everything lives at the key level in NTT form.  A key switching key for a
//! target secret `s'` holds one encryption of zero per modulus `q_j` of the
//! first level, with `p * s'` added to row `j` of `c0`, where `p` is the
//! special prime.

use std::{fmt, sync::Arc};

use crypto_bigint::subtle::ConstantTimeEq;
use derive_more::Deref;
use log::debug;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    ciphertext::Ciphertext,
    context::{Context, ContextData},
    encryptor::encrypt_zero_symmetric,
    error::{Error, LoadError},
    params::ParmsId,
    plaintext::Plaintext,
    random::RandomGeneratorFactory,
    ring::poly,
    sampling::sample_ternary,
    serialization::{Persist, Serializable},
};

/// Galois element of the slot rotation by `step`: rows rotate left for
/// positive steps and right for negative ones.  Step zero names the row swap
/// (complex conjugation for CKKS).
pub fn galois_elt_from_step(step: i32, poly_modulus_degree: usize) -> Result<u32, Error> {
    let n = poly_modulus_degree as u64;
    let m = 2 * n;
    let slots = n / 2;
    if step == 0 {
        return Ok((m - 1) as u32);
    }
    let magnitude = step.unsigned_abs() as u64;
    if magnitude >= slots {
        return Err(Error::InvalidOperand("rotation step is out of range"));
    }
    let mut exponent = if step > 0 { magnitude } else { slots - magnitude };
    let mut base = 3u64;
    let mut elt = 1u64;
    while exponent > 0 {
        if exponent & 1 == 1 {
            elt = elt.wrapping_mul(base) & (m - 1);
        }
        base = base.wrapping_mul(base) & (m - 1);
        exponent >>= 1;
    }
    Ok(elt as u32)
}

/// Rotations by every power of two in both directions, plus the row swap.
/// The two directions coincide for the largest power.
pub fn default_galois_elts(poly_modulus_degree: usize) -> Vec<u32> {
    let slots = poly_modulus_degree / 2;
    let mut elts = Vec::new();
    let mut step = 1usize;
    while step < slots {
        for signed in [step as i32, -(step as i32)] {
            match galois_elt_from_step(signed, poly_modulus_degree) {
                Ok(elt) if !elts.contains(&elt) => elts.push(elt),
                _ => {}
            }
        }
        step <<= 1;
    }
    elts.push((2 * poly_modulus_degree - 1) as u32);
    elts
}

fn check_galois_elt(galois_elt: u32, poly_modulus_degree: usize) -> Result<(), Error> {
    if galois_elt % 2 == 0 || galois_elt as usize >= 2 * poly_modulus_degree {
        return Err(Error::InvalidOperand("invalid Galois element"));
    }
    Ok(())
}

/// Ternary secret at the key level, in NTT form.  Wiped on drop and
/// compared in constant time.
#[derive(Clone, Deserialize, Serialize)]
pub struct SecretKey {
    data: Plaintext,
}

impl SecretKey {
    pub fn parms_id(&self) -> ParmsId {
        self.data.parms_id()
    }

    pub(crate) fn data(&self) -> &[u64] {
        self.data.data()
    }

    pub(crate) fn check(&self, context: &Context) -> Result<(), Error> {
        let key_data = context.key_data()?;
        if self.parms_id() != key_data.parms_id()
            || self.data().len() != key_data.poly_modulus_degree() * key_data.coeff_modulus_size()
        {
            return Err(Error::InvalidKey);
        }
        Ok(())
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.data.data_mut().zeroize();
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.parms_id() == other.parms_id() && bool::from(self.data().ct_eq(other.data()))
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("parms_id", &self.parms_id())
            .finish_non_exhaustive()
    }
}

impl Persist for SecretKey {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        if self.parms_id() != context.key_parms_id() {
            return Err(LoadError::ForeignParameters);
        }
        self.data.prepare_for(context)
    }
}

/// An encryption of zero under the secret key, at the key level.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PublicKey {
    data: Ciphertext,
}

impl PublicKey {
    pub fn parms_id(&self) -> ParmsId {
        self.data.parms_id()
    }

    pub fn data(&self) -> &Ciphertext {
        &self.data
    }
}

impl Persist for PublicKey {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        if self.parms_id() != context.key_parms_id() {
            return Err(LoadError::ForeignParameters);
        }
        self.data.prepare_for(context)?;
        if self.data.size() != 2 || !self.data.is_ntt_form() {
            return Err(LoadError::InvalidData);
        }
        Ok(())
    }
}

/// Sets of key switching keys.  Each non-empty set switches one target
/// secret back to the secret key.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct KSwitchKeys {
    parms_id: ParmsId,
    keys: Vec<Vec<PublicKey>>,
}

impl KSwitchKeys {
    pub fn parms_id(&self) -> ParmsId {
        self.parms_id
    }

    /// Number of non-empty key sets.
    pub fn size(&self) -> usize {
        self.keys.iter().filter(|set| !set.is_empty()).count()
    }

    pub fn data(&self) -> &[Vec<PublicKey>] {
        &self.keys
    }

    fn set(&self, index: usize) -> Option<&[PublicKey]> {
        self.keys
            .get(index)
            .filter(|set| !set.is_empty())
            .map(Vec::as_slice)
    }
}

impl Persist for KSwitchKeys {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        if self.keys.is_empty() {
            return Ok(());
        }
        if self.parms_id != context.key_parms_id() {
            return Err(LoadError::ForeignParameters);
        }
        let decomposition = context
            .first_context_data()
            .ok_or(LoadError::ForeignParameters)?
            .coeff_modulus_size();
        for set in &mut self.keys {
            if !set.is_empty() && set.len() != decomposition {
                return Err(LoadError::InvalidData);
            }
            for key in set.iter_mut() {
                key.prepare_for(context)?;
            }
        }
        Ok(())
    }
}

/// Keys that switch `s^i` back to `s`, for `i = 2, 3, ...`.
#[derive(Clone, Debug, Default, Deref, Deserialize, PartialEq, Serialize)]
pub struct RelinKeys(KSwitchKeys);

impl RelinKeys {
    pub fn get_index(key_power: usize) -> usize {
        key_power.saturating_sub(2)
    }

    pub fn has_key(&self, key_power: usize) -> bool {
        self.key(key_power).is_some()
    }

    pub fn key(&self, key_power: usize) -> Option<&[PublicKey]> {
        if key_power < 2 {
            return None;
        }
        self.0.set(Self::get_index(key_power))
    }
}

impl Persist for RelinKeys {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        self.0.prepare_for(context)
    }
}

/// Keys that switch `s(X^g)` back to `s(X)`, indexed by Galois element `g`.
#[derive(Clone, Debug, Default, Deref, Deserialize, PartialEq, Serialize)]
pub struct GaloisKeys(KSwitchKeys);

impl GaloisKeys {
    pub fn get_index(galois_elt: u32) -> usize {
        (galois_elt as usize) >> 1
    }

    pub fn has_key(&self, galois_elt: u32) -> bool {
        self.key(galois_elt).is_some()
    }

    pub fn key(&self, galois_elt: u32) -> Option<&[PublicKey]> {
        if galois_elt % 2 == 0 {
            return None;
        }
        self.0.set(Self::get_index(galois_elt))
    }

    /// Elements that have a key, in increasing order.
    pub fn galois_elts(&self) -> Vec<u32> {
        self.0
            .keys
            .iter()
            .enumerate()
            .filter(|(_, set)| !set.is_empty())
            .map(|(index, _)| (2 * index + 1) as u32)
            .collect()
    }
}

impl Persist for GaloisKeys {
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError> {
        self.0.prepare_for(context)?;
        let n = context.parameters().poly_modulus_degree();
        if self.0.keys.len() > n {
            return Err(LoadError::InvalidData);
        }
        Ok(())
    }
}

/// Generates a secret key on creation and derives every other key from it.
#[derive(Debug)]
pub struct KeyGenerator {
    context: Context,
    factory: Arc<RandomGeneratorFactory>,
    secret_key: SecretKey,
}

impl KeyGenerator {
    pub fn new(context: &Context) -> Result<Self, Error> {
        let key_data = context.key_data()?;
        let factory = context
            .parameters()
            .random_generator()
            .cloned()
            .unwrap_or_else(RandomGeneratorFactory::default_factory);

        let n = key_data.poly_modulus_degree();
        let mut rng = factory.create();
        let mut secret = sample_ternary(&mut rng, n);
        let mut data = vec![0; n * key_data.coeff_modulus_size()];
        poly::set_signed(&secret, key_data.coeff_modulus(), &mut data);
        secret.zeroize();
        poly::ntt_forward(&mut data, key_data.ntt_tables());
        debug!("generated secret key at {}", key_data.parms_id());

        Ok(Self {
            context: context.clone(),
            factory,
            secret_key: SecretKey {
                data: Plaintext::from_ntt(data, key_data.parms_id(), 1.0),
            },
        })
    }

    /// Derives keys from an existing secret key.
    pub fn with_secret_key(context: &Context, secret_key: &SecretKey) -> Result<Self, Error> {
        secret_key.check(context)?;
        let factory = context
            .parameters()
            .random_generator()
            .cloned()
            .unwrap_or_else(RandomGeneratorFactory::default_factory);
        Ok(Self {
            context: context.clone(),
            factory,
            secret_key: secret_key.clone(),
        })
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    fn public_key(&self, seeded: bool) -> Result<PublicKey, Error> {
        let key_data = self.context.key_data()?;
        let (ct, seed) =
            encrypt_zero_symmetric(&key_data, self.secret_key.data(), &self.factory, true);
        let data = if seeded { ct.into_compact(seed) } else { ct };
        Ok(PublicKey { data })
    }

    pub fn create_public_key(&self) -> Result<PublicKey, Error> {
        self.public_key(false)
    }

    /// The public key with `c1` replaced by its seed.  Only useful for
    /// sending: load it back before use.
    pub fn create_public_key_serializable(&self) -> Result<Serializable<PublicKey>, Error> {
        Ok(Serializable::new(self.public_key(true)?))
    }

    fn key_switch_data(&self) -> Result<Arc<ContextData>, Error> {
        if !self.context.using_keyswitching() {
            return Err(Error::InvalidOperand(
                "key switching is not supported by these parameters",
            ));
        }
        self.context.key_data()
    }

    /// One key per modulus of the first level; `new_key` is in NTT form at
    /// the key level.
    fn create_key_set(
        &self,
        key_data: &ContextData,
        new_key: &[u64],
        seeded: bool,
    ) -> Result<Vec<PublicKey>, Error> {
        let n = key_data.poly_modulus_degree();
        let key_moduli = key_data.coeff_modulus();
        let special_prime = key_moduli[key_moduli.len() - 1].value();
        let decomposition = self.context.first_data()?.coeff_modulus_size();

        Ok((0..decomposition)
            .map(|j| {
                let (mut ct, seed) =
                    encrypt_zero_symmetric(key_data, self.secret_key.data(), &self.factory, true);
                let q = &key_moduli[j];
                let factor = q.operand(q.reduce(special_prime));
                let row = &mut ct.poly_mut(0)[j * n..(j + 1) * n];
                for (x, &s) in row.iter_mut().zip(&new_key[j * n..(j + 1) * n]) {
                    *x = q.add(*x, q.mul_operand(s, &factor));
                }
                let data = if seeded { ct.into_compact(seed) } else { ct };
                PublicKey { data }
            })
            .collect())
    }

    fn relin_keys(&self, seeded: bool) -> Result<RelinKeys, Error> {
        let key_data = self.key_switch_data()?;
        let mut square = self.secret_key.data().to_vec();
        poly::mul_assign(&mut square, self.secret_key.data(), key_data.coeff_modulus());
        let set = self.create_key_set(&key_data, &square, seeded);
        square.zeroize();
        debug!("generated relinearization keys");
        Ok(RelinKeys(KSwitchKeys {
            parms_id: key_data.parms_id(),
            keys: vec![set?],
        }))
    }

    pub fn create_relin_keys(&self) -> Result<RelinKeys, Error> {
        self.relin_keys(false)
    }

    pub fn create_relin_keys_serializable(&self) -> Result<Serializable<RelinKeys>, Error> {
        Ok(Serializable::new(self.relin_keys(true)?))
    }

    fn galois_keys(&self, galois_elts: &[u32], seeded: bool) -> Result<GaloisKeys, Error> {
        let key_data = self.key_switch_data()?;
        let n = key_data.poly_modulus_degree();
        for &elt in galois_elts {
            check_galois_elt(elt, n)?;
        }

        let mut keys = vec![Vec::new(); n];
        let mut permuted = vec![0; self.secret_key.data().len()];
        for &elt in galois_elts {
            let index = GaloisKeys::get_index(elt);
            if !keys[index].is_empty() {
                continue;
            }
            let permutation = poly::galois_ntt_permutation(elt, key_data.coeff_count_power());
            poly::apply_galois_ntt(self.secret_key.data(), &permutation, &mut permuted);
            keys[index] = self.create_key_set(&key_data, &permuted, seeded)?;
        }
        permuted.zeroize();
        debug!("generated Galois keys for {} elements", galois_elts.len());
        Ok(GaloisKeys(KSwitchKeys {
            parms_id: key_data.parms_id(),
            keys,
        }))
    }

    /// Keys for rotations by powers of two in both directions and for the
    /// row swap.
    pub fn create_galois_keys(&self) -> Result<GaloisKeys, Error> {
        let n = self.context.parameters().poly_modulus_degree();
        self.galois_keys(&default_galois_elts(n), false)
    }

    pub fn create_galois_keys_from_steps(&self, steps: &[i32]) -> Result<GaloisKeys, Error> {
        let elts = self.elts_from_steps(steps)?;
        self.galois_keys(&elts, false)
    }

    pub fn create_galois_keys_from_elts(&self, galois_elts: &[u32]) -> Result<GaloisKeys, Error> {
        self.galois_keys(galois_elts, false)
    }

    pub fn create_galois_keys_serializable(&self) -> Result<Serializable<GaloisKeys>, Error> {
        let n = self.context.parameters().poly_modulus_degree();
        Ok(Serializable::new(self.galois_keys(&default_galois_elts(n), true)?))
    }

    pub fn create_galois_keys_from_steps_serializable(
        &self,
        steps: &[i32],
    ) -> Result<Serializable<GaloisKeys>, Error> {
        let elts = self.elts_from_steps(steps)?;
        Ok(Serializable::new(self.galois_keys(&elts, true)?))
    }

    pub fn create_galois_keys_from_elts_serializable(
        &self,
        galois_elts: &[u32],
    ) -> Result<Serializable<GaloisKeys>, Error> {
        Ok(Serializable::new(self.galois_keys(galois_elts, true)?))
    }

    fn elts_from_steps(&self, steps: &[i32]) -> Result<Vec<u32>, Error> {
        let n = self.context.parameters().poly_modulus_degree();
        steps
            .iter()
            .map(|&step| galois_elt_from_step(step, n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        context::tests::{bfv_context, ckks_context},
        ring::Modulus,
        serialization::ComprMode,
    };

    use super::*;

    #[test]
    fn galois_elements() {
        assert_eq!(galois_elt_from_step(1, 64).unwrap(), 3);
        assert_eq!(galois_elt_from_step(2, 64).unwrap(), 9);
        assert_eq!(galois_elt_from_step(0, 64).unwrap(), 127);
        // Rotating right by one is rotating left by n/2 - 1.
        let right = galois_elt_from_step(-1, 64).unwrap();
        let q = Modulus::new(128).unwrap();
        assert_eq!(q.mul(right as u64, 3), 1);
        assert!(galois_elt_from_step(32, 64).is_err());
        assert!(galois_elt_from_step(-32, 64).is_err());

        let elts = default_galois_elts(64);
        assert_eq!(elts.len(), 2 * 5);
        assert!(elts.contains(&3) && elts.contains(&127));
    }

    #[test]
    fn secret_key_checks_and_persists() {
        let context = bfv_context(1024, &[30, 30, 30], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let secret_key = keygen.secret_key().clone();
        assert_eq!(secret_key.parms_id(), context.key_parms_id());
        assert_eq!(&secret_key, keygen.secret_key());
        assert!(!format!("{:?}", secret_key).contains("data"));

        let bytes = secret_key.save(ComprMode::Zstd).unwrap();
        assert_eq!(SecretKey::load(&context, &bytes).unwrap(), secret_key);
        let other = bfv_context(1024, &[30, 30, 40], 20);
        assert!(matches!(
            SecretKey::load(&other, &bytes),
            Err(Error::LoadError(LoadError::ForeignParameters))
        ));
        assert!(matches!(
            KeyGenerator::with_secret_key(&other, &secret_key),
            Err(Error::InvalidKey)
        ));

        let again = KeyGenerator::with_secret_key(&context, &secret_key).unwrap();
        assert_eq!(again.secret_key(), keygen.secret_key());
        assert_ne!(KeyGenerator::new(&context).unwrap().secret_key(), &secret_key);
    }

    #[test]
    fn key_set_shapes() {
        let context = bfv_context(1024, &[30, 30, 30], 20);
        let keygen = KeyGenerator::new(&context).unwrap();

        let public_key = keygen.create_public_key().unwrap();
        assert_eq!(public_key.parms_id(), context.key_parms_id());
        assert_eq!(public_key.data().size(), 2);
        assert!(public_key.data().is_ntt_form());

        let relin_keys = keygen.create_relin_keys().unwrap();
        assert_eq!(relin_keys.size(), 1);
        assert!(relin_keys.has_key(2));
        assert!(!relin_keys.has_key(3));
        assert_eq!(relin_keys.key(2).unwrap().len(), 2);

        let galois_keys = keygen.create_galois_keys().unwrap();
        assert_eq!(galois_keys.galois_elts().len(), 2 * 9);
        assert!(galois_keys.has_key(3) && galois_keys.has_key(2047));
        assert!(!galois_keys.has_key(5));

        let galois_keys = keygen.create_galois_keys_from_steps(&[3, -3]).unwrap();
        assert_eq!(galois_keys.size(), 2);
        assert!(galois_keys.has_key(27));
        assert!(keygen.create_galois_keys_from_elts(&[4]).is_err());
        assert!(keygen.create_galois_keys_from_elts(&[2049]).is_err());
    }

    #[test]
    fn seeded_keys_load() {
        let context = ckks_context(1024, &[40, 40, 40]);
        let keygen = KeyGenerator::new(&context).unwrap();

        let seeded = keygen.create_relin_keys_serializable().unwrap();
        let full = keygen.create_relin_keys().unwrap();
        assert!(
            seeded.save_size(ComprMode::None).unwrap() < full.save_size(ComprMode::None).unwrap()
        );
        let loaded = RelinKeys::load(&context, &seeded.save(ComprMode::Zstd).unwrap()).unwrap();
        assert!(loaded.has_key(2));
        assert_eq!(loaded.key(2).unwrap()[0].data().size(), 2);

        let seeded = keygen.create_galois_keys_from_steps_serializable(&[1]).unwrap();
        let loaded = GaloisKeys::load(&context, &seeded.save(ComprMode::None).unwrap()).unwrap();
        assert_eq!(loaded.galois_elts(), vec![3]);

        let seeded = keygen.create_public_key_serializable().unwrap();
        let loaded = PublicKey::load(&context, &seeded.save(ComprMode::None).unwrap()).unwrap();
        assert_eq!(loaded.data().size(), 2);
    }

    #[test]
    fn no_key_switching_without_special_prime() {
        let context = ckks_context(1024, &[40]);
        assert!(!context.using_keyswitching());
        let keygen = KeyGenerator::new(&context).unwrap();
        assert!(keygen.create_public_key().is_ok());
        assert!(keygen.create_relin_keys().is_err());
        assert!(keygen.create_galois_keys().is_err());
    }
}
