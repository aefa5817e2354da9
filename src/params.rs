use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{random::RandomGeneratorFactory, ring::Modulus};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SchemeType {
    #[default]
    None,
    Bfv,
    Ckks,
    Bgv,
}

impl SchemeType {
    fn tag(self) -> u8 {
        match self {
            SchemeType::None => 0,
            SchemeType::Bfv => 1,
            SchemeType::Ckks => 2,
            SchemeType::Bgv => 3,
        }
    }
}

/// Security levels of the HomomorphicEncryption.org standard, assuming a
/// ternary secret.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SecurityLevel {
    None,
    #[default]
    Tc128,
    Tc192,
    Tc256,
}

/// SHA-256 fingerprint of a parameter set.  [`ParmsId::ZERO`] marks objects
/// that are not tied to a level.
#[derive(Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ParmsId([u8; 32]);

impl ParmsId {
    pub const ZERO: ParmsId = ParmsId([0; 32]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ParmsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ParmsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParmsId({})", self)
    }
}

#[derive(Deserialize, Serialize)]
struct ParametersData {
    scheme: SchemeType,
    poly_modulus_degree: u64,
    coeff_modulus: Vec<Modulus>,
    plain_modulus: Modulus,
}

/// The user-facing description of an encryption scheme instance.  Every setter
/// recomputes the [`ParmsId`].
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "ParametersData", into = "ParametersData")]
pub struct EncryptionParameters {
    scheme: SchemeType,
    poly_modulus_degree: usize,
    coeff_modulus: Vec<Modulus>,
    plain_modulus: Modulus,
    random_generator: Option<Arc<RandomGeneratorFactory>>,
    parms_id: ParmsId,
}

impl EncryptionParameters {
    pub fn new(scheme: SchemeType) -> Self {
        let mut parms = Self {
            scheme,
            poly_modulus_degree: 0,
            coeff_modulus: Vec::new(),
            plain_modulus: Modulus::ZERO,
            random_generator: None,
            parms_id: ParmsId::ZERO,
        };
        parms.compute_parms_id();
        parms
    }

    pub fn scheme(&self) -> SchemeType {
        self.scheme
    }

    pub fn poly_modulus_degree(&self) -> usize {
        self.poly_modulus_degree
    }

    pub fn coeff_modulus(&self) -> &[Modulus] {
        &self.coeff_modulus
    }

    pub fn plain_modulus(&self) -> &Modulus {
        &self.plain_modulus
    }

    pub fn random_generator(&self) -> Option<&Arc<RandomGeneratorFactory>> {
        self.random_generator.as_ref()
    }

    pub fn parms_id(&self) -> ParmsId {
        self.parms_id
    }

    pub fn set_poly_modulus_degree(&mut self, poly_modulus_degree: usize) {
        self.poly_modulus_degree = poly_modulus_degree;
        self.compute_parms_id();
    }

    pub fn set_coeff_modulus(&mut self, coeff_modulus: &[Modulus]) {
        self.coeff_modulus = coeff_modulus.to_vec();
        self.compute_parms_id();
    }

    /// Validation rejects a nonzero plain modulus for CKKS.
    pub fn set_plain_modulus(&mut self, plain_modulus: Modulus) {
        self.plain_modulus = plain_modulus;
        self.compute_parms_id();
    }

    /// The generator factory is not part of the fingerprint.
    pub fn set_random_generator(&mut self, factory: Option<Arc<RandomGeneratorFactory>>) {
        self.random_generator = factory;
    }

    fn compute_parms_id(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update([self.scheme.tag()]);
        hasher.update((self.poly_modulus_degree as u64).to_le_bytes());
        hasher.update((self.coeff_modulus.len() as u64).to_le_bytes());
        for q in &self.coeff_modulus {
            hasher.update(q.value().to_le_bytes());
        }
        hasher.update(self.plain_modulus.value().to_le_bytes());
        self.parms_id = ParmsId(hasher.finalize().into());
    }
}

impl PartialEq for EncryptionParameters {
    fn eq(&self, other: &Self) -> bool {
        self.parms_id == other.parms_id
    }
}

impl Eq for EncryptionParameters {}

impl fmt::Debug for EncryptionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionParameters")
            .field("scheme", &self.scheme)
            .field("poly_modulus_degree", &self.poly_modulus_degree)
            .field("coeff_modulus", &self.coeff_modulus)
            .field("plain_modulus", &self.plain_modulus)
            .field("parms_id", &self.parms_id)
            .finish()
    }
}

impl From<ParametersData> for EncryptionParameters {
    fn from(data: ParametersData) -> Self {
        let mut parms = Self::new(data.scheme);
        parms.poly_modulus_degree = data.poly_modulus_degree as usize;
        parms.coeff_modulus = data.coeff_modulus;
        parms.plain_modulus = data.plain_modulus;
        parms.compute_parms_id();
        parms
    }
}

impl From<EncryptionParameters> for ParametersData {
    fn from(parms: EncryptionParameters) -> Self {
        Self {
            scheme: parms.scheme,
            poly_modulus_degree: parms.poly_modulus_degree as u64,
            coeff_modulus: parms.coeff_modulus,
            plain_modulus: parms.plain_modulus,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::{CoeffModulus, Modulus};

    use super::*;

    #[test]
    fn parms_id_tracks_every_field() {
        let mut parms = EncryptionParameters::new(SchemeType::Bfv);
        let mut seen = vec![parms.parms_id()];
        parms.set_poly_modulus_degree(4096);
        seen.push(parms.parms_id());
        parms.set_coeff_modulus(&CoeffModulus::create(4096, &[36, 36, 37]).unwrap());
        seen.push(parms.parms_id());
        parms.set_plain_modulus(Modulus::new(1024).unwrap());
        seen.push(parms.parms_id());
        for (i, a) in seen.iter().enumerate() {
            for b in &seen[..i] {
                assert_ne!(a, b);
            }
        }

        let mut other = EncryptionParameters::new(SchemeType::Bgv);
        other.set_poly_modulus_degree(4096);
        other.set_coeff_modulus(parms.coeff_modulus());
        other.set_plain_modulus(*parms.plain_modulus());
        assert_ne!(other.parms_id(), parms.parms_id());
    }

    #[test]
    fn serde_roundtrip_parameters() {
        let mut parms = EncryptionParameters::new(SchemeType::Ckks);
        parms.set_poly_modulus_degree(8192);
        parms.set_coeff_modulus(&CoeffModulus::create(8192, &[60, 40, 40, 60]).unwrap());
        let bytes = bincode::serialize(&parms).unwrap();
        let parms_roundtrip: EncryptionParameters = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parms_roundtrip.parms_id(), parms.parms_id());
        assert_eq!(parms_roundtrip.coeff_modulus(), parms.coeff_modulus());
    }
}
