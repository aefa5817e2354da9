use std::sync::Arc;

use log::debug;

use crate::{
    ciphertext::Ciphertext,
    context::{Context, ContextData},
    error::Error,
    keys::{PublicKey, SecretKey},
    params::{ParmsId, SchemeType},
    plaintext::Plaintext,
    random::{PrngInfo, RandomGeneratorFactory, UniformRandomGenerator},
    ring::poly,
    sampling::{sample_centered_binomial, sample_ternary, sample_uniform, NOISE_ITERATIONS},
    serialization::Serializable,
};

/// Checks a coefficient-form plaintext against the plain modulus.
pub(crate) fn check_plain_coeffs(plain: &Plaintext, context_data: &ContextData) -> Result<(), Error> {
    let t = context_data.plain_modulus().value();
    if plain.is_ntt_form()
        || plain.coeff_count() > context_data.poly_modulus_degree()
        || plain.data().iter().any(|&x| x >= t)
    {
        return Err(Error::InvalidOperand("plaintext is not valid for the plain modulus"));
    }
    Ok(())
}

/// Writes `Delta * m` over the level's moduli, where `Delta = floor(Q / t)`
/// and the fractional part of `Q / t` is rounded into each coefficient.
pub(crate) fn scale_plain(plain: &Plaintext, context_data: &ContextData, out: &mut [u64]) {
    let n = context_data.poly_modulus_degree();
    let t = context_data.plain_modulus().value() as u128;
    let remainder = context_data.coeff_mod_plain_modulus() as u128;
    let half = context_data.plain_upper_half_threshold() as u128;
    let fixes: Vec<u64> = plain
        .data()
        .iter()
        .map(|&m| ((m as u128 * remainder + half) / t) as u64)
        .collect();

    out.fill(0);
    for ((row, q), &delta) in out
        .chunks_exact_mut(n)
        .zip(context_data.coeff_modulus())
        .zip(context_data.coeff_div_plain_modulus())
    {
        let delta = q.operand(delta);
        for ((x, &m), &fix) in row.iter_mut().zip(plain.data()).zip(&fixes) {
            *x = q.add(q.mul_operand(q.reduce(m), &delta), q.reduce(fix));
        }
    }
}

/// Writes the centered lift of `plain` over the level's moduli, in
/// coefficient form.
pub(crate) fn lift_plain(plain: &Plaintext, context_data: &ContextData, out: &mut [u64]) {
    let n = context_data.poly_modulus_degree();
    let threshold = context_data.plain_upper_half_threshold();
    out.fill(0);
    for ((row, q), &increment) in out
        .chunks_exact_mut(n)
        .zip(context_data.coeff_modulus())
        .zip(context_data.plain_upper_half_increment())
    {
        for (x, &m) in row.iter_mut().zip(plain.data()) {
            *x = if m >= threshold { q.add(m, increment) } else { m };
        }
    }
}

/// Fresh noise for one polynomial over the level's moduli; a multiple of the
/// plain modulus for BGV.
fn sample_noise(
    rng: &mut UniformRandomGenerator,
    context_data: &ContextData,
    out: &mut [u64],
) {
    let n = context_data.poly_modulus_degree();
    let noise = sample_centered_binomial(rng, n, NOISE_ITERATIONS);
    poly::set_signed(&noise, context_data.coeff_modulus(), out);
    if context_data.scheme() == SchemeType::Bgv {
        poly::mul_scalar(out, context_data.plain_modulus().value(), context_data.coeff_modulus());
    }
}

/// Encrypts zero under `secret` (NTT form, at least as many rows as the
/// level has moduli).  `c1` is sampled from its own generator, whose info is
/// returned so that `c1` can be dropped and replayed later.
pub(crate) fn encrypt_zero_symmetric(
    context_data: &ContextData,
    secret: &[u64],
    factory: &RandomGeneratorFactory,
    is_ntt_form: bool,
) -> (Ciphertext, PrngInfo) {
    let n = context_data.poly_modulus_degree();
    let k = context_data.coeff_modulus_size();
    let moduli = context_data.coeff_modulus();
    let tables = context_data.ntt_tables();

    let mut c1_rng = factory.create();
    let seed = c1_rng.info().clone();
    let mut data = vec![0; 2 * n * k];
    let (c0, c1) = data.split_at_mut(n * k);
    sample_uniform(&mut c1_rng, moduli, c1);

    let mut rng = factory.create();
    let mut noise = vec![0; n * k];
    sample_noise(&mut rng, context_data, &mut noise);

    c0.copy_from_slice(c1);
    if !is_ntt_form {
        poly::ntt_forward(c0, tables);
    }
    poly::mul_assign(c0, &secret[..n * k], moduli);
    if is_ntt_form {
        poly::ntt_forward(&mut noise, tables);
    } else {
        poly::ntt_inverse(c0, tables);
    }
    poly::add_assign(c0, &noise, moduli);
    poly::negate(c0, moduli);

    (Ciphertext::from_data(context_data, is_ntt_form, data), seed)
}

/// Encrypts plaintexts under a public key, a secret key, or both.
#[derive(Debug)]
pub struct Encryptor {
    context: Context,
    factory: Arc<RandomGeneratorFactory>,
    public_key: Option<PublicKey>,
    secret_key: Option<SecretKey>,
}

impl Encryptor {
    /// An encryptor without keys; attach them with
    /// [`with_public_key`](Self::with_public_key) or
    /// [`with_secret_key`](Self::with_secret_key).
    pub fn new(context: &Context) -> Result<Self, Error> {
        context.ensure_valid()?;
        let factory = context
            .parameters()
            .random_generator()
            .cloned()
            .unwrap_or_else(RandomGeneratorFactory::default_factory);
        Ok(Self {
            context: context.clone(),
            factory,
            public_key: None,
            secret_key: None,
        })
    }

    pub fn with_public_key(mut self, public_key: &PublicKey) -> Result<Self, Error> {
        let key_data = self.context.key_data()?;
        let ct = public_key.data();
        if ct.parms_id() != key_data.parms_id() || !ct.is_ntt_form() || ct.check_shape(&key_data).is_err() {
            return Err(Error::InvalidKey);
        }
        self.public_key = Some(public_key.clone());
        Ok(self)
    }

    pub fn with_secret_key(mut self, secret_key: &SecretKey) -> Result<Self, Error> {
        secret_key.check(&self.context)?;
        self.secret_key = Some(secret_key.clone());
        Ok(self)
    }

    fn public_key(&self) -> Result<&PublicKey, Error> {
        self.public_key
            .as_ref()
            .ok_or(Error::InvalidOperand("encryptor has no public key"))
    }

    fn secret_key(&self) -> Result<&SecretKey, Error> {
        self.secret_key
            .as_ref()
            .ok_or(Error::InvalidOperand("encryptor has no secret key"))
    }

    /// Level a plaintext encrypts to: the first level for BFV and BGV, the
    /// plaintext's own level for CKKS.
    fn target_level(&self, plain: &Plaintext) -> Result<Arc<ContextData>, Error> {
        let first = self.context.first_data()?;
        match first.scheme() {
            SchemeType::Bfv | SchemeType::Bgv => {
                check_plain_coeffs(plain, &first)?;
                Ok(first)
            }
            SchemeType::Ckks => {
                if !plain.is_ntt_form() {
                    return Err(Error::InvalidOperand("CKKS plaintext must be in NTT form"));
                }
                let data = self.context.data(&plain.parms_id())?;
                if plain.coeff_count() != data.poly_modulus_degree() * data.coeff_modulus_size() {
                    return Err(Error::InvalidOperand("plaintext is not valid for its level"));
                }
                Ok(data)
            }
            SchemeType::None => Err(Error::InvalidOperand("unsupported scheme")),
        }
    }

    fn add_plain(&self, plain: &Plaintext, context_data: &ContextData, ct: &mut Ciphertext) {
        let n = context_data.poly_modulus_degree();
        let k = context_data.coeff_modulus_size();
        let moduli = context_data.coeff_modulus();
        let mut encoded = vec![0; n * k];
        match context_data.scheme() {
            SchemeType::Bfv => scale_plain(plain, context_data, &mut encoded),
            SchemeType::Bgv => {
                lift_plain(plain, context_data, &mut encoded);
                poly::ntt_forward(&mut encoded, context_data.ntt_tables());
            }
            _ => {
                encoded.copy_from_slice(plain.data());
                ct.set_scale(plain.scale());
            }
        }
        poly::add_assign(ct.poly_mut(0), &encoded, moduli);
    }

    /// Public-key encryption of zero at `parms_id`: done at the key level and
    /// divided down modulus by modulus.
    fn encrypt_zero_asymmetric(&self, context_data: &ContextData) -> Result<Ciphertext, Error> {
        let public_key = self.public_key()?;
        let key_data = self.context.key_data()?;
        let scheme = key_data.scheme();
        let n = key_data.poly_modulus_degree();
        let key_moduli = key_data.coeff_modulus();
        let key_len = n * key_data.coeff_modulus_size();

        let mut rng = self.factory.create();
        let u = sample_ternary(&mut rng, n);
        let mut u_ntt = vec![0; key_len];
        poly::set_signed(&u, key_moduli, &mut u_ntt);
        poly::ntt_forward(&mut u_ntt, key_data.ntt_tables());

        let mut data = public_key.data().data().to_vec();
        let mut noise = vec![0; key_len];
        for component in data.chunks_exact_mut(key_len) {
            poly::mul_assign(component, &u_ntt, key_moduli);
            poly::ntt_inverse(component, key_data.ntt_tables());
            sample_noise(&mut rng, &key_data, &mut noise);
            poly::add_assign(component, &noise, key_moduli);
        }

        let mut current = key_data;
        while current.parms_id() != context_data.parms_id() {
            let next_id = current
                .next_parms_id()
                .ok_or(Error::InvalidOperand("parms_id is not valid for this context"))?;
            let next = self.context.data(&next_id)?;
            let len = n * current.coeff_modulus_size();
            let next_len = n * next.coeff_modulus_size();
            let mut reduced = vec![0; 2 * next_len];
            for (input, out) in data.chunks_exact(len).zip(reduced.chunks_exact_mut(next_len)) {
                if scheme == SchemeType::Bgv {
                    current
                        .rns_base()
                        .mod_t_and_divide_q_last(input, current.plain_modulus(), out)?;
                } else {
                    current.rns_base().divide_and_round_q_last(input, out);
                }
            }
            data = reduced;
            current = next;
        }

        let is_ntt_form = scheme != SchemeType::Bfv;
        if is_ntt_form {
            poly::ntt_forward(&mut data, context_data.ntt_tables());
        }
        Ok(Ciphertext::from_data(context_data, is_ntt_form, data))
    }

    fn zero_symmetric(&self, context_data: &ContextData) -> Result<(Ciphertext, PrngInfo), Error> {
        let secret_key = self.secret_key()?;
        let is_ntt_form = context_data.scheme() != SchemeType::Bfv;
        Ok(encrypt_zero_symmetric(
            context_data,
            secret_key.data(),
            &self.factory,
            is_ntt_form,
        ))
    }

    /// Public-key encryption.  BFV and BGV encrypt at the first level, CKKS at
    /// the plaintext's level.
    pub fn encrypt(&self, plain: &Plaintext) -> Result<Ciphertext, Error> {
        let context_data = self.target_level(plain)?;
        let mut ct = self.encrypt_zero_asymmetric(&context_data)?;
        self.add_plain(plain, &context_data, &mut ct);
        debug!("encrypted plaintext at {}", context_data.parms_id());
        Ok(ct)
    }

    pub fn encrypt_zero(&self) -> Result<Ciphertext, Error> {
        self.encrypt_zero_at(&self.context.first_parms_id())
    }

    pub fn encrypt_zero_at(&self, parms_id: &ParmsId) -> Result<Ciphertext, Error> {
        let context_data = self.context.data(parms_id)?;
        self.encrypt_zero_asymmetric(&context_data)
    }

    pub fn encrypt_symmetric(&self, plain: &Plaintext) -> Result<Ciphertext, Error> {
        let context_data = self.target_level(plain)?;
        let (mut ct, _) = self.zero_symmetric(&context_data)?;
        self.add_plain(plain, &context_data, &mut ct);
        Ok(ct)
    }

    pub fn encrypt_zero_symmetric(&self) -> Result<Ciphertext, Error> {
        self.encrypt_zero_symmetric_at(&self.context.first_parms_id())
    }

    pub fn encrypt_zero_symmetric_at(&self, parms_id: &ParmsId) -> Result<Ciphertext, Error> {
        let context_data = self.context.data(parms_id)?;
        Ok(self.zero_symmetric(&context_data)?.0)
    }

    /// Like [`encrypt_symmetric`](Self::encrypt_symmetric), but `c1` is
    /// replaced by the seed it was drawn from, roughly halving the
    /// serialized size.
    pub fn encrypt_symmetric_serializable(
        &self,
        plain: &Plaintext,
    ) -> Result<Serializable<Ciphertext>, Error> {
        let context_data = self.target_level(plain)?;
        let (mut ct, seed) = self.zero_symmetric(&context_data)?;
        self.add_plain(plain, &context_data, &mut ct);
        Ok(Serializable::new(ct.into_compact(seed)))
    }

    pub fn encrypt_zero_symmetric_serializable(&self) -> Result<Serializable<Ciphertext>, Error> {
        let context_data = self.context.first_data()?;
        let (ct, seed) = self.zero_symmetric(&context_data)?;
        Ok(Serializable::new(ct.into_compact(seed)))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        batch_encoder::BatchEncoder,
        ckks_encoder::CkksEncoder,
        context::tests::{bfv_context, bgv_context, ckks_context},
        decryptor::Decryptor,
        keys::KeyGenerator,
        params::SecurityLevel,
        random::PrngType,
        serialization::{ComprMode, Persist},
    };

    use super::*;

    fn roundtrip_batched(context: &Context) {
        let keygen = KeyGenerator::new(context).unwrap();
        let public_key = keygen.create_public_key().unwrap();
        let encryptor = Encryptor::new(context)
            .unwrap()
            .with_public_key(&public_key)
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap();
        let decryptor = Decryptor::new(context, keygen.secret_key()).unwrap();
        let encoder = BatchEncoder::new(context).unwrap();
        let t = context.parameters().plain_modulus().value();

        let values: Vec<u64> = (0..encoder.slot_count() as u64).map(|i| (i * 7919) % t).collect();
        let plain = encoder.encode_u64(&values).unwrap();

        let ct = encryptor.encrypt(&plain).unwrap();
        assert_eq!(ct.parms_id(), context.first_parms_id());
        assert_eq!(encoder.decode_u64(&decryptor.decrypt(&ct).unwrap()).unwrap(), values);

        let ct = encryptor.encrypt_symmetric(&plain).unwrap();
        assert_eq!(encoder.decode_u64(&decryptor.decrypt(&ct).unwrap()).unwrap(), values);

        for ct in [
            encryptor.encrypt_zero().unwrap(),
            encryptor.encrypt_zero_symmetric().unwrap(),
            encryptor.encrypt_zero_at(&context.last_parms_id()).unwrap(),
            encryptor.encrypt_zero_symmetric_at(&context.last_parms_id()).unwrap(),
        ] {
            assert!(decryptor.decrypt(&ct).unwrap().is_zero());
            assert!(decryptor.invariant_noise_budget(&ct).unwrap() > 0);
        }
    }

    #[test]
    fn bfv_roundtrip() {
        let context = bfv_context(1024, &[40, 40, 40], 20);
        roundtrip_batched(&context);
        let keygen = KeyGenerator::new(&context).unwrap();
        let encryptor = Encryptor::new(&context)
            .unwrap()
            .with_public_key(&keygen.create_public_key().unwrap())
            .unwrap();
        assert!(!encryptor.encrypt_zero().unwrap().is_ntt_form());
    }

    #[test]
    fn bgv_roundtrip() {
        let context = bgv_context(1024, &[40, 40, 40], 20);
        roundtrip_batched(&context);
    }

    #[test]
    fn ckks_roundtrip() {
        let context = ckks_context(1024, &[60, 40, 40, 60]);
        let keygen = KeyGenerator::new(&context).unwrap();
        let encryptor = Encryptor::new(&context)
            .unwrap()
            .with_public_key(&keygen.create_public_key().unwrap())
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let encoder = CkksEncoder::new(&context).unwrap();

        let values: Vec<f64> = (0..512).map(|i| (i as f64).sin() * 3.0).collect();
        let scale = 2f64.powi(40);
        let next = context
            .first_context_data()
            .unwrap()
            .next_parms_id()
            .unwrap();
        for parms_id in [context.first_parms_id(), next] {
            let plain = encoder.encode_f64(&values, &parms_id, scale).unwrap();
            for ct in [
                encryptor.encrypt(&plain).unwrap(),
                encryptor.encrypt_symmetric(&plain).unwrap(),
            ] {
                assert_eq!(ct.parms_id(), parms_id);
                assert_eq!(ct.scale(), scale);
                let decoded = encoder.decode_f64(&decryptor.decrypt(&ct).unwrap()).unwrap();
                for (a, b) in decoded.iter().zip(&values) {
                    assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
                }
            }
        }
    }

    #[test]
    fn seeded_ciphertext_is_smaller_and_expands() {
        let context = bfv_context(1024, &[40, 40, 40], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let encryptor = Encryptor::new(&context)
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let plain = Plaintext::from_coeffs(vec![1, 2, 3]);

        let full = encryptor.encrypt_symmetric(&plain).unwrap();
        let seeded = encryptor.encrypt_symmetric_serializable(&plain).unwrap();
        let full_size = full.save_size(ComprMode::None).unwrap();
        let seeded_size = seeded.save_size(ComprMode::None).unwrap();
        assert!(seeded_size * 10 < full_size * 6);

        let bytes = seeded.save(ComprMode::Zstd).unwrap();
        let loaded = Ciphertext::load(&context, &bytes).unwrap();
        assert_eq!(loaded.size(), 2);
        assert_eq!(decryptor.decrypt(&loaded).unwrap(), plain);

        let zero = encryptor.encrypt_zero_symmetric_serializable().unwrap();
        let loaded = Ciphertext::load(&context, &zero.save(ComprMode::None).unwrap()).unwrap();
        assert!(decryptor.decrypt(&loaded).unwrap().is_zero());
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let base = bfv_context(1024, &[40, 40], 20).parameters().clone();
        let plain = Plaintext::from_coeffs(vec![5]);

        let encrypt = || {
            let mut parms = base.clone();
            parms.set_random_generator(Some(Arc::new(RandomGeneratorFactory::with_seed(
                PrngType::Blake2xb,
                [9; 32],
            ))));
            let context = Context::new(&parms, true, SecurityLevel::None);
            let keygen = KeyGenerator::new(&context).unwrap();
            Encryptor::new(&context)
                .unwrap()
                .with_secret_key(keygen.secret_key())
                .unwrap()
                .encrypt_symmetric(&plain)
                .unwrap()
        };
        assert_eq!(encrypt(), encrypt());
    }

    #[test]
    fn rejects_bad_input() {
        let context = bfv_context(1024, &[40, 40, 40], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let encryptor = Encryptor::new(&context).unwrap();
        assert!(matches!(
            encryptor.encrypt(&Plaintext::from_coeffs(vec![1])),
            Err(Error::InvalidOperand(_))
        ));

        let encryptor = encryptor.with_secret_key(keygen.secret_key()).unwrap();
        let t = context.parameters().plain_modulus().value();
        assert!(encryptor
            .encrypt_symmetric(&Plaintext::from_coeffs(vec![t]))
            .is_err());
        assert!(encryptor
            .encrypt_symmetric(&Plaintext::with_coeff_count(1025))
            .is_err());

        let other = bfv_context(1024, &[40, 40, 30], 20);
        let other_key = KeyGenerator::new(&other).unwrap().create_public_key().unwrap();
        assert!(matches!(
            Encryptor::new(&context).unwrap().with_public_key(&other_key),
            Err(Error::InvalidKey)
        ));
    }
}
