use std::sync::Arc;

use log::warn;
use num_bigint::{BigInt, BigUint};
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive};

use crate::{
    ciphertext::Ciphertext,
    context::{Context, ContextData},
    error::Error,
    keys::SecretKey,
    params::SchemeType,
    plaintext::Plaintext,
    ring::poly,
};

#[derive(Debug)]
pub struct Decryptor {
    context: Context,
    secret_key: SecretKey,
}

impl Decryptor {
    pub fn new(context: &Context, secret_key: &SecretKey) -> Result<Self, Error> {
        secret_key.check(context)?;
        Ok(Self {
            context: context.clone(),
            secret_key: secret_key.clone(),
        })
    }

    /// `c_0 + c_1 s + c_2 s^2 + ...` in NTT form at the ciphertext's level.
    fn dot_product_with_secret(&self, ct: &Ciphertext, context_data: &ContextData) -> Vec<u64> {
        let len = context_data.poly_modulus_degree() * context_data.coeff_modulus_size();
        let moduli = context_data.coeff_modulus();
        let tables = context_data.ntt_tables();
        let secret = &self.secret_key.data()[..len];

        let mut result = ct.poly(0).to_vec();
        if !ct.is_ntt_form() {
            poly::ntt_forward(&mut result, tables);
        }
        let mut power = secret.to_vec();
        let mut component = vec![0; len];
        for i in 1..ct.size() {
            component.copy_from_slice(ct.poly(i));
            if !ct.is_ntt_form() {
                poly::ntt_forward(&mut component, tables);
            }
            poly::mul_acc(&mut result, &component, &power, moduli);
            if i + 1 < ct.size() {
                poly::mul_assign(&mut power, secret, moduli);
            }
        }
        result
    }

    fn check(&self, ct: &Ciphertext) -> Result<Arc<ContextData>, Error> {
        let context_data = self.context.data(&ct.parms_id())?;
        ct.check_shape(&context_data)?;
        let expected_ntt = context_data.scheme() != SchemeType::Bfv;
        if ct.is_ntt_form() != expected_ntt {
            return Err(Error::InvalidOperand("ciphertext is in the wrong form"));
        }
        Ok(context_data)
    }

    pub fn decrypt(&self, ct: &Ciphertext) -> Result<Plaintext, Error> {
        let context_data = self.check(ct)?;
        let mut noisy = self.dot_product_with_secret(ct, &context_data);
        let n = context_data.poly_modulus_degree();
        let t = *context_data.plain_modulus();

        match context_data.scheme() {
            SchemeType::Bfv => {
                poly::ntt_inverse(&mut noisy, context_data.ntt_tables());
                let base = context_data.rns_base();
                let q = base.product();
                let two_q = q << 1u32;
                let two_t = BigUint::from(t.value()) << 1u32;
                let coeffs = (0..n)
                    .map(|j| {
                        let x = base.compose((0..base.len()).map(|i| noisy[i * n + j]));
                        // round(t x / Q) mod t
                        let scaled = (&two_t * x + q) / &two_q;
                        (scaled % t.value()).to_u64().unwrap_or_default()
                    })
                    .collect();
                Ok(Plaintext::from_coeffs(coeffs))
            }
            SchemeType::Bgv => {
                poly::ntt_inverse(&mut noisy, context_data.ntt_tables());
                let base = context_data.rns_base();
                let modulus = BigInt::from(t.value());
                let inverse = t
                    .inverse(ct.correction_factor())
                    .ok_or(Error::InvalidOperand("correction factor is not invertible"))?;
                let coeffs = (0..n)
                    .map(|j| {
                        let x = base.compose_centered((0..base.len()).map(|i| noisy[i * n + j]));
                        let m = x.mod_floor(&modulus).to_u64().unwrap_or_default();
                        t.mul(m, inverse)
                    })
                    .collect();
                Ok(Plaintext::from_coeffs(coeffs))
            }
            _ => Ok(Plaintext::from_ntt(noisy, ct.parms_id(), ct.scale())),
        }
    }

    /// Bits of noise left before decryption fails: `log2(Q) - log2(|v|) - 1`
    /// where `v` is the scaled noise, or zero once it is used up.
    pub fn invariant_noise_budget(&self, ct: &Ciphertext) -> Result<u32, Error> {
        let context_data = self.check(ct)?;
        let scheme = context_data.scheme();
        if scheme == SchemeType::Ckks {
            return Err(Error::InvalidOperand("CKKS ciphertexts have no noise budget"));
        }
        let mut noisy = self.dot_product_with_secret(ct, &context_data);
        poly::ntt_inverse(&mut noisy, context_data.ntt_tables());
        if scheme == SchemeType::Bfv {
            poly::mul_scalar(
                &mut noisy,
                context_data.plain_modulus().value(),
                context_data.coeff_modulus(),
            );
        }

        let n = context_data.poly_modulus_degree();
        let base = context_data.rns_base();
        let norm_bits = (0..n)
            .map(|j| {
                base.compose_centered((0..base.len()).map(|i| noisy[i * n + j]))
                    .abs()
                    .bits()
            })
            .max()
            .unwrap_or(0);
        let budget = (context_data.total_coeff_modulus_bit_count() as u64)
            .saturating_sub(norm_bits + 1) as u32;
        if budget == 0 {
            warn!("noise budget of ciphertext at {} is exhausted", ct.parms_id());
        }
        Ok(budget)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        context::tests::{bfv_context, bgv_context, ckks_context},
        encryptor::Encryptor,
        keys::KeyGenerator,
    };

    use super::*;

    #[test]
    fn bfv_coefficient_decryption() {
        let context = bfv_context(1024, &[40, 40, 40], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let encryptor = Encryptor::new(&context)
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let t = context.parameters().plain_modulus().value();

        let plain = Plaintext::from_coeffs(vec![t - 1, 0, 1, 12345]);
        let ct = encryptor.encrypt_symmetric(&plain).unwrap();
        assert_eq!(decryptor.decrypt(&ct).unwrap(), plain);
        let budget = decryptor.invariant_noise_budget(&ct).unwrap();
        assert!(budget > 20 && budget < 80 - 20, "budget {}", budget);
    }

    #[test]
    fn bgv_decryption_applies_correction_factor() {
        let context = bgv_context(1024, &[40, 40, 40], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let encryptor = Encryptor::new(&context)
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let t = *context.parameters().plain_modulus();

        // Scaling every component by f gives an encryption of f m with
        // correction factor f.
        let plain = Plaintext::from_coeffs(vec![3, 4, 5]);
        let mut ct = encryptor.encrypt_symmetric(&plain).unwrap();
        let data = context.first_context_data().unwrap();
        poly::mul_scalar(ct.data_mut(), 7, data.coeff_modulus());
        ct.set_correction_factor(7);
        assert_eq!(decryptor.decrypt(&ct).unwrap(), plain);
        ct.set_correction_factor(1);
        let expected: Vec<u64> = [3, 4, 5].iter().map(|&m| t.mul(m, 7)).collect();
        assert_eq!(decryptor.decrypt(&ct).unwrap(), Plaintext::from_coeffs(expected));
    }

    #[test]
    fn budget_is_zero_for_garbage_and_undefined_for_ckks() {
        let context = bfv_context(1024, &[40, 40, 40], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let mut ct = Ciphertext::new_at(&context, &context.first_parms_id(), 2).unwrap();
        let data = context.first_context_data().unwrap();
        for (row, q) in ct.data_mut().chunks_exact_mut(1024).zip(data.coeff_modulus().iter().cycle()) {
            for (i, x) in row.iter_mut().enumerate() {
                *x = q.reduce((i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            }
        }
        assert!(decryptor.invariant_noise_budget(&ct).unwrap() <= 1);

        let context = ckks_context(1024, &[40, 40]);
        let keygen = KeyGenerator::new(&context).unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let ct = Encryptor::new(&context)
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap()
            .encrypt_zero_symmetric()
            .unwrap();
        assert!(matches!(
            decryptor.invariant_noise_budget(&ct),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn rejects_foreign_ciphertexts() {
        let context = bfv_context(1024, &[40, 40, 40], 20);
        let keygen = KeyGenerator::new(&context).unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let other = bfv_context(1024, &[40, 40, 30], 20);
        let ct = Ciphertext::new_at(&other, &other.first_parms_id(), 2).unwrap();
        assert!(decryptor.decrypt(&ct).is_err());
        assert!(decryptor.decrypt(&Ciphertext::new()).is_err());
    }
}
