//! Homomorphic operations.
//!
//! Every operation has an in-place form that does the work and an
//! out-of-place form that clones its first operand and delegates.  Operands
//! are checked against the context before they are modified; a result that
//! turns out transparent is reported afterwards.

use std::{borrow::Cow, collections::VecDeque, sync::Arc};

use log::trace;
use num_bigint::BigInt;
use num_integer::Integer;

use crate::{
    ciphertext::{Ciphertext, CIPHERTEXT_SIZE_MAX},
    context::{Context, ContextData},
    encryptor::{check_plain_coeffs, lift_plain, scale_plain},
    error::Error,
    keys::{galois_elt_from_step, GaloisKeys, PublicKey, RelinKeys},
    memory::MemoryPool,
    params::{ParmsId, SchemeType},
    plaintext::Plaintext,
    ring::{poly, Modulus, NttTables},
};

// Two CKKS scales are equal if they differ by at most this relative amount.
const SCALE_TOLERANCE: f64 = 1.0 / (1u64 << 20) as f64;

fn scales_match(a: f64, b: f64) -> bool {
    (a - b).abs() <= a.max(b) * SCALE_TOLERANCE
}

fn scale_bit_count(scale: f64) -> u32 {
    scale.log2().floor() as u32 + 1
}

fn check_not_transparent(ct: &Ciphertext) -> Result<(), Error> {
    if ct.is_transparent() {
        return Err(Error::TransparentCiphertext);
    }
    Ok(())
}

/// `out[i + j] += a[i] * b[j]` over components of `len` words.
fn tensor(a: &[u64], b: &[u64], len: usize, moduli: &[Modulus], out: &mut [u64]) {
    for (i, a) in a.chunks_exact(len).enumerate() {
        for (j, b) in b.chunks_exact(len).enumerate() {
            poly::mul_acc(&mut out[(i + j) * len..(i + j + 1) * len], a, b, moduli);
        }
    }
}

/// Factors `(e1, e2, f)` with `e1 * f1 = e2 * f2 = f (mod t)` and `e1`, `e2`
/// small, found along the extended Euclidean algorithm for `f2 / f1`.
fn balance_correction_factors(f1: u64, f2: u64, t: &Modulus) -> Result<(u64, u64, u64), Error> {
    let ratio = t
        .inverse(f1)
        .map(|inverse| t.mul(inverse, f2))
        .ok_or(Error::InvalidOperand("correction factor is not invertible"))?;
    let cost = |x: u64, y: u64| t.center(x).unsigned_abs() + t.center(y).unsigned_abs();

    let (mut e1, mut e2) = (ratio, 1);
    let mut best = cost(e1, e2);
    let (mut prev_a, mut a) = (t.value() as i64, ratio as i64);
    let (mut prev_b, mut b) = (0i64, 1i64);
    while a != 0 {
        let quotient = prev_a / a;
        (prev_a, a) = (a, prev_a % a);
        (prev_b, b) = (b, prev_b.wrapping_sub(b.wrapping_mul(quotient)));
        let a_mod = t.reduce_i64(a);
        let b_mod = t.reduce_i64(b);
        if a_mod != 0 && num_integer::gcd(a_mod, t.value()) == 1 && cost(a_mod, b_mod) < best {
            best = cost(a_mod, b_mod);
            (e1, e2) = (a_mod, b_mod);
        }
    }
    Ok((e1, e2, t.mul(e1, f1)))
}

/// Non-adjacent form of `value`: signed powers of two summing to it.
fn naf(mut value: i32) -> Vec<i32> {
    let mut terms = Vec::new();
    let mut bit = 0;
    while value != 0 {
        if value & 1 != 0 {
            let digit = 2 - value.rem_euclid(4);
            terms.push(digit << bit);
            value -= digit;
        }
        value >>= 1;
        bit += 1;
    }
    terms
}

#[derive(Debug)]
pub struct Evaluator {
    context: Context,
    pool: MemoryPool,
}

impl Evaluator {
    /// Scratch buffers come from the global [`MemoryPool`].
    pub fn new(context: &Context) -> Result<Self, Error> {
        Self::with_memory_pool(context, MemoryPool::global())
    }

    pub fn with_memory_pool(context: &Context, pool: MemoryPool) -> Result<Self, Error> {
        context.ensure_valid()?;
        Ok(Self {
            context: context.clone(),
            pool,
        })
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Level of `ct`, which must be in the scheme's working form.
    fn ct_data(&self, ct: &Ciphertext) -> Result<Arc<ContextData>, Error> {
        let data = self.context.data(&ct.parms_id())?;
        ct.check_shape(&data)?;
        if data.scheme() != SchemeType::Bfv && !ct.is_ntt_form() {
            return Err(Error::InvalidOperand("ciphertext must be in NTT form"));
        }
        Ok(data)
    }

    /// Like [`ct_data`](Self::ct_data), and BFV ciphertexts must be in
    /// coefficient form.
    fn ct_data_coeff_bfv(&self, ct: &Ciphertext) -> Result<Arc<ContextData>, Error> {
        let data = self.ct_data(ct)?;
        if data.scheme() == SchemeType::Bfv && ct.is_ntt_form() {
            return Err(Error::InvalidOperand("BFV ciphertext must not be in NTT form"));
        }
        Ok(data)
    }

    fn require_scheme(data: &ContextData, schemes: &[SchemeType]) -> Result<(), Error> {
        if !schemes.contains(&data.scheme()) {
            return Err(Error::InvalidOperand("operation is not supported by the scheme"));
        }
        Ok(())
    }

    pub fn negate_inplace(&self, ct: &mut Ciphertext) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        poly::negate(ct.data_mut(), data.coeff_modulus());
        Ok(())
    }

    pub fn negate(&self, ct: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.negate_inplace(&mut result)?;
        Ok(result)
    }

    /// Brings both operands to the lower of their levels and to a common
    /// scale or correction factor.
    fn align<'a>(
        &self,
        a: &mut Ciphertext,
        b: &'a Ciphertext,
    ) -> Result<(Arc<ContextData>, Cow<'a, Ciphertext>), Error> {
        let data_a = self.ct_data(a)?;
        let data_b = self.ct_data(b)?;
        if a.is_ntt_form() != b.is_ntt_form() {
            return Err(Error::InvalidOperand("operands are in different forms"));
        }
        // Dropping moduli leaves CKKS scales untouched.
        if data_a.scheme() == SchemeType::Ckks && !scales_match(a.scale(), b.scale()) {
            return Err(Error::LevelMismatch);
        }

        let mut b = Cow::Borrowed(b);
        let data = if data_a.chain_index() > data_b.chain_index() {
            self.mod_switch_to_inplace(a, &data_b.parms_id())?;
            data_b
        } else if data_b.chain_index() > data_a.chain_index() {
            self.mod_switch_to_inplace(b.to_mut(), &data_a.parms_id())?;
            data_a
        } else {
            data_a
        };

        if data.scheme() == SchemeType::Bgv && a.correction_factor() != b.correction_factor() {
            let t = data.plain_modulus();
            let (e1, e2, factor) =
                balance_correction_factors(a.correction_factor(), b.correction_factor(), t)?;
            poly::mul_scalar(a.data_mut(), e1, data.coeff_modulus());
            poly::mul_scalar(b.to_mut().data_mut(), e2, data.coeff_modulus());
            a.set_correction_factor(factor);
        }
        Ok((data, b))
    }

    fn add_or_sub_inplace(&self, a: &mut Ciphertext, b: &Ciphertext, sub: bool) -> Result<(), Error> {
        let (data, b) = self.align(a, b)?;
        let moduli = data.coeff_modulus();
        if b.size() > a.size() {
            a.resize(b.size())?;
        }
        for i in 0..b.size() {
            if sub {
                poly::sub_assign(a.poly_mut(i), b.poly(i), moduli);
            } else {
                poly::add_assign(a.poly_mut(i), b.poly(i), moduli);
            }
        }
        trace!("{} at {}, size {}", if sub { "sub" } else { "add" }, data.parms_id(), a.size());
        check_not_transparent(a)
    }

    /// Operands at different levels are first switched down to the lower one.
    pub fn add_inplace(&self, a: &mut Ciphertext, b: &Ciphertext) -> Result<(), Error> {
        self.add_or_sub_inplace(a, b, false)
    }

    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = a.clone();
        self.add_inplace(&mut result, b)?;
        Ok(result)
    }

    pub fn add_many(&self, cts: &[Ciphertext]) -> Result<Ciphertext, Error> {
        let (first, rest) = cts
            .split_first()
            .ok_or(Error::InvalidOperand("nothing to add"))?;
        let mut result = first.clone();
        for ct in rest {
            self.add_inplace(&mut result, ct)?;
        }
        Ok(result)
    }

    pub fn sub_inplace(&self, a: &mut Ciphertext, b: &Ciphertext) -> Result<(), Error> {
        self.add_or_sub_inplace(a, b, true)
    }

    pub fn sub(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = a.clone();
        self.sub_inplace(&mut result, b)?;
        Ok(result)
    }

    fn add_or_sub_plain_inplace(
        &self,
        ct: &mut Ciphertext,
        plain: &Plaintext,
        sub: bool,
    ) -> Result<(), Error> {
        let data = self.ct_data_coeff_bfv(ct)?;
        let n = data.poly_modulus_degree();
        let moduli = data.coeff_modulus();
        let mut encoded = self.pool.allocate(n * data.coeff_modulus_size());
        match data.scheme() {
            SchemeType::Bfv => {
                check_plain_coeffs(plain, &data)?;
                scale_plain(plain, &data, &mut encoded);
            }
            SchemeType::Bgv => {
                check_plain_coeffs(plain, &data)?;
                let t = data.plain_modulus();
                let factor = ct.correction_factor();
                let scaled = Plaintext::from_coeffs(
                    plain.data().iter().map(|&m| t.mul(m, factor)).collect(),
                );
                lift_plain(&scaled, &data, &mut encoded);
                poly::ntt_forward(&mut encoded, data.ntt_tables());
            }
            _ => {
                if plain.parms_id() != ct.parms_id() || plain.coeff_count() != encoded.len() {
                    return Err(Error::InvalidOperand("plaintext is not at the ciphertext's level"));
                }
                if !scales_match(plain.scale(), ct.scale()) {
                    return Err(Error::LevelMismatch);
                }
                encoded.copy_from_slice(plain.data());
            }
        }
        if sub {
            poly::sub_assign(ct.poly_mut(0), &encoded, moduli);
        } else {
            poly::add_assign(ct.poly_mut(0), &encoded, moduli);
        }
        Ok(())
    }

    pub fn add_plain_inplace(&self, ct: &mut Ciphertext, plain: &Plaintext) -> Result<(), Error> {
        self.add_or_sub_plain_inplace(ct, plain, false)
    }

    pub fn add_plain(&self, ct: &Ciphertext, plain: &Plaintext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.add_plain_inplace(&mut result, plain)?;
        Ok(result)
    }

    pub fn sub_plain_inplace(&self, ct: &mut Ciphertext, plain: &Plaintext) -> Result<(), Error> {
        self.add_or_sub_plain_inplace(ct, plain, true)
    }

    pub fn sub_plain(&self, ct: &Ciphertext, plain: &Plaintext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.sub_plain_inplace(&mut result, plain)?;
        Ok(result)
    }

    /// BFV tensor product: lift both operands to the level's multiplication
    /// base, multiply exactly there, then scale by `t / Q` and round.
    fn bfv_multiply(&self, a: &mut Ciphertext, b: &Ciphertext, data: &ContextData) -> Result<(), Error> {
        let base = data
            .multiply_base()
            .ok_or(Error::InvalidOperand("level has no multiplication base"))?;
        let n = data.poly_modulus_degree();
        let k = data.coeff_modulus_size();
        let wide_len = n * base.base.len();
        let level = data.rns_base();

        let lift = |ct: &Ciphertext| {
            let mut out = self.pool.allocate(ct.size() * wide_len);
            for (i, chunk) in out.chunks_exact_mut(wide_len).enumerate() {
                let values = level.compose_poly_centered(ct.poly(i));
                base.base.decompose_poly(&values, chunk);
            }
            poly::ntt_forward(&mut out, &base.ntt_tables);
            out
        };
        let lhs = lift(&*a);
        let rhs = lift(b);
        let size = a.size() + b.size() - 1;
        let mut product = self.pool.allocate(size * wide_len);
        tensor(&lhs, &rhs, wide_len, base.base.moduli(), &mut product);
        poly::ntt_inverse(&mut product, &base.ntt_tables);

        let t = BigInt::from(data.plain_modulus().value());
        let q = BigInt::from(level.product().clone());
        let two_q = &q << 1u32;
        let mut result = vec![0; size * n * k];
        for (wide, out) in product.chunks_exact(wide_len).zip(result.chunks_exact_mut(n * k)) {
            let values: Vec<BigInt> = base
                .base
                .compose_poly_centered(wide)
                .into_iter()
                .map(|x| (&t * x * 2u32 + &q).div_floor(&two_q))
                .collect();
            level.decompose_poly(&values, out);
        }
        *a.data_vec_mut() = result;
        a.set_size(size);
        Ok(())
    }

    /// Size grows from `(s1, s2)` to `s1 + s2 - 1`.  Operands must be at the
    /// same level; the CKKS scale multiplies.
    pub fn multiply_inplace(&self, a: &mut Ciphertext, b: &Ciphertext) -> Result<(), Error> {
        let data = self.ct_data_coeff_bfv(a)?;
        self.ct_data_coeff_bfv(b)?;
        if a.parms_id() != b.parms_id() {
            return Err(Error::LevelMismatch);
        }
        if a.is_ntt_form() != b.is_ntt_form() {
            return Err(Error::InvalidOperand("operands are in different forms"));
        }
        let size = a.size() + b.size() - 1;
        if size > CIPHERTEXT_SIZE_MAX {
            return Err(Error::InvalidOperand("ciphertext size is too large"));
        }

        match data.scheme() {
            SchemeType::Bfv => self.bfv_multiply(a, b, &data)?,
            scheme => {
                let scale = a.scale() * b.scale();
                if scheme == SchemeType::Ckks
                    && scale_bit_count(scale) >= data.total_coeff_modulus_bit_count()
                {
                    return Err(Error::InvalidOperand("scale out of bounds"));
                }
                let len = data.poly_modulus_degree() * data.coeff_modulus_size();
                let mut product = vec![0; size * len];
                tensor(a.data(), b.data(), len, data.coeff_modulus(), &mut product);
                *a.data_vec_mut() = product;
                a.set_size(size);
                if scheme == SchemeType::Ckks {
                    a.set_scale(scale);
                } else {
                    let t = data.plain_modulus();
                    a.set_correction_factor(t.mul(a.correction_factor(), b.correction_factor()));
                }
            }
        }
        trace!("multiply at {}, size {}", data.parms_id(), size);
        check_not_transparent(a)
    }

    pub fn multiply(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = a.clone();
        self.multiply_inplace(&mut result, b)?;
        Ok(result)
    }

    pub fn square_inplace(&self, ct: &mut Ciphertext) -> Result<(), Error> {
        let copy = ct.clone();
        self.multiply_inplace(ct, &copy)
    }

    pub fn square(&self, ct: &Ciphertext) -> Result<Ciphertext, Error> {
        self.multiply(ct, ct)
    }

    /// Multiplies pairwise in a balanced tree, relinearizing every product.
    /// BFV and BGV only.
    pub fn multiply_many(&self, cts: &[Ciphertext], relin_keys: &RelinKeys) -> Result<Ciphertext, Error> {
        let first = cts
            .first()
            .ok_or(Error::InvalidOperand("nothing to multiply"))?;
        Self::require_scheme(&*self.ct_data(first)?, &[SchemeType::Bfv, SchemeType::Bgv])?;

        let mut queue: VecDeque<Ciphertext> = cts.iter().cloned().collect();
        while queue.len() > 1 {
            let (Some(mut a), Some(b)) = (queue.pop_front(), queue.pop_front()) else {
                break;
            };
            self.multiply_inplace(&mut a, &b)?;
            self.relinearize_inplace(&mut a, relin_keys)?;
            queue.push_back(a);
        }
        queue
            .pop_front()
            .ok_or(Error::InvalidOperand("nothing to multiply"))
    }

    pub fn exponentiate_inplace(
        &self,
        ct: &mut Ciphertext,
        exponent: u64,
        relin_keys: &RelinKeys,
    ) -> Result<(), Error> {
        *ct = self.exponentiate(ct, exponent, relin_keys)?;
        Ok(())
    }

    /// Square-and-multiply, relinearizing every product.  BFV and BGV only;
    /// the exponent must be positive.
    pub fn exponentiate(
        &self,
        ct: &Ciphertext,
        exponent: u64,
        relin_keys: &RelinKeys,
    ) -> Result<Ciphertext, Error> {
        Self::require_scheme(&*self.ct_data(ct)?, &[SchemeType::Bfv, SchemeType::Bgv])?;
        if exponent == 0 {
            return Err(Error::InvalidOperand("exponent must be positive"));
        }

        let mut power = ct.clone();
        let mut result: Option<Ciphertext> = None;
        let mut remaining = exponent;
        loop {
            if remaining & 1 == 1 {
                result = Some(match result {
                    None => power.clone(),
                    Some(mut acc) => {
                        self.multiply_inplace(&mut acc, &power)?;
                        self.relinearize_inplace(&mut acc, relin_keys)?;
                        acc
                    }
                });
            }
            remaining >>= 1;
            if remaining == 0 {
                break;
            }
            self.square_inplace(&mut power)?;
            self.relinearize_inplace(&mut power, relin_keys)?;
        }
        result.ok_or(Error::InvalidOperand("exponent must be positive"))
    }

    pub fn multiply_plain_inplace(&self, ct: &mut Ciphertext, plain: &Plaintext) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        let n = data.poly_modulus_degree();
        let len = n * data.coeff_modulus_size();
        let moduli = data.coeff_modulus();
        let tables = data.ntt_tables();

        if plain.is_ntt_form() {
            if plain.parms_id() != ct.parms_id() || plain.coeff_count() != len || !ct.is_ntt_form() {
                return Err(Error::InvalidOperand("plaintext is not at the ciphertext's level"));
            }
            if data.scheme() == SchemeType::Ckks {
                let scale = ct.scale() * plain.scale();
                if scale_bit_count(scale) >= data.total_coeff_modulus_bit_count() {
                    return Err(Error::InvalidOperand("scale out of bounds"));
                }
                ct.set_scale(scale);
            }
            for component in ct.data_mut().chunks_exact_mut(len) {
                poly::mul_assign(component, plain.data(), moduli);
            }
        } else {
            Self::require_scheme(&data, &[SchemeType::Bfv, SchemeType::Bgv])?;
            check_plain_coeffs(plain, &data)?;
            if ct.is_ntt_form() != (data.scheme() == SchemeType::Bgv) {
                return Err(Error::InvalidOperand("ciphertext is in the wrong form"));
            }
            let mut lifted = self.pool.allocate(len);
            lift_plain(plain, &data, &mut lifted);
            poly::ntt_forward(&mut lifted, tables);
            let coefficient_form = !ct.is_ntt_form();
            if coefficient_form {
                poly::ntt_forward(ct.data_mut(), tables);
            }
            for component in ct.data_mut().chunks_exact_mut(len) {
                poly::mul_assign(component, &lifted, moduli);
            }
            if coefficient_form {
                poly::ntt_inverse(ct.data_mut(), tables);
            }
        }
        trace!("multiply_plain at {}", data.parms_id());
        check_not_transparent(ct)
    }

    pub fn multiply_plain(&self, ct: &Ciphertext, plain: &Plaintext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.multiply_plain_inplace(&mut result, plain)?;
        Ok(result)
    }

    /// Adds `target * s'` re-encrypted under `s` to `ct`, where the keys
    /// switch from `s'`.  `target` is one polynomial at the level of `ct`, in
    /// coefficient form.
    fn switch_key_inplace(
        &self,
        ct: &mut Ciphertext,
        data: &ContextData,
        target: &[u64],
        keys: &[PublicKey],
    ) -> Result<(), Error> {
        let key_data = self.context.key_data()?;
        let base = data
            .key_switch_base()
            .ok_or(Error::InvalidOperand("key switching is not supported by these parameters"))?;
        let n = data.poly_modulus_degree();
        let k = data.coeff_modulus_size();
        let special = key_data.coeff_modulus_size() - 1;
        if keys.len() < k
            || keys
                .iter()
                .any(|key| key.parms_id() != key_data.parms_id() || key.data().check_shape(&key_data).is_err())
        {
            return Err(Error::InvalidKey);
        }

        let moduli = base.moduli();
        let tables: Vec<&NttTables> = data
            .ntt_tables()
            .iter()
            .chain(&key_data.ntt_tables()[special..])
            .collect();
        let wide_len = n * (k + 1);
        let mut acc = self.pool.allocate(2 * wide_len);
        let mut digit = self.pool.allocate(n);

        for (j, key) in keys[..k].iter().enumerate() {
            let source = &target[j * n..(j + 1) * n];
            for (r, (q, table)) in moduli.iter().zip(&tables).enumerate() {
                if r == j {
                    digit.copy_from_slice(source);
                } else {
                    for (x, &c) in digit.iter_mut().zip(source) {
                        *x = q.reduce(c);
                    }
                }
                table.forward(&mut digit);
                let key_row = if r < k { r } else { special };
                for c in 0..2 {
                    let key_poly = &key.data().poly(c)[key_row * n..(key_row + 1) * n];
                    let acc_row = &mut acc[c * wide_len + r * n..c * wide_len + (r + 1) * n];
                    for ((z, &x), &y) in acc_row.iter_mut().zip(digit.iter()).zip(key_poly) {
                        *z = q.mul_add(x, y, *z);
                    }
                }
            }
        }

        let mut switched = self.pool.allocate(n * k);
        for (c, component) in acc.chunks_exact_mut(wide_len).enumerate() {
            for (row, table) in component.chunks_exact_mut(n).zip(&tables) {
                table.inverse(row);
            }
            if data.scheme() == SchemeType::Bgv {
                base.mod_t_and_divide_q_last(component, data.plain_modulus(), &mut switched)?;
            } else {
                base.divide_and_round_q_last(component, &mut switched);
            }
            if ct.is_ntt_form() {
                poly::ntt_forward(&mut switched, data.ntt_tables());
            }
            poly::add_assign(ct.poly_mut(c), &switched, data.coeff_modulus());
        }
        Ok(())
    }

    /// Reduces the size back to two.
    pub fn relinearize_inplace(&self, ct: &mut Ciphertext, relin_keys: &RelinKeys) -> Result<(), Error> {
        let data = self.ct_data_coeff_bfv(ct)?;
        if relin_keys.parms_id() != self.context.key_parms_id() {
            return Err(Error::InvalidKey);
        }
        if (2..ct.size()).any(|power| !relin_keys.has_key(power)) {
            return Err(Error::InvalidOperand("not enough relinearization keys"));
        }

        let len = data.poly_modulus_degree() * data.coeff_modulus_size();
        let mut target = self.pool.allocate(len);
        while ct.size() > 2 {
            let last = ct.size() - 1;
            target.copy_from_slice(ct.poly(last));
            if ct.is_ntt_form() {
                poly::ntt_inverse(&mut target, data.ntt_tables());
            }
            let keys = relin_keys
                .key(last)
                .ok_or(Error::InvalidOperand("not enough relinearization keys"))?;
            self.switch_key_inplace(ct, &data, &target, keys)?;
            ct.resize(last)?;
        }
        trace!("relinearized at {}", data.parms_id());
        Ok(())
    }

    pub fn relinearize(&self, ct: &Ciphertext, relin_keys: &RelinKeys) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.relinearize_inplace(&mut result, relin_keys)?;
        Ok(result)
    }

    fn next_data(&self, data: &ContextData) -> Result<Arc<ContextData>, Error> {
        let next = data.next_parms_id().ok_or(Error::EndOfModulusChain)?;
        self.context.data(&next)
    }

    /// Drops the last modulus.  BFV and BGV scale the ciphertext down with
    /// it; CKKS keeps the value and its scale.
    pub fn mod_switch_to_next_inplace(&self, ct: &mut Ciphertext) -> Result<(), Error> {
        let data = self.ct_data_coeff_bfv(ct)?;
        let next = self.next_data(&data)?;
        let n = data.poly_modulus_degree();
        let len = n * data.coeff_modulus_size();
        let next_len = n * next.coeff_modulus_size();
        let mut result = vec![0; ct.size() * next_len];

        match data.scheme() {
            SchemeType::Bfv => {
                for (input, out) in ct.data().chunks_exact(len).zip(result.chunks_exact_mut(next_len)) {
                    data.rns_base().divide_and_round_q_last(input, out);
                }
            }
            SchemeType::Bgv => {
                let mut coeffs = self.pool.allocate(len);
                for (input, out) in ct.data().chunks_exact(len).zip(result.chunks_exact_mut(next_len)) {
                    coeffs.copy_from_slice(input);
                    poly::ntt_inverse(&mut coeffs, data.ntt_tables());
                    data.rns_base()
                        .mod_t_and_divide_q_last(&coeffs, data.plain_modulus(), out)?;
                }
                poly::ntt_forward(&mut result, next.ntt_tables());
                let t = data.plain_modulus();
                let q_last = data.coeff_modulus()[data.coeff_modulus_size() - 1].value();
                let inverse = t
                    .inverse(t.reduce(q_last))
                    .ok_or(Error::InvalidOperand("modulus is not invertible mod t"))?;
                ct.set_correction_factor(t.mul(ct.correction_factor(), inverse));
            }
            _ => {
                for (input, out) in ct.data().chunks_exact(len).zip(result.chunks_exact_mut(next_len)) {
                    out.copy_from_slice(&input[..next_len]);
                }
            }
        }
        *ct.data_vec_mut() = result;
        ct.set_parms_id(next.parms_id(), next.coeff_modulus_size());
        trace!("mod switched {} -> {}", data.parms_id(), next.parms_id());
        Ok(())
    }

    pub fn mod_switch_to_next(&self, ct: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.mod_switch_to_next_inplace(&mut result)?;
        Ok(result)
    }

    /// Index of a level below (or at) the current one; switching up is an
    /// error.
    fn target_chain_index(&self, current: &ContextData, parms_id: &ParmsId) -> Result<usize, Error> {
        let target = self.context.data(parms_id)?;
        if target.chain_index() > current.chain_index() {
            return Err(Error::InvalidOperand("cannot switch to a higher level"));
        }
        Ok(target.chain_index())
    }

    pub fn mod_switch_to_inplace(&self, ct: &mut Ciphertext, parms_id: &ParmsId) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        self.target_chain_index(&data, parms_id)?;
        while ct.parms_id() != *parms_id {
            self.mod_switch_to_next_inplace(ct)?;
        }
        Ok(())
    }

    pub fn mod_switch_to(&self, ct: &Ciphertext, parms_id: &ParmsId) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.mod_switch_to_inplace(&mut result, parms_id)?;
        Ok(result)
    }

    /// Drops the last row of a plaintext in NTT form.
    pub fn mod_switch_to_next_plain_inplace(&self, plain: &mut Plaintext) -> Result<(), Error> {
        if !plain.is_ntt_form() {
            return Err(Error::InvalidOperand("plaintext is not in NTT form"));
        }
        let data = self.context.data(&plain.parms_id())?;
        let next = self.next_data(&data)?;
        let n = data.poly_modulus_degree();
        if plain.coeff_count() != n * data.coeff_modulus_size() {
            return Err(Error::InvalidOperand("plaintext is not valid for its level"));
        }
        plain.resize(n * next.coeff_modulus_size());
        plain.set_parms_id(next.parms_id());
        Ok(())
    }

    pub fn mod_switch_to_next_plain(&self, plain: &Plaintext) -> Result<Plaintext, Error> {
        let mut result = plain.clone();
        self.mod_switch_to_next_plain_inplace(&mut result)?;
        Ok(result)
    }

    pub fn mod_switch_to_plain_inplace(&self, plain: &mut Plaintext, parms_id: &ParmsId) -> Result<(), Error> {
        if !plain.is_ntt_form() {
            return Err(Error::InvalidOperand("plaintext is not in NTT form"));
        }
        let data = self.context.data(&plain.parms_id())?;
        self.target_chain_index(&data, parms_id)?;
        while plain.parms_id() != *parms_id {
            self.mod_switch_to_next_plain_inplace(plain)?;
        }
        Ok(())
    }

    pub fn mod_switch_to_plain(&self, plain: &Plaintext, parms_id: &ParmsId) -> Result<Plaintext, Error> {
        let mut result = plain.clone();
        self.mod_switch_to_plain_inplace(&mut result, parms_id)?;
        Ok(result)
    }

    /// CKKS only: divides the ciphertext and its scale by the last modulus.
    /// The scale must not be (noticeably) smaller than that modulus.
    pub fn rescale_to_next_inplace(&self, ct: &mut Ciphertext) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        Self::require_scheme(&data, &[SchemeType::Ckks])?;
        let next = self.next_data(&data)?;
        let q_last = data.coeff_modulus()[data.coeff_modulus_size() - 1].value() as f64;
        if ct.scale() * (1.0 + SCALE_TOLERANCE) < q_last {
            return Err(Error::ScaleMismatch);
        }

        let n = data.poly_modulus_degree();
        let len = n * data.coeff_modulus_size();
        let next_len = n * next.coeff_modulus_size();
        let mut result = vec![0; ct.size() * next_len];
        let mut coeffs = self.pool.allocate(len);
        for (input, out) in ct.data().chunks_exact(len).zip(result.chunks_exact_mut(next_len)) {
            coeffs.copy_from_slice(input);
            poly::ntt_inverse(&mut coeffs, data.ntt_tables());
            data.rns_base().divide_and_round_q_last(&coeffs, out);
        }
        poly::ntt_forward(&mut result, next.ntt_tables());

        *ct.data_vec_mut() = result;
        ct.set_parms_id(next.parms_id(), next.coeff_modulus_size());
        ct.set_scale(ct.scale() / q_last);
        trace!("rescaled to {}, scale 2^{:.2}", next.parms_id(), ct.scale().log2());
        Ok(())
    }

    pub fn rescale_to_next(&self, ct: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.rescale_to_next_inplace(&mut result)?;
        Ok(result)
    }

    pub fn rescale_to_inplace(&self, ct: &mut Ciphertext, parms_id: &ParmsId) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        Self::require_scheme(&data, &[SchemeType::Ckks])?;
        self.target_chain_index(&data, parms_id)?;
        while ct.parms_id() != *parms_id {
            self.rescale_to_next_inplace(ct)?;
        }
        Ok(())
    }

    pub fn rescale_to(&self, ct: &Ciphertext, parms_id: &ParmsId) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.rescale_to_inplace(&mut result, parms_id)?;
        Ok(result)
    }

    fn ct_data_any_form(&self, ct: &Ciphertext) -> Result<Arc<ContextData>, Error> {
        let data = self.context.data(&ct.parms_id())?;
        ct.check_shape(&data)?;
        Ok(data)
    }

    pub fn transform_to_ntt_inplace(&self, ct: &mut Ciphertext) -> Result<(), Error> {
        let data = self.ct_data_any_form(ct)?;
        if ct.is_ntt_form() {
            return Err(Error::InvalidOperand("ciphertext is already in NTT form"));
        }
        poly::ntt_forward(ct.data_mut(), data.ntt_tables());
        ct.set_ntt_form(true);
        Ok(())
    }

    pub fn transform_to_ntt(&self, ct: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.transform_to_ntt_inplace(&mut result)?;
        Ok(result)
    }

    pub fn transform_from_ntt_inplace(&self, ct: &mut Ciphertext) -> Result<(), Error> {
        let data = self.ct_data_any_form(ct)?;
        if !ct.is_ntt_form() {
            return Err(Error::InvalidOperand("ciphertext is not in NTT form"));
        }
        poly::ntt_inverse(ct.data_mut(), data.ntt_tables());
        ct.set_ntt_form(false);
        Ok(())
    }

    pub fn transform_from_ntt(&self, ct: &Ciphertext) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.transform_from_ntt_inplace(&mut result)?;
        Ok(result)
    }

    /// BFV and BGV: lifts a plaintext to the level `parms_id` in NTT form,
    /// ready for [`multiply_plain`](Self::multiply_plain) with ciphertexts in
    /// NTT form at that level.
    pub fn transform_plain_to_ntt_inplace(&self, plain: &mut Plaintext, parms_id: &ParmsId) -> Result<(), Error> {
        let data = self.context.data(parms_id)?;
        Self::require_scheme(&data, &[SchemeType::Bfv, SchemeType::Bgv])?;
        check_plain_coeffs(plain, &data)?;
        let mut lifted = vec![0; data.poly_modulus_degree() * data.coeff_modulus_size()];
        lift_plain(plain, &data, &mut lifted);
        poly::ntt_forward(&mut lifted, data.ntt_tables());
        *plain = Plaintext::from_ntt(lifted, *parms_id, 1.0);
        Ok(())
    }

    pub fn transform_plain_to_ntt(&self, plain: &Plaintext, parms_id: &ParmsId) -> Result<Plaintext, Error> {
        let mut result = plain.clone();
        self.transform_plain_to_ntt_inplace(&mut result, parms_id)?;
        Ok(result)
    }

    /// Applies `X -> X^galois_elt` to the encrypted message.
    pub fn apply_galois_inplace(
        &self,
        ct: &mut Ciphertext,
        galois_elt: u32,
        galois_keys: &GaloisKeys,
    ) -> Result<(), Error> {
        let data = self.ct_data_coeff_bfv(ct)?;
        let n = data.poly_modulus_degree();
        if galois_elt % 2 == 0 || galois_elt as usize >= 2 * n {
            return Err(Error::InvalidOperand("invalid Galois element"));
        }
        if galois_keys.parms_id() != self.context.key_parms_id() {
            return Err(Error::InvalidKey);
        }
        let keys = galois_keys
            .key(galois_elt)
            .ok_or(Error::MissingGaloisKey(galois_elt))?;
        if ct.size() != 2 {
            return Err(Error::InvalidOperand("ciphertext must have size two"));
        }

        let len = n * data.coeff_modulus_size();
        let moduli = data.coeff_modulus();
        let mut c0 = self.pool.allocate(len);
        let mut target = self.pool.allocate(len);
        if ct.is_ntt_form() {
            let permutation = poly::galois_ntt_permutation(galois_elt, data.coeff_count_power());
            poly::apply_galois_ntt(ct.poly(0), &permutation, &mut c0);
            poly::apply_galois_ntt(ct.poly(1), &permutation, &mut target);
            poly::ntt_inverse(&mut target, data.ntt_tables());
        } else {
            poly::apply_galois(ct.poly(0), galois_elt, moduli, &mut c0);
            poly::apply_galois(ct.poly(1), galois_elt, moduli, &mut target);
        }
        ct.poly_mut(0).copy_from_slice(&c0);
        ct.poly_mut(1).fill(0);
        self.switch_key_inplace(ct, &data, &target, keys)?;
        trace!("applied Galois element {} at {}", galois_elt, data.parms_id());
        Ok(())
    }

    pub fn apply_galois(
        &self,
        ct: &Ciphertext,
        galois_elt: u32,
        galois_keys: &GaloisKeys,
    ) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.apply_galois_inplace(&mut result, galois_elt, galois_keys)?;
        Ok(result)
    }

    /// Rotation by `steps` slots.  Without a key for the step itself, the
    /// rotation is composed from power-of-two steps.
    fn rotate_internal(
        &self,
        ct: &mut Ciphertext,
        steps: i32,
        galois_keys: &GaloisKeys,
    ) -> Result<(), Error> {
        if steps == 0 {
            return Ok(());
        }
        let n = self.context.data(&ct.parms_id())?.poly_modulus_degree();
        let galois_elt = galois_elt_from_step(steps, n)?;
        if galois_keys.has_key(galois_elt) {
            return self.apply_galois_inplace(ct, galois_elt, galois_keys);
        }

        let slots = (n / 2) as i32;
        let elts = naf(steps)
            .into_iter()
            .filter(|term| term.abs() != slots)
            .map(|term| galois_elt_from_step(term, n))
            .collect::<Result<Vec<_>, _>>()?;
        if elts.iter().any(|&elt| !galois_keys.has_key(elt)) {
            return Err(Error::MissingGaloisKey(galois_elt));
        }
        for elt in elts {
            self.apply_galois_inplace(ct, elt, galois_keys)?;
        }
        Ok(())
    }

    /// BFV and BGV: rotates both rows of the slot matrix left by `steps`
    /// (right for negative steps).
    pub fn rotate_rows_inplace(
        &self,
        ct: &mut Ciphertext,
        steps: i32,
        galois_keys: &GaloisKeys,
    ) -> Result<(), Error> {
        Self::require_scheme(&*self.ct_data(ct)?, &[SchemeType::Bfv, SchemeType::Bgv])?;
        self.rotate_internal(ct, steps, galois_keys)
    }

    pub fn rotate_rows(
        &self,
        ct: &Ciphertext,
        steps: i32,
        galois_keys: &GaloisKeys,
    ) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.rotate_rows_inplace(&mut result, steps, galois_keys)?;
        Ok(result)
    }

    /// BFV and BGV: swaps the two rows of the slot matrix.
    pub fn rotate_columns_inplace(&self, ct: &mut Ciphertext, galois_keys: &GaloisKeys) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        Self::require_scheme(&data, &[SchemeType::Bfv, SchemeType::Bgv])?;
        let elt = (2 * data.poly_modulus_degree() - 1) as u32;
        self.apply_galois_inplace(ct, elt, galois_keys)
    }

    pub fn rotate_columns(&self, ct: &Ciphertext, galois_keys: &GaloisKeys) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.rotate_columns_inplace(&mut result, galois_keys)?;
        Ok(result)
    }

    /// CKKS: rotates the slot vector left by `steps`.
    pub fn rotate_vector_inplace(
        &self,
        ct: &mut Ciphertext,
        steps: i32,
        galois_keys: &GaloisKeys,
    ) -> Result<(), Error> {
        Self::require_scheme(&*self.ct_data(ct)?, &[SchemeType::Ckks])?;
        self.rotate_internal(ct, steps, galois_keys)
    }

    pub fn rotate_vector(
        &self,
        ct: &Ciphertext,
        steps: i32,
        galois_keys: &GaloisKeys,
    ) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.rotate_vector_inplace(&mut result, steps, galois_keys)?;
        Ok(result)
    }

    /// CKKS: conjugates every slot.
    pub fn complex_conjugate_inplace(&self, ct: &mut Ciphertext, galois_keys: &GaloisKeys) -> Result<(), Error> {
        let data = self.ct_data(ct)?;
        Self::require_scheme(&data, &[SchemeType::Ckks])?;
        let elt = (2 * data.poly_modulus_degree() - 1) as u32;
        self.apply_galois_inplace(ct, elt, galois_keys)
    }

    pub fn complex_conjugate(&self, ct: &Ciphertext, galois_keys: &GaloisKeys) -> Result<Ciphertext, Error> {
        let mut result = ct.clone();
        self.complex_conjugate_inplace(&mut result, galois_keys)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex64;

    use crate::{
        batch_encoder::BatchEncoder,
        ckks_encoder::CkksEncoder,
        context::tests::{bfv_context, bgv_context, ckks_context},
        decryptor::Decryptor,
        encryptor::Encryptor,
        keys::KeyGenerator,
        params::{EncryptionParameters, SecurityLevel},
        ring::{CoeffModulus, PlainModulus},
    };

    use super::*;

    struct Harness {
        context: Context,
        keygen: KeyGenerator,
        encryptor: Encryptor,
        decryptor: Decryptor,
        evaluator: Evaluator,
    }

    fn harness(context: Context) -> Harness {
        let keygen = KeyGenerator::new(&context).unwrap();
        let public_key = keygen.create_public_key().unwrap();
        let encryptor = Encryptor::new(&context)
            .unwrap()
            .with_public_key(&public_key)
            .unwrap();
        let decryptor = Decryptor::new(&context, keygen.secret_key()).unwrap();
        let evaluator = Evaluator::new(&context).unwrap();
        Harness {
            context,
            keygen,
            encryptor,
            decryptor,
            evaluator,
        }
    }

    fn slots(count: usize, t: u64, seed: u64) -> Vec<u64> {
        (0..count as u64)
            .map(|i| (i * 7919 + seed * 104_729) % t)
            .collect()
    }

    fn rotate_rows_expected(values: &[u64], steps: i32) -> Vec<u64> {
        let half = values.len() / 2;
        let shift = steps.rem_euclid(half as i32) as usize;
        values
            .chunks_exact(half)
            .flat_map(|row| (0..half).map(move |i| row[(i + shift) % half]))
            .collect()
    }

    #[test]
    fn bfv_arithmetic() {
        let h = harness(bfv_context(1024, &[50, 50, 50], 20));
        let encoder = BatchEncoder::new(&h.context).unwrap();
        let t = *h.context.parameters().plain_modulus();
        let relin_keys = h.keygen.create_relin_keys().unwrap();

        let a = slots(1024, t.value(), 1);
        let b = slots(1024, t.value(), 2);
        let plain_a = encoder.encode_u64(&a).unwrap();
        let plain_b = encoder.encode_u64(&b).unwrap();
        let ct_a = h.encryptor.encrypt(&plain_a).unwrap();
        let ct_b = h.encryptor.encrypt(&plain_b).unwrap();
        let decode = |ct: &Ciphertext| encoder.decode_u64(&h.decryptor.decrypt(ct).unwrap()).unwrap();
        let expect = |f: &dyn Fn(u64, u64) -> u64| -> Vec<u64> {
            a.iter().zip(&b).map(|(&x, &y)| f(x, y)).collect()
        };

        assert_eq!(decode(&h.evaluator.add(&ct_a, &ct_b).unwrap()), expect(&|x, y| t.add(x, y)));
        assert_eq!(decode(&h.evaluator.sub(&ct_a, &ct_b).unwrap()), expect(&|x, y| t.sub(x, y)));
        assert_eq!(decode(&h.evaluator.negate(&ct_a).unwrap()), expect(&|x, _| t.neg(x)));
        assert_eq!(
            decode(&h.evaluator.add_plain(&ct_a, &plain_b).unwrap()),
            expect(&|x, y| t.add(x, y))
        );
        assert_eq!(
            decode(&h.evaluator.sub_plain(&ct_a, &plain_b).unwrap()),
            expect(&|x, y| t.sub(x, y))
        );
        assert_eq!(
            decode(&h.evaluator.multiply_plain(&ct_a, &plain_b).unwrap()),
            expect(&|x, y| t.mul(x, y))
        );

        let product = h.evaluator.multiply(&ct_a, &ct_b).unwrap();
        assert_eq!(product.size(), 3);
        assert_eq!(decode(&product), expect(&|x, y| t.mul(x, y)));
        let relinearized = h.evaluator.relinearize(&product, &relin_keys).unwrap();
        assert_eq!(relinearized.size(), 2);
        assert_eq!(decode(&relinearized), expect(&|x, y| t.mul(x, y)));

        let fresh_budget = h.decryptor.invariant_noise_budget(&ct_a).unwrap();
        let product_budget = h.decryptor.invariant_noise_budget(&relinearized).unwrap();
        assert!(product_budget > 0 && product_budget < fresh_budget);

        let sum = h.evaluator.add_many(&[ct_a.clone(), ct_b.clone(), ct_a.clone()]).unwrap();
        assert_eq!(decode(&sum), expect(&|x, y| t.add(t.add(x, y), x)));
    }

    #[test]
    fn bfv_ntt_form_plain_multiplication() {
        let h = harness(bfv_context(1024, &[50, 50, 50], 20));
        let encoder = BatchEncoder::new(&h.context).unwrap();
        let t = *h.context.parameters().plain_modulus();
        let a = slots(1024, t.value(), 3);
        let b = slots(1024, t.value(), 4);
        let ct = h.encryptor.encrypt(&encoder.encode_u64(&a).unwrap()).unwrap();

        let mut ct_ntt = h.evaluator.transform_to_ntt(&ct).unwrap();
        assert!(ct_ntt.is_ntt_form());
        assert!(h.evaluator.transform_to_ntt_inplace(&mut ct_ntt).is_err());
        let plain_ntt = h
            .evaluator
            .transform_plain_to_ntt(&encoder.encode_u64(&b).unwrap(), &ct.parms_id())
            .unwrap();
        assert!(plain_ntt.is_ntt_form());
        h.evaluator.multiply_plain_inplace(&mut ct_ntt, &plain_ntt).unwrap();
        // Decryption expects BFV ciphertexts in coefficient form.
        assert!(h.decryptor.decrypt(&ct_ntt).is_err());
        let product = h.evaluator.transform_from_ntt(&ct_ntt).unwrap();

        let expected: Vec<u64> = a.iter().zip(&b).map(|(&x, &y)| t.mul(x, y)).collect();
        let decoded = encoder.decode_u64(&h.decryptor.decrypt(&product).unwrap()).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn bfv_mod_switching_keeps_the_message() {
        let h = harness(bfv_context(1024, &[40, 40, 40, 40], 20));
        let encoder = BatchEncoder::new(&h.context).unwrap();
        let t = h.context.parameters().plain_modulus().value();
        let values = slots(1024, t, 5);
        let ct = h.encryptor.encrypt(&encoder.encode_u64(&values).unwrap()).unwrap();

        let switched = h.evaluator.mod_switch_to_next(&ct).unwrap();
        assert_eq!(switched.coeff_modulus_size(), 2);
        assert_eq!(
            encoder.decode_u64(&h.decryptor.decrypt(&switched).unwrap()).unwrap(),
            values
        );
        assert!(
            h.decryptor.invariant_noise_budget(&switched).unwrap()
                < h.decryptor.invariant_noise_budget(&ct).unwrap()
        );

        // Adding across levels switches the higher operand down.
        let sum = h.evaluator.add(&ct, &switched).unwrap();
        assert_eq!(sum.parms_id(), switched.parms_id());
        let doubled: Vec<u64> = values.iter().map(|&x| (2 * x) % t).collect();
        assert_eq!(encoder.decode_u64(&h.decryptor.decrypt(&sum).unwrap()).unwrap(), doubled);

        let last = h.evaluator.mod_switch_to(&ct, &h.context.last_parms_id()).unwrap();
        assert_eq!(last.coeff_modulus_size(), 1);
        assert!(matches!(
            h.evaluator.mod_switch_to_next(&last),
            Err(Error::EndOfModulusChain)
        ));
        assert!(matches!(
            h.evaluator.mod_switch_to(&last, &h.context.first_parms_id()),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn bfv_powers() {
        let h = harness(bfv_context(1024, &[60, 60, 60, 60], 20));
        let encoder = BatchEncoder::new(&h.context).unwrap();
        let t = *h.context.parameters().plain_modulus();
        let relin_keys = h.keygen.create_relin_keys().unwrap();
        let values = slots(1024, t.value(), 6);
        let ct = h.encryptor.encrypt(&encoder.encode_u64(&values).unwrap()).unwrap();

        let cubed = h.evaluator.exponentiate(&ct, 3, &relin_keys).unwrap();
        assert_eq!(cubed.size(), 2);
        let expected: Vec<u64> = values.iter().map(|&x| t.pow(x, 3)).collect();
        assert_eq!(encoder.decode_u64(&h.decryptor.decrypt(&cubed).unwrap()).unwrap(), expected);

        let sixth = h.evaluator.exponentiate(&ct, 6, &relin_keys).unwrap();
        assert_eq!(sixth.size(), 2);
        let expected: Vec<u64> = values.iter().map(|&x| t.pow(x, 6)).collect();
        assert_eq!(encoder.decode_u64(&h.decryptor.decrypt(&sixth).unwrap()).unwrap(), expected);
        let mut in_place = ct.clone();
        h.evaluator.exponentiate_inplace(&mut in_place, 6, &relin_keys).unwrap();
        assert_eq!(encoder.decode_u64(&h.decryptor.decrypt(&in_place).unwrap()).unwrap(), expected);

        let squared = h.evaluator.square(&ct).unwrap();
        let expected: Vec<u64> = values.iter().map(|&x| t.mul(x, x)).collect();
        assert_eq!(encoder.decode_u64(&h.decryptor.decrypt(&squared).unwrap()).unwrap(), expected);

        assert!(matches!(
            h.evaluator.exponentiate(&ct, 0, &relin_keys),
            Err(Error::InvalidOperand(_))
        ));
        assert!(matches!(
            h.evaluator.multiply_many(&[], &relin_keys),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn bgv_arithmetic_across_levels() {
        let h = harness(bgv_context(1024, &[50, 50, 50, 50], 20));
        let encoder = BatchEncoder::new(&h.context).unwrap();
        let t = *h.context.parameters().plain_modulus();
        let relin_keys = h.keygen.create_relin_keys().unwrap();
        let a = slots(1024, t.value(), 7);
        let b = slots(1024, t.value(), 8);
        let plain_b = encoder.encode_u64(&b).unwrap();
        let ct_a = h.encryptor.encrypt(&encoder.encode_u64(&a).unwrap()).unwrap();
        let ct_b = h.encryptor.encrypt(&plain_b).unwrap();
        let decode = |ct: &Ciphertext| encoder.decode_u64(&h.decryptor.decrypt(ct).unwrap()).unwrap();

        let mut product = h.evaluator.multiply(&ct_a, &ct_b).unwrap();
        h.evaluator.relinearize_inplace(&mut product, &relin_keys).unwrap();
        let expected: Vec<u64> = a.iter().zip(&b).map(|(&x, &y)| t.mul(x, y)).collect();
        assert_eq!(decode(&product), expected);

        h.evaluator.mod_switch_to_next_inplace(&mut product).unwrap();
        assert_ne!(product.correction_factor(), 1);
        assert_eq!(decode(&product), expected);

        // The fresh operand is switched down and the correction factors are
        // balanced before adding.
        let sum = h.evaluator.add(&product, &ct_b).unwrap();
        let expected_sum: Vec<u64> = expected.iter().zip(&b).map(|(&x, &y)| t.add(x, y)).collect();
        assert_eq!(decode(&sum), expected_sum);

        let shifted = h.evaluator.add_plain(&product, &plain_b).unwrap();
        assert_eq!(decode(&shifted), expected_sum);
        // Squaring gives a different correction factor, so this sum needs
        // balancing.
        let squared = h.evaluator.square(&product).unwrap();
        assert_ne!(squared.correction_factor(), product.correction_factor());
        let mixed = h.evaluator.add(&squared, &product).unwrap();
        let expected_mixed: Vec<u64> = expected.iter().map(|&x| t.add(t.mul(x, x), x)).collect();
        assert_eq!(decode(&mixed), expected_mixed);

        let scaled = h.evaluator.multiply_plain(&product, &plain_b).unwrap();
        let expected_scaled: Vec<u64> = expected.iter().zip(&b).map(|(&x, &y)| t.mul(x, y)).collect();
        assert_eq!(decode(&scaled), expected_scaled);
    }

    #[test]
    fn batched_rotations() {
        for context in [bfv_context(1024, &[50, 50, 50], 20), bgv_context(1024, &[50, 50, 50], 20)] {
            let h = harness(context);
            let encoder = BatchEncoder::new(&h.context).unwrap();
            let t = h.context.parameters().plain_modulus().value();
            let galois_keys = h.keygen.create_galois_keys().unwrap();
            let values = slots(1024, t, 9);
            let ct = h.encryptor.encrypt(&encoder.encode_u64(&values).unwrap()).unwrap();
            let decode = |ct: &Ciphertext| encoder.decode_u64(&h.decryptor.decrypt(ct).unwrap()).unwrap();

            for steps in [1, -1, 3, -3, 100] {
                let rotated = h.evaluator.rotate_rows(&ct, steps, &galois_keys).unwrap();
                assert_eq!(decode(&rotated), rotate_rows_expected(&values, steps), "steps {}", steps);
            }

            let swapped = h.evaluator.rotate_columns(&ct, &galois_keys).unwrap();
            let mut expected = values[512..].to_vec();
            expected.extend_from_slice(&values[..512]);
            assert_eq!(decode(&swapped), expected);

            assert!(matches!(
                h.evaluator.rotate_rows(&ct, 512, &galois_keys),
                Err(Error::InvalidOperand(_))
            ));
            assert!(matches!(
                h.evaluator.rotate_vector(&ct, 1, &galois_keys),
                Err(Error::InvalidOperand(_))
            ));
        }
    }

    #[test]
    fn missing_galois_keys() {
        let h = harness(bfv_context(1024, &[50, 50, 50], 20));
        let galois_keys = h.keygen.create_galois_keys_from_steps(&[1]).unwrap();
        let ct = h.encryptor.encrypt_zero().unwrap();
        assert!(h.evaluator.rotate_rows(&ct, 1, &galois_keys).is_ok());
        let elt = galois_elt_from_step(3, 1024).unwrap();
        assert!(matches!(
            h.evaluator.rotate_rows(&ct, 3, &galois_keys),
            Err(Error::MissingGaloisKey(e)) if e == elt
        ));
        assert!(matches!(
            h.evaluator.rotate_columns(&ct, &galois_keys),
            Err(Error::MissingGaloisKey(2047))
        ));
        assert!(matches!(
            h.evaluator.apply_galois(&ct, 4, &galois_keys),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn ckks_multiply_rescale_rotate() {
        let h = harness(ckks_context(1024, &[60, 40, 40, 60]));
        let encoder = CkksEncoder::new(&h.context).unwrap();
        let relin_keys = h.keygen.create_relin_keys().unwrap();
        let galois_keys = h.keygen.create_galois_keys().unwrap();
        let scale = 2f64.powi(40);
        let first = h.context.first_parms_id();
        let count = encoder.slot_count();
        let x: Vec<f64> = (0..count).map(|i| (i as f64 / count as f64) - 0.5).collect();
        let y: Vec<f64> = (0..count).map(|i| ((i * 7) % 13) as f64 / 13.0).collect();
        let ct_x = h.encryptor.encrypt(&encoder.encode_f64(&x, &first, scale).unwrap()).unwrap();
        let ct_y = h.encryptor.encrypt(&encoder.encode_f64(&y, &first, scale).unwrap()).unwrap();
        let decode = |ct: &Ciphertext| encoder.decode_f64(&h.decryptor.decrypt(ct).unwrap()).unwrap();
        let close = |actual: &[f64], expected: &[f64]| {
            actual.iter().zip(expected).all(|(a, e)| (a - e).abs() < 1e-3)
        };

        let sum = h.evaluator.add(&ct_x, &ct_y).unwrap();
        let expected: Vec<f64> = x.iter().zip(&y).map(|(a, b)| a + b).collect();
        assert!(close(&decode(&sum), &expected));

        let mut product = h.evaluator.multiply(&ct_x, &ct_y).unwrap();
        assert!((product.scale() - scale * scale).abs() < 1.0);
        h.evaluator.relinearize_inplace(&mut product, &relin_keys).unwrap();
        h.evaluator.rescale_to_next_inplace(&mut product).unwrap();
        let data = h.context.first_context_data().unwrap();
        let q_last = data.coeff_modulus()[2].value() as f64;
        assert_eq!(product.coeff_modulus_size(), 2);
        assert!((product.scale() - scale * scale / q_last).abs() / product.scale() < 1e-12);
        let expected: Vec<f64> = x.iter().zip(&y).map(|(a, b)| a * b).collect();
        assert!(close(&decode(&product), &expected));

        let rotated = h.evaluator.rotate_vector(&ct_x, 5, &galois_keys).unwrap();
        let expected: Vec<f64> = (0..count).map(|i| x[(i + 5) % count]).collect();
        assert!(close(&decode(&rotated), &expected));
        let rotated = h.evaluator.rotate_vector(&ct_x, -7, &galois_keys).unwrap();
        let expected: Vec<f64> = (0..count).map(|i| x[(i + count - 7) % count]).collect();
        assert!(close(&decode(&rotated), &expected));

        let z: Vec<Complex64> = (0..count).map(|i| Complex64::new(x[i], y[i])).collect();
        let ct_z = h.encryptor.encrypt(&encoder.encode_complex(&z, &first, scale).unwrap()).unwrap();
        let conjugated = h.evaluator.complex_conjugate(&ct_z, &galois_keys).unwrap();
        let decoded = encoder.decode_complex(&h.decryptor.decrypt(&conjugated).unwrap()).unwrap();
        assert!(decoded.iter().zip(&z).all(|(a, e)| (a - e.conj()).norm() < 1e-3));

        assert!(matches!(
            h.evaluator.rotate_rows(&ct_x, 1, &galois_keys),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn ckks_levels_and_scales() {
        let h = harness(ckks_context(1024, &[60, 40, 40, 60]));
        let encoder = CkksEncoder::new(&h.context).unwrap();
        let first = h.context.first_parms_id();
        let values = vec![0.25, -1.5, 3.0];
        let plain = encoder.encode_f64(&values, &first, 2f64.powi(40)).unwrap();
        let ct = h.encryptor.encrypt(&plain).unwrap();

        // Dropping a modulus keeps both the value and the scale.
        let switched = h.evaluator.mod_switch_to_next(&ct).unwrap();
        assert_eq!(switched.scale(), ct.scale());
        let switched_plain = h.evaluator.mod_switch_to_next_plain(&plain).unwrap();
        assert_eq!(switched_plain.parms_id(), switched.parms_id());
        let sum = h.evaluator.add_plain(&switched, &switched_plain).unwrap();
        let decoded = encoder.decode_f64(&h.decryptor.decrypt(&sum).unwrap()).unwrap();
        for (a, e) in decoded.iter().zip(&values) {
            assert!((a - 2.0 * e).abs() < 1e-3);
        }
        assert!(matches!(
            h.evaluator.add_plain(&ct, &switched_plain),
            Err(Error::InvalidOperand(_))
        ));

        let other_scale = h
            .encryptor
            .encrypt(&encoder.encode_f64(&values, &first, 2f64.powi(30)).unwrap())
            .unwrap();
        assert!(matches!(h.evaluator.add(&ct, &other_scale), Err(Error::LevelMismatch)));
        assert!(matches!(h.evaluator.sub(&other_scale, &ct), Err(Error::LevelMismatch)));
        let mut in_place = ct.clone();
        assert!(matches!(
            h.evaluator.add_inplace(&mut in_place, &other_scale),
            Err(Error::LevelMismatch)
        ));
        let other_scale_plain = encoder.encode_f64(&values, &first, 2f64.powi(30)).unwrap();
        assert!(matches!(
            h.evaluator.add_plain(&ct, &other_scale_plain),
            Err(Error::LevelMismatch)
        ));
        assert!(matches!(
            h.evaluator.multiply(&ct, &switched),
            Err(Error::LevelMismatch)
        ));
        assert!(matches!(
            h.evaluator.rescale_to_next(&other_scale),
            Err(Error::ScaleMismatch)
        ));
        let last = h.evaluator.mod_switch_to(&ct, &h.context.last_parms_id()).unwrap();
        assert!(matches!(
            h.evaluator.rescale_to_next(&last),
            Err(Error::EndOfModulusChain)
        ));
        assert!(matches!(
            h.evaluator.exponentiate(&ct, 2, &h.keygen.create_relin_keys().unwrap()),
            Err(Error::InvalidOperand(_))
        ));
    }

    #[test]
    fn transparent_results_are_rejected() {
        let h = harness(bfv_context(1024, &[50, 50, 50], 20));
        let ct = h.encryptor.encrypt_zero().unwrap();
        assert!(matches!(h.evaluator.sub(&ct, &ct), Err(Error::TransparentCiphertext)));
        assert!(matches!(
            h.evaluator.multiply_plain(&ct, &Plaintext::from_coeffs(vec![0])),
            Err(Error::TransparentCiphertext)
        ));
        assert!(matches!(h.evaluator.add_many(&[]), Err(Error::InvalidOperand(_))));
    }

    #[test]
    fn scratch_space_comes_from_the_pool() {
        let context = bfv_context(1024, &[50, 50, 50], 20);
        let pool = MemoryPool::new();
        let evaluator = Evaluator::with_memory_pool(&context, pool.clone()).unwrap();
        assert!(evaluator.memory_pool().ptr_eq(&pool));
        let keygen = KeyGenerator::new(&context).unwrap();
        let ct = Encryptor::new(&context)
            .unwrap()
            .with_secret_key(keygen.secret_key())
            .unwrap()
            .encrypt_zero_symmetric()
            .unwrap();
        evaluator.multiply(&ct, &ct).unwrap();
        assert!(pool.free_count() > 0);
    }

    #[test]
    fn correction_factors_balance() {
        let t = Modulus::new(65537).unwrap();
        for (f1, f2) in [(1, 2), (3, 65536), (12345, 777), (40000, 40000)] {
            let (e1, e2, f) = balance_correction_factors(f1, f2, &t).unwrap();
            assert_eq!(t.mul(e1, f1), f);
            assert_eq!(t.mul(e2, f2), f);
            let ratio = t.mul(t.inverse(f1).unwrap(), f2);
            let cost = t.center(e1).unsigned_abs() + t.center(e2).unsigned_abs();
            assert!(cost <= t.center(ratio).unsigned_abs() + 1);
        }
        assert!(balance_correction_factors(0, 5, &t).is_err());
    }

    #[test]
    fn non_adjacent_form() {
        for value in [1, -1, 3, -3, 7, 12, 255, -100, 511] {
            let terms = naf(value);
            assert_eq!(terms.iter().sum::<i32>(), value);
            assert!(terms.iter().all(|term| term.unsigned_abs().is_power_of_two()));
            for pair in terms.windows(2) {
                assert!(pair[1].unsigned_abs() >= 4 * pair[0].unsigned_abs());
            }
        }
        assert_eq!(naf(7), vec![-1, 8]);
    }

    #[test]
    fn bfv_square_at_production_size() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut parms = EncryptionParameters::new(SchemeType::Bfv);
        parms.set_poly_modulus_degree(8192);
        parms.set_coeff_modulus(&CoeffModulus::bfv_default(8192, SecurityLevel::Tc128).unwrap());
        parms.set_plain_modulus(PlainModulus::batching(8192, 20).unwrap());
        let h = harness(Context::new(&parms, true, SecurityLevel::Tc128));
        assert!(h.context.parameters_set());
        let encoder = BatchEncoder::new(&h.context).unwrap();
        let t = *h.context.parameters().plain_modulus();
        let relin_keys = h.keygen.create_relin_keys().unwrap();

        let values: Vec<u64> = (1..=8192).collect();
        let ct = h.encryptor.encrypt(&encoder.encode_u64(&values).unwrap()).unwrap();
        let mut squared = h.evaluator.square(&ct).unwrap();
        h.evaluator.relinearize_inplace(&mut squared, &relin_keys).unwrap();
        let expected: Vec<u64> = values.iter().map(|&x| t.mul(x, x)).collect();
        assert_eq!(encoder.decode_u64(&h.decryptor.decrypt(&squared).unwrap()).unwrap(), expected);
        assert!(h.decryptor.invariant_noise_budget(&squared).unwrap() > 0);
    }
}
