use std::{collections::HashMap, fmt, sync::Arc};

use log::{debug, warn};
use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::{
    error::{Error, ParameterError},
    params::{EncryptionParameters, ParmsId, SchemeType, SecurityLevel},
    ring::{
        prime::{
            get_primes, COEFF_MOD_COUNT_MAX, PLAIN_MOD_BIT_COUNT_MAX, PLAIN_MOD_BIT_COUNT_MIN,
            POLY_MOD_DEGREE_MAX, POLY_MOD_DEGREE_MIN, USER_MOD_BIT_COUNT_MAX,
            USER_MOD_BIT_COUNT_MIN,
        },
        CoeffModulus, Modulus, NttTables, RnsBase,
    },
};

/// Facts about a validated parameter set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionParameterQualifiers {
    pub parameter_error: Option<ParameterError>,
    pub using_fft: bool,
    pub using_ntt: bool,
    pub using_batching: bool,
    pub using_fast_plain_lift: bool,
    pub using_descending_modulus_chain: bool,
    pub sec_level: SecurityLevel,
}

impl EncryptionParameterQualifiers {
    fn new(sec_level: SecurityLevel) -> Self {
        Self {
            parameter_error: None,
            using_fft: false,
            using_ntt: false,
            using_batching: false,
            using_fast_plain_lift: false,
            using_descending_modulus_chain: false,
            sec_level,
        }
    }

    pub fn parameters_set(&self) -> bool {
        self.parameter_error.is_none()
    }
}

/// Auxiliary base used to compute BFV tensor products exactly.
#[derive(Debug)]
pub struct MultiplyBase {
    /// The level's moduli followed by the auxiliary primes.
    pub base: RnsBase,
    pub ntt_tables: Vec<NttTables>,
}

/// Precomputed data for one level of the modulus chain.
pub struct ContextData {
    parms: EncryptionParameters,
    parms_id: ParmsId,
    qualifiers: EncryptionParameterQualifiers,
    chain_index: usize,
    prev_parms_id: Option<ParmsId>,
    next_parms_id: Option<ParmsId>,
    total_coeff_modulus_bit_count: u32,
    ntt_tables: Vec<NttTables>,
    rns_base: RnsBase,
    plain_ntt_tables: Option<NttTables>,
    coeff_div_plain_modulus: Vec<u64>,
    coeff_mod_plain_modulus: u64,
    plain_upper_half_threshold: u64,
    plain_upper_half_increment: Vec<u64>,
    multiply_base: Option<MultiplyBase>,
    // This level's moduli followed by the special prime.
    key_switch_base: Option<RnsBase>,
}

impl ContextData {
    pub fn parms(&self) -> &EncryptionParameters {
        &self.parms
    }

    pub fn parms_id(&self) -> ParmsId {
        self.parms_id
    }

    pub fn scheme(&self) -> SchemeType {
        self.parms.scheme()
    }

    pub fn qualifiers(&self) -> &EncryptionParameterQualifiers {
        &self.qualifiers
    }

    /// Position in the chain; the last level has index 0.
    pub fn chain_index(&self) -> usize {
        self.chain_index
    }

    pub fn prev_parms_id(&self) -> Option<ParmsId> {
        self.prev_parms_id
    }

    pub fn next_parms_id(&self) -> Option<ParmsId> {
        self.next_parms_id
    }

    pub fn total_coeff_modulus_bit_count(&self) -> u32 {
        self.total_coeff_modulus_bit_count
    }

    pub fn poly_modulus_degree(&self) -> usize {
        self.parms.poly_modulus_degree()
    }

    pub fn coeff_count_power(&self) -> u32 {
        self.parms.poly_modulus_degree().trailing_zeros()
    }

    pub fn coeff_modulus(&self) -> &[Modulus] {
        self.parms.coeff_modulus()
    }

    pub fn coeff_modulus_size(&self) -> usize {
        self.parms.coeff_modulus().len()
    }

    pub fn plain_modulus(&self) -> &Modulus {
        self.parms.plain_modulus()
    }

    pub fn ntt_tables(&self) -> &[NttTables] {
        &self.ntt_tables
    }

    pub fn rns_base(&self) -> &RnsBase {
        &self.rns_base
    }

    pub fn plain_ntt_tables(&self) -> Option<&NttTables> {
        self.plain_ntt_tables.as_ref()
    }

    /// `floor(Q / t) mod q_i`
    pub fn coeff_div_plain_modulus(&self) -> &[u64] {
        &self.coeff_div_plain_modulus
    }

    /// `Q mod t`
    pub fn coeff_mod_plain_modulus(&self) -> u64 {
        self.coeff_mod_plain_modulus
    }

    /// Plaintext coefficients at or above this value represent negative numbers.
    pub fn plain_upper_half_threshold(&self) -> u64 {
        self.plain_upper_half_threshold
    }

    /// `(q_i - t) mod q_i`, added to lift an upper-half plaintext coefficient.
    pub fn plain_upper_half_increment(&self) -> &[u64] {
        &self.plain_upper_half_increment
    }

    /// Base in which key switching accumulates before the special prime is
    /// divided out.  Present on every level below the key level.
    pub(crate) fn key_switch_base(&self) -> Option<&RnsBase> {
        self.key_switch_base.as_ref()
    }

    pub fn multiply_base(&self) -> Option<&MultiplyBase> {
        self.multiply_base.as_ref()
    }
}

impl fmt::Debug for ContextData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextData")
            .field("parms_id", &self.parms_id)
            .field("chain_index", &self.chain_index)
            .field("coeff_modulus", &self.parms.coeff_modulus())
            .finish()
    }
}

fn validate(
    parms: &EncryptionParameters,
    sec_level: SecurityLevel,
    qualifiers: &mut EncryptionParameterQualifiers,
) -> Result<(), ParameterError> {
    let scheme = parms.scheme();
    if scheme == SchemeType::None {
        return Err(ParameterError::InvalidScheme);
    }

    let coeff_modulus = parms.coeff_modulus();
    if coeff_modulus.is_empty() || coeff_modulus.len() > COEFF_MOD_COUNT_MAX {
        return Err(ParameterError::InvalidCoeffModulusSize);
    }
    if coeff_modulus
        .iter()
        .any(|q| !(USER_MOD_BIT_COUNT_MIN..=USER_MOD_BIT_COUNT_MAX).contains(&q.bit_count()))
    {
        return Err(ParameterError::InvalidCoeffModulusBitCount);
    }

    let n = parms.poly_modulus_degree();
    if !(POLY_MOD_DEGREE_MIN..=POLY_MOD_DEGREE_MAX).contains(&n) {
        return Err(ParameterError::InvalidPolyModulusDegree);
    }
    if !n.is_power_of_two() {
        return Err(ParameterError::InvalidPolyModulusDegreeNonPowerOfTwo);
    }
    if n.checked_mul(coeff_modulus.len()).is_none() {
        return Err(ParameterError::InvalidParametersTooLarge);
    }

    qualifiers.using_fft = true;
    if coeff_modulus
        .iter()
        .any(|q| !q.is_prime() || q.value() % (2 * n as u64) != 1)
    {
        return Err(ParameterError::InvalidCoeffModulusNoNtt);
    }
    qualifiers.using_ntt = true;
    qualifiers.using_descending_modulus_chain = coeff_modulus.windows(2).all(|w| w[0] > w[1]);

    if sec_level != SecurityLevel::None {
        let total: u32 = coeff_modulus.iter().map(Modulus::bit_count).sum();
        if total > CoeffModulus::max_bit_count(n, sec_level) {
            return Err(ParameterError::InvalidParametersInsecure);
        }
    }

    let t = parms.plain_modulus();
    match scheme {
        SchemeType::Bfv | SchemeType::Bgv => {
            if !(PLAIN_MOD_BIT_COUNT_MIN..=PLAIN_MOD_BIT_COUNT_MAX).contains(&t.bit_count()) {
                return Err(ParameterError::InvalidPlainModulusBitCount);
            }
            for q in coeff_modulus {
                if num_integer::gcd(q.value(), t.value()) != 1 {
                    return Err(ParameterError::InvalidPlainModulusCoprimality);
                }
            }
            if coeff_modulus.iter().any(|q| t.value() >= q.value()) {
                return Err(ParameterError::InvalidPlainModulusTooLarge);
            }
            qualifiers.using_batching = t.is_prime() && t.value() % (2 * n as u64) == 1;
            qualifiers.using_fast_plain_lift = true;
        }
        SchemeType::Ckks => {
            if !t.is_zero() {
                return Err(ParameterError::InvalidPlainModulusNonzero);
            }
        }
        SchemeType::None => return Err(ParameterError::InvalidScheme),
    }
    Ok(())
}

fn parameter_error(err: Error) -> ParameterError {
    match err {
        Error::InvalidParameter(code) => code,
        _ => ParameterError::FailedCreatingRnsTool,
    }
}

fn create_multiply_base(
    parms: &EncryptionParameters,
    rns_base: &RnsBase,
    exclude: &[u64],
) -> Result<MultiplyBase, ParameterError> {
    let n = parms.poly_modulus_degree();
    let required_bits = rns_base.product_bit_count() + n.trailing_zeros() + 8;
    let count = (required_bits as usize + 58) / 59;
    let aux = get_primes(2 * n as u64, 60, count, exclude)
        .map_err(|_| ParameterError::FailedCreatingRnsTool)?;

    let mut moduli = parms.coeff_modulus().to_vec();
    moduli.extend(aux);
    let base = RnsBase::new(&moduli).map_err(|_| ParameterError::FailedCreatingRnsTool)?;
    let ntt_tables = moduli
        .iter()
        .map(|q| NttTables::new(n.trailing_zeros(), q))
        .collect::<Result<_, _>>()
        .map_err(|_| ParameterError::FailedCreatingRnsTool)?;
    Ok(MultiplyBase { base, ntt_tables })
}

fn create_context_data(
    parms: EncryptionParameters,
    sec_level: SecurityLevel,
    key_moduli: &[u64],
) -> Result<ContextData, ParameterError> {
    let mut qualifiers = EncryptionParameterQualifiers::new(sec_level);
    validate(&parms, sec_level, &mut qualifiers)?;

    let coeff_modulus = parms.coeff_modulus();
    let rns_base = RnsBase::new(coeff_modulus).map_err(parameter_error)?;
    let power = parms.poly_modulus_degree().trailing_zeros();
    let ntt_tables = coeff_modulus
        .iter()
        .map(|q| NttTables::new(power, q))
        .collect::<Result<Vec<_>, _>>()
        .map_err(parameter_error)?;

    let t = *parms.plain_modulus();
    let mut coeff_div_plain_modulus = Vec::new();
    let mut coeff_mod_plain_modulus = 0;
    let mut plain_upper_half_increment = Vec::new();
    let mut plain_ntt_tables = None;
    let mut multiply_base = None;
    if !t.is_zero() {
        let product = rns_base.product();
        let quotient = product / t.value();
        coeff_div_plain_modulus = coeff_modulus
            .iter()
            .map(|q| (&quotient % q.value()).to_u64().unwrap_or_default())
            .collect();
        coeff_mod_plain_modulus = (product % t.value()).to_u64().unwrap_or_default();
        plain_upper_half_increment = coeff_modulus
            .iter()
            .map(|q| q.neg(q.reduce(t.value())))
            .collect();
        if qualifiers.using_batching {
            plain_ntt_tables = Some(NttTables::new(power, &t).map_err(parameter_error)?);
        }
        if parms.scheme() == SchemeType::Bfv {
            multiply_base = Some(create_multiply_base(&parms, &rns_base, key_moduli)?);
        }
    }

    Ok(ContextData {
        parms_id: parms.parms_id(),
        qualifiers,
        chain_index: 0,
        prev_parms_id: None,
        next_parms_id: None,
        total_coeff_modulus_bit_count: BigUint::bits(rns_base.product()) as u32,
        ntt_tables,
        rns_base,
        plain_ntt_tables,
        coeff_div_plain_modulus,
        coeff_mod_plain_modulus,
        plain_upper_half_threshold: (t.value() + 1) >> 1,
        plain_upper_half_increment,
        multiply_base,
        key_switch_base: None,
        parms,
    })
}

struct ContextInner {
    parms: EncryptionParameters,
    sec_level: SecurityLevel,
    parameter_error: Option<ParameterError>,
    context_data: HashMap<ParmsId, Arc<ContextData>>,
    key_parms_id: ParmsId,
    first_parms_id: ParmsId,
    last_parms_id: ParmsId,
}

/// A validated parameter set together with its modulus switching chain.
/// Cloning is cheap; all clones share the same chain.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Never fails.  Invalid parameters give a context whose
    /// [`parameter_error`](Self::parameter_error) names the problem.
    pub fn new(parms: &EncryptionParameters, expand_mod_chain: bool, sec_level: SecurityLevel) -> Self {
        if sec_level == SecurityLevel::None {
            warn!("creating a context without a security level");
        }
        let key_moduli: Vec<u64> = parms.coeff_modulus().iter().map(|q| q.value()).collect();

        let key_data = match create_context_data(parms.clone(), sec_level, &key_moduli) {
            Ok(data) => data,
            Err(err) => {
                debug!("parameters {} are invalid: {}", parms.parms_id(), err);
                return Self {
                    inner: Arc::new(ContextInner {
                        parms: parms.clone(),
                        sec_level,
                        parameter_error: Some(err),
                        context_data: HashMap::new(),
                        key_parms_id: parms.parms_id(),
                        first_parms_id: parms.parms_id(),
                        last_parms_id: parms.parms_id(),
                    }),
                };
            }
        };

        let mut levels = vec![key_data];
        let mut remaining = key_moduli.len();
        while remaining > 1 && (levels.len() < 2 || expand_mod_chain) {
            remaining -= 1;
            let mut next_parms = parms.clone();
            next_parms.set_coeff_modulus(&parms.coeff_modulus()[..remaining]);
            match create_context_data(next_parms, sec_level, &key_moduli) {
                Ok(data) => levels.push(data),
                Err(err) => {
                    debug!("modulus chain ends early: {}", err);
                    break;
                }
            }
        }

        let count = levels.len();
        let ids: Vec<ParmsId> = levels.iter().map(ContextData::parms_id).collect();
        let special_prime = parms.coeff_modulus()[key_moduli.len() - 1];
        for (i, data) in levels.iter_mut().enumerate() {
            data.chain_index = count - 1 - i;
            data.prev_parms_id = i.checked_sub(1).map(|j| ids[j]);
            data.next_parms_id = ids.get(i + 1).copied();
            if i > 0 {
                let mut moduli = data.parms.coeff_modulus().to_vec();
                moduli.push(special_prime);
                data.key_switch_base = RnsBase::new(&moduli).ok();
            }
        }
        let key_parms_id = ids[0];
        let first_parms_id = ids.get(1).copied().unwrap_or(key_parms_id);
        let last_parms_id = ids[count - 1];
        debug!(
            "created context with {} levels, key level {}, first level {}",
            count, key_parms_id, first_parms_id
        );

        Self {
            inner: Arc::new(ContextInner {
                parms: parms.clone(),
                sec_level,
                parameter_error: None,
                context_data: levels
                    .into_iter()
                    .map(|data| (data.parms_id, Arc::new(data)))
                    .collect(),
                key_parms_id,
                first_parms_id,
                last_parms_id,
            }),
        }
    }

    pub fn parameters(&self) -> &EncryptionParameters {
        &self.inner.parms
    }

    pub fn sec_level(&self) -> SecurityLevel {
        self.inner.sec_level
    }

    pub fn parameters_set(&self) -> bool {
        self.inner.parameter_error.is_none()
    }

    pub fn parameter_error(&self) -> Option<ParameterError> {
        self.inner.parameter_error
    }

    pub fn get_context_data(&self, parms_id: &ParmsId) -> Option<Arc<ContextData>> {
        self.inner.context_data.get(parms_id).cloned()
    }

    pub fn key_context_data(&self) -> Option<Arc<ContextData>> {
        self.get_context_data(&self.inner.key_parms_id)
    }

    pub fn first_context_data(&self) -> Option<Arc<ContextData>> {
        self.get_context_data(&self.inner.first_parms_id)
    }

    pub fn last_context_data(&self) -> Option<Arc<ContextData>> {
        self.get_context_data(&self.inner.last_parms_id)
    }

    pub fn key_parms_id(&self) -> ParmsId {
        self.inner.key_parms_id
    }

    pub fn first_parms_id(&self) -> ParmsId {
        self.inner.first_parms_id
    }

    pub fn last_parms_id(&self) -> ParmsId {
        self.inner.last_parms_id
    }

    /// Whether a special prime is reserved for key switching.
    pub fn using_keyswitching(&self) -> bool {
        self.parameters_set() && self.inner.key_parms_id != self.inner.first_parms_id
    }

    pub(crate) fn ensure_valid(&self) -> Result<(), Error> {
        match self.inner.parameter_error {
            Some(err) => Err(Error::InvalidParameter(err)),
            None => Ok(()),
        }
    }

    /// Lookup for operands; unknown ids mean the object belongs elsewhere.
    pub(crate) fn data(&self, parms_id: &ParmsId) -> Result<Arc<ContextData>, Error> {
        self.ensure_valid()?;
        self.get_context_data(parms_id)
            .ok_or(Error::InvalidOperand("parms_id is not valid for this context"))
    }

    pub(crate) fn key_data(&self) -> Result<Arc<ContextData>, Error> {
        self.data(&self.inner.key_parms_id)
    }

    pub(crate) fn first_data(&self) -> Result<Arc<ContextData>, Error> {
        self.data(&self.inner.first_parms_id)
    }

    pub(crate) fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("parms", &self.inner.parms)
            .field("parameter_error", &self.inner.parameter_error)
            .field("levels", &self.inner.context_data.len())
            .finish()
    }
}
