//! Seedable uniform random generators used for all key and encryption sampling.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use blake2::Blake2b512;
use crypto_bigint::rand_core::{CryptoRng, Error as RandError, RngCore, SeedableRng};
use rand::rngs::OsRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha3::{
    digest::{ExtendableOutput, FixedOutput, Update, XofReader},
    Shake256, Shake256Reader,
};

pub const PRNG_SEED_BYTES: usize = 32;

pub type PrngSeed = [u8; PRNG_SEED_BYTES];

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum PrngType {
    #[default]
    ChaCha20,
    /// 64-byte BLAKE2b blocks of `seed || counter` for consecutive
    /// little-endian counters.
    Blake2xb,
    /// The SHAKE256 output stream absorbed from the seed.
    Shake256,
}

/// Everything needed to recreate a generator's output stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrngInfo {
    prng_type: PrngType,
    seed: PrngSeed,
}

impl PrngInfo {
    pub fn new(prng_type: PrngType, seed: PrngSeed) -> Self {
        Self { prng_type, seed }
    }

    pub fn prng_type(&self) -> PrngType {
        self.prng_type
    }

    pub fn seed(&self) -> &PrngSeed {
        &self.seed
    }
}

enum PrngState {
    ChaCha20(Box<ChaCha20Rng>),
    Blake2xb {
        counter: u64,
        block: [u8; BLAKE2B_BLOCK_BYTES],
        offset: usize,
    },
    Shake256(Box<Shake256Reader>),
}

const BLAKE2B_BLOCK_BYTES: usize = 64;

impl PrngState {
    fn new(info: &PrngInfo) -> Self {
        match info.prng_type {
            PrngType::ChaCha20 => Self::ChaCha20(Box::new(ChaCha20Rng::from_seed(info.seed))),
            PrngType::Blake2xb => Self::Blake2xb {
                counter: 0,
                block: [0; BLAKE2B_BLOCK_BYTES],
                offset: BLAKE2B_BLOCK_BYTES,
            },
            PrngType::Shake256 => {
                let mut xof = Shake256::default();
                xof.update(&info.seed);
                Self::Shake256(Box::new(xof.finalize_xof()))
            }
        }
    }
}

/// A deterministic byte stream determined by its [`PrngInfo`].  Instances are
/// not shared between threads; every encryption or key generation creates its
/// own.
pub struct UniformRandomGenerator {
    info: PrngInfo,
    state: PrngState,
}

impl UniformRandomGenerator {
    pub fn new(info: PrngInfo) -> Self {
        let state = PrngState::new(&info);
        Self { info, state }
    }

    pub fn from_entropy(prng_type: PrngType) -> Self {
        let mut seed = PrngSeed::default();
        OsRng.fill_bytes(&mut seed);
        Self::new(PrngInfo::new(prng_type, seed))
    }

    pub fn info(&self) -> &PrngInfo {
        &self.info
    }

    pub fn generate(&mut self, out: &mut [u8]) {
        match &mut self.state {
            PrngState::ChaCha20(rng) => rng.fill_bytes(out),
            PrngState::Blake2xb {
                counter,
                block,
                offset,
            } => {
                for byte in out.iter_mut() {
                    if *offset == block.len() {
                        *block = blake2b_block(&self.info.seed, *counter);
                        *counter += 1;
                        *offset = 0;
                    }
                    *byte = block[*offset];
                    *offset += 1;
                }
            }
            PrngState::Shake256(reader) => reader.read(out),
        }
    }

    /// Replaces the seed with fresh OS entropy and restarts the stream.
    pub fn reseed(&mut self) {
        OsRng.fill_bytes(&mut self.info.seed);
        self.state = PrngState::new(&self.info);
    }
}

fn blake2b_block(seed: &PrngSeed, counter: u64) -> [u8; BLAKE2B_BLOCK_BYTES] {
    let mut hasher = Blake2b512::default();
    hasher.update(seed);
    hasher.update(&counter.to_le_bytes());
    let mut block = [0; BLAKE2B_BLOCK_BYTES];
    block.copy_from_slice(&hasher.finalize_fixed());
    block
}

impl RngCore for UniformRandomGenerator {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        self.generate(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.generate(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.generate(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), RandError> {
        self.generate(dest);
        Ok(())
    }
}

impl CryptoRng for UniformRandomGenerator {}

/// Creates a fresh generator for every call.  A seeded factory derives the
/// seeds of its generators from one master stream, so runs are reproducible
/// while no two generators share a seed.
pub struct RandomGeneratorFactory {
    prng_type: PrngType,
    seeder: Option<Mutex<ChaCha20Rng>>,
}

static DEFAULT_FACTORY: OnceLock<RwLock<Arc<RandomGeneratorFactory>>> = OnceLock::new();

impl RandomGeneratorFactory {
    pub fn new(prng_type: PrngType) -> Self {
        Self {
            prng_type,
            seeder: None,
        }
    }

    pub fn with_seed(prng_type: PrngType, seed: PrngSeed) -> Self {
        Self {
            prng_type,
            seeder: Some(Mutex::new(ChaCha20Rng::from_seed(seed))),
        }
    }

    pub fn prng_type(&self) -> PrngType {
        self.prng_type
    }

    pub fn use_random_seed(&self) -> bool {
        self.seeder.is_none()
    }

    pub fn create(&self) -> UniformRandomGenerator {
        match &self.seeder {
            None => UniformRandomGenerator::from_entropy(self.prng_type),
            Some(seeder) => {
                let mut seed = PrngSeed::default();
                seeder
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .fill_bytes(&mut seed);
                UniformRandomGenerator::new(PrngInfo::new(self.prng_type, seed))
            }
        }
    }

    fn default_slot() -> &'static RwLock<Arc<RandomGeneratorFactory>> {
        DEFAULT_FACTORY
            .get_or_init(|| RwLock::new(Arc::new(RandomGeneratorFactory::new(PrngType::default()))))
    }

    /// The process-wide factory used by objects whose parameters carry none.
    pub fn default_factory() -> Arc<RandomGeneratorFactory> {
        Self::default_slot()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the process-wide factory.  Objects created earlier keep the
    /// factory they captured.
    pub fn set_default_factory(factory: Arc<RandomGeneratorFactory>) {
        *Self::default_slot()
            .write()
            .unwrap_or_else(PoisonError::into_inner) = factory;
    }
}

impl Default for RandomGeneratorFactory {
    fn default() -> Self {
        Self::new(PrngType::default())
    }
}

impl std::fmt::Debug for RandomGeneratorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomGeneratorFactory")
            .field("prng_type", &self.prng_type)
            .field("use_random_seed", &self.use_random_seed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_info_same_stream() {
        for prng_type in [PrngType::ChaCha20, PrngType::Blake2xb, PrngType::Shake256] {
            let mut rng = UniformRandomGenerator::from_entropy(prng_type);
            let mut replay = UniformRandomGenerator::new(rng.info().clone());
            let mut a = [0u8; 100];
            let mut b = [0u8; 100];
            rng.generate(&mut a[..37]);
            rng.generate(&mut a[37..]);
            replay.generate(&mut b);
            assert_eq!(a, b);

            rng.reseed();
            assert_ne!(rng.info(), replay.info());
        }
    }

    #[test]
    fn fixed_seed_fixes_the_stream() {
        let seed = [7u8; PRNG_SEED_BYTES];
        let mut other_seed = seed;
        other_seed[0] ^= 1;
        for prng_type in [PrngType::ChaCha20, PrngType::Blake2xb, PrngType::Shake256] {
            let stream = |seed: PrngSeed| {
                let mut rng = UniformRandomGenerator::new(PrngInfo::new(prng_type, seed));
                let mut out = [0u8; 200];
                rng.generate(&mut out);
                out
            };
            let first = stream(seed);
            assert_eq!(first, stream(seed));
            assert_ne!(first, stream(other_seed));
            assert!(first.iter().any(|&b| b != 0));
        }
    }

    #[test]
    fn blake2xb_blocks_follow_the_counter() {
        let seed = [7u8; PRNG_SEED_BYTES];
        let mut rng = UniformRandomGenerator::new(PrngInfo::new(PrngType::Blake2xb, seed));
        let mut out = [0u8; 2 * BLAKE2B_BLOCK_BYTES];
        rng.generate(&mut out);
        assert_eq!(out[..BLAKE2B_BLOCK_BYTES], blake2b_block(&seed, 0));
        assert_eq!(out[BLAKE2B_BLOCK_BYTES..], blake2b_block(&seed, 1));
    }

    #[test]
    fn shake256_matches_one_shot_output() {
        let seed = [3u8; PRNG_SEED_BYTES];
        let mut rng = UniformRandomGenerator::new(PrngInfo::new(PrngType::Shake256, seed));
        let mut streamed = [0u8; 300];
        rng.generate(&mut streamed[..1]);
        rng.generate(&mut streamed[1..]);

        let mut xof = Shake256::default();
        xof.update(&seed);
        let mut one_shot = [0u8; 300];
        xof.finalize_xof().read(&mut one_shot);
        assert_eq!(streamed, one_shot);
    }

    #[test]
    fn seeded_factory_is_reproducible_but_fresh() {
        let seed = [1u8; PRNG_SEED_BYTES];
        let a = RandomGeneratorFactory::with_seed(PrngType::ChaCha20, seed);
        let b = RandomGeneratorFactory::with_seed(PrngType::ChaCha20, seed);
        let first = a.create();
        assert_eq!(first.info(), b.create().info());
        assert_ne!(first.info(), a.create().info());
        assert!(!a.use_random_seed());
    }
}
