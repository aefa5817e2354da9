//! Leveled homomorphic encryption over `Z_Q[X]/(X^n + 1)` with the BFV, BGV
//! and CKKS schemes.
//!
//! A [`Context`] validates an [`EncryptionParameters`] set and precomputes the
//! modulus chain.  Keys come from a [`KeyGenerator`], messages are encoded with
//! a [`BatchEncoder`] or [`CkksEncoder`], and ciphertexts are produced by an
//! [`Encryptor`], transformed by an [`Evaluator`] and opened by a
//! [`Decryptor`].  Every object can be written with [`Persist::save`] and read
//! back against a context with [`Persist::load`].

pub mod batch_encoder;
pub mod ciphertext;
pub mod ckks_encoder;
pub mod context;
pub mod decryptor;
pub mod encryptor;
pub mod error;
pub mod evaluator;
pub mod keys;
pub mod memory;
pub mod params;
pub mod plaintext;
pub mod random;
pub mod ring;
pub mod sampling;
pub mod serialization;

pub use crate::{
    batch_encoder::BatchEncoder,
    ciphertext::Ciphertext,
    ckks_encoder::CkksEncoder,
    context::{Context, ContextData},
    decryptor::Decryptor,
    encryptor::Encryptor,
    error::{Error, Result},
    evaluator::Evaluator,
    keys::{GaloisKeys, KeyGenerator, PublicKey, RelinKeys, SecretKey},
    memory::MemoryPool,
    params::{EncryptionParameters, ParmsId, SchemeType, SecurityLevel},
    plaintext::Plaintext,
    ring::{CoeffModulus, Modulus, PlainModulus},
    serialization::{ComprMode, Persist, Serializable},
};
