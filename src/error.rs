use std::io;

/// Reason recorded by a [`Context`](crate::context::Context) when a parameter set
/// fails validation.
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, Hash, PartialEq)]
pub enum ParameterError {
    #[display(fmt = "scheme is not set or not supported")]
    InvalidScheme,
    #[display(fmt = "coefficient modulus has an invalid number of primes")]
    InvalidCoeffModulusSize,
    #[display(fmt = "a coefficient modulus prime has an invalid bit count")]
    InvalidCoeffModulusBitCount,
    #[display(fmt = "a coefficient modulus prime is not NTT-friendly")]
    InvalidCoeffModulusNoNtt,
    #[display(fmt = "polynomial modulus degree is out of range")]
    InvalidPolyModulusDegree,
    #[display(fmt = "polynomial modulus degree is not a power of two")]
    InvalidPolyModulusDegreeNonPowerOfTwo,
    #[display(fmt = "parameters are too large to fit in memory")]
    InvalidParametersTooLarge,
    #[display(fmt = "parameters do not meet the requested security level")]
    InvalidParametersInsecure,
    #[display(fmt = "coefficient moduli are not pairwise coprime")]
    FailedCreatingRnsBase,
    #[display(fmt = "plain modulus has an invalid bit count")]
    InvalidPlainModulusBitCount,
    #[display(fmt = "plain modulus is not coprime to the coefficient modulus")]
    InvalidPlainModulusCoprimality,
    #[display(fmt = "plain modulus is not smaller than every coefficient modulus prime")]
    InvalidPlainModulusTooLarge,
    #[display(fmt = "plain modulus must be zero for this scheme")]
    InvalidPlainModulusNonzero,
    #[display(fmt = "failed to precompute the auxiliary RNS base")]
    FailedCreatingRnsTool,
    #[display(fmt = "no prime with the requested size and congruence exists")]
    NoPrimeFound,
    #[display(fmt = "value is not a valid modulus")]
    InvalidModulus,
    #[display(fmt = "plain modulus does not support batching")]
    BatchingUnavailable,
}

/// Reason an encoder rejected its input.
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, PartialEq)]
pub enum EncodingError {
    #[display(fmt = "too many values for the available slots")]
    TooManyValues,
    #[display(fmt = "value does not fit the plain modulus")]
    ValueOutOfRange,
    #[display(fmt = "scale must be positive and smaller than the coefficient modulus")]
    InvalidScale,
    #[display(fmt = "encoded value is too large for the coefficient modulus")]
    Overflow,
}

/// Reason a serialized object was rejected.
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum LoadError {
    #[display(fmt = "invalid serialization header")]
    InvalidHeader,
    #[display(fmt = "unsupported serialization version {}.{}", _0, _1)]
    UnsupportedVersion(#[error(not(source))] u8, #[error(not(source))] u8),
    #[display(fmt = "unsupported compression mode {}", _0)]
    UnsupportedComprMode(#[error(not(source))] u8),
    #[display(fmt = "size in header does not match the stream")]
    SizeMismatch,
    Decompress(io::Error),
    #[display(fmt = "decompressed payload exceeds {} bytes", _0)]
    PayloadTooLarge(#[error(not(source))] u64),
    Payload(bincode::Error),
    #[display(fmt = "object belongs to a different parameter set")]
    ForeignParameters,
    #[display(fmt = "object data is not valid for the given context")]
    InvalidData,
}

/// Reason an object could not be written.
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum SaveError {
    Serialize(bincode::Error),
    Compress(io::Error),
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum Error {
    #[display(fmt = "invalid encryption parameters: {}", _0)]
    InvalidParameter(#[error(not(source))] ParameterError),
    #[display(fmt = "operands are at incompatible levels")]
    LevelMismatch,
    #[display(fmt = "operand scales do not match")]
    ScaleMismatch,
    #[display(fmt = "no Galois key for element {}", _0)]
    MissingGaloisKey(#[error(not(source))] u32),
    #[display(fmt = "key is not valid for this context")]
    InvalidKey,
    #[display(fmt = "encoding failed: {}", _0)]
    EncodingError(#[error(not(source))] EncodingError),
    #[display(fmt = "end of modulus switching chain reached")]
    EndOfModulusChain,
    #[display(fmt = "failed to load object: {}", _0)]
    LoadError(LoadError),
    #[display(fmt = "failed to save object: {}", _0)]
    SaveError(SaveError),
    #[display(fmt = "invalid operand: {}", _0)]
    InvalidOperand(#[error(not(source))] &'static str),
    #[display(fmt = "result ciphertext is transparent")]
    TransparentCiphertext,
}

impl From<ParameterError> for Error {
    fn from(err: ParameterError) -> Self {
        Error::InvalidParameter(err)
    }
}

impl From<EncodingError> for Error {
    fn from(err: EncodingError) -> Self {
        Error::EncodingError(err)
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Error::LoadError(err)
    }
}

impl From<SaveError> for Error {
    fn from(err: SaveError) -> Self {
        Error::SaveError(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
