//! Byte format shared by every persisted type: a 16-byte little-endian header
//! followed by the bincode payload, optionally zstd-compressed.
//!
//! ```text
//! [0..2]   magic 0xA15E
//! [2]      header size (16)
//! [3]      major version
//! [4]      minor version
//! [5]      compression mode
//! [6..8]   reserved, zero
//! [8..16]  total size in bytes, header included
//! ```

use std::io::Read;

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    context::Context,
    error::{Error, LoadError, SaveError},
    params::EncryptionParameters,
    random::PrngInfo,
    ring::Modulus,
};

pub const SERIAL_MAGIC: u16 = 0xA15E;
pub const SERIAL_HEADER_SIZE: usize = 16;
pub const SERIAL_VERSION_MAJOR: u8 = 4;
pub const SERIAL_VERSION_MINOR: u8 = 1;

const ZSTD_LEVEL: i32 = 3;

/// A zstd block holds at most 128 KiB and never encodes in fewer than four
/// bytes, so no valid stream expands by more than this factor.
const ZSTD_RATIO_MAX: u64 = 1 << 15;

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ComprMode {
    None,
    #[default]
    Zstd,
}

impl ComprMode {
    fn tag(self) -> u8 {
        match self {
            ComprMode::None => 0,
            ComprMode::Zstd => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ComprMode::None),
            2 => Some(ComprMode::Zstd),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SerialHeader {
    pub compr_mode: ComprMode,
    pub size: u64,
}

impl SerialHeader {
    pub fn to_bytes(&self) -> [u8; SERIAL_HEADER_SIZE] {
        let mut bytes = [0; SERIAL_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&SERIAL_MAGIC.to_le_bytes());
        bytes[2] = SERIAL_HEADER_SIZE as u8;
        bytes[3] = SERIAL_VERSION_MAJOR;
        bytes[4] = SERIAL_VERSION_MINOR;
        bytes[5] = self.compr_mode.tag();
        bytes[8..16].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < SERIAL_HEADER_SIZE
            || u16::from_le_bytes([bytes[0], bytes[1]]) != SERIAL_MAGIC
            || bytes[2] as usize != SERIAL_HEADER_SIZE
            || bytes[6..8] != [0, 0]
        {
            return Err(LoadError::InvalidHeader);
        }
        if bytes[3] != SERIAL_VERSION_MAJOR || bytes[4] != SERIAL_VERSION_MINOR {
            return Err(LoadError::UnsupportedVersion(bytes[3], bytes[4]));
        }
        let compr_mode =
            ComprMode::from_tag(bytes[5]).ok_or(LoadError::UnsupportedComprMode(bytes[5]))?;
        let mut size = [0; 8];
        size.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            compr_mode,
            size: u64::from_le_bytes(size),
        })
    }
}

pub(crate) fn save_payload<T: Serialize + ?Sized>(
    object: &T,
    compr_mode: ComprMode,
) -> Result<Vec<u8>, Error> {
    let raw = bincode::serialize(object).map_err(SaveError::Serialize)?;
    let payload = match compr_mode {
        ComprMode::None => raw,
        ComprMode::Zstd => zstd::encode_all(raw.as_slice(), ZSTD_LEVEL).map_err(SaveError::Compress)?,
    };
    let header = SerialHeader {
        compr_mode,
        size: (SERIAL_HEADER_SIZE + payload.len()) as u64,
    };
    let mut out = Vec::with_capacity(SERIAL_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub(crate) fn load_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LoadError> {
    let header = SerialHeader::from_bytes(bytes)?;
    if header.size != bytes.len() as u64 {
        return Err(LoadError::SizeMismatch);
    }
    let payload = &bytes[SERIAL_HEADER_SIZE..];
    let object = match header.compr_mode {
        ComprMode::None => bincode::deserialize(payload),
        ComprMode::Zstd => {
            let limit = (payload.len() as u64).saturating_mul(ZSTD_RATIO_MAX);
            let raw = decompress_bounded(payload, limit)?;
            bincode::deserialize(&raw)
        }
    };
    object.map_err(LoadError::Payload)
}

fn decompress_bounded(payload: &[u8], limit: u64) -> Result<Vec<u8>, LoadError> {
    let decoder = zstd::stream::read::Decoder::new(payload).map_err(LoadError::Decompress)?;
    let mut raw = Vec::new();
    decoder
        .take(limit.saturating_add(1))
        .read_to_end(&mut raw)
        .map_err(LoadError::Decompress)?;
    if raw.len() as u64 > limit {
        return Err(LoadError::PayloadTooLarge(limit));
    }
    Ok(raw)
}

/// Persisted types.  `load` decodes and then checks the object against a
/// context, which also expands seeded (compact) data.
pub trait Persist: Serialize + DeserializeOwned {
    fn save(&self, compr_mode: ComprMode) -> Result<Vec<u8>, Error> {
        save_payload(self, compr_mode)
    }

    fn save_size(&self, compr_mode: ComprMode) -> Result<usize, Error> {
        match compr_mode {
            ComprMode::None => bincode::serialized_size(self)
                .map(|size| SERIAL_HEADER_SIZE + size as usize)
                .map_err(|err| SaveError::Serialize(err).into()),
            ComprMode::Zstd => Ok(self.save(compr_mode)?.len()),
        }
    }

    /// Decodes without any validation against a context.
    fn load_unchecked(bytes: &[u8]) -> Result<Self, Error> {
        Ok(load_payload(bytes)?)
    }

    fn load(context: &Context, bytes: &[u8]) -> Result<Self, Error> {
        let mut object = Self::load_unchecked(bytes)?;
        object.prepare_for(context)?;
        Ok(object)
    }

    /// Checks a freshly decoded object against `context`.
    fn prepare_for(&mut self, context: &Context) -> Result<(), LoadError>;
}

/// An object in compact form that can only be saved.  Loading it back with
/// [`Persist::load`] yields the full object.
#[derive(Debug)]
pub struct Serializable<T> {
    object: T,
}

impl<T: Persist> Serializable<T> {
    pub(crate) fn new(object: T) -> Self {
        Self { object }
    }

    pub fn save(&self, compr_mode: ComprMode) -> Result<Vec<u8>, Error> {
        self.object.save(compr_mode)
    }

    pub fn save_size(&self, compr_mode: ComprMode) -> Result<usize, Error> {
        self.object.save_size(compr_mode)
    }
}

impl Persist for Modulus {
    fn prepare_for(&mut self, _context: &Context) -> Result<(), LoadError> {
        Ok(())
    }
}

impl Persist for EncryptionParameters {
    fn prepare_for(&mut self, _context: &Context) -> Result<(), LoadError> {
        Ok(())
    }
}

impl Persist for PrngInfo {
    fn prepare_for(&mut self, _context: &Context) -> Result<(), LoadError> {
        Ok(())
    }
}
