//! Error taxonomy of the transport.
//!
//! Each component reports its own failure kind; the connection layer folds
//! them into a single fatal error per connection. Process-wide state (the
//! listener, the shared Diffie-Hellman parameters) is never torn down by a
//! single connection's failure.

use thiserror::Error;

use crate::codec::Encoding;

/// A packet buffer operation would leave the legal window.
///
/// Carries a hex-dump snapshot of the offending buffer so the connection
/// layer can log it when it tears the connection down.
#[derive(Debug, Clone, Error)]
#[error("{message} (position {position}, size {size})")]
pub struct PacketError {
    message: String,
    position: u32,
    size: u32,
    snapshot: String,
}

impl PacketError {
    pub fn new(
        message: impl Into<String>,
        position: u32,
        size: u32,
        snapshot: String,
    ) -> PacketError {
        PacketError {
            message: message.into(),
            position,
            size,
            snapshot,
        }
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Hex dump of the buffer at the moment the operation failed.
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("byte sequence is not valid for {0:?}")]
    Malformed(Encoding),
    #[error("string contains code points not representable in {0:?}")]
    Unmappable(Encoding),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid Blowfish key length {0}")]
    InvalidKeyLength(usize),
    #[error("data length {0} is not a multiple of the Blowfish block size")]
    BlockAlignment(usize),
    #[error("plaintext size {real} exceeds ciphertext size {len}")]
    BadRealSize { real: usize, len: usize },
    #[error("encrypted file magic mismatch")]
    BadMagic,
    #[error("encrypted file is truncated")]
    TruncatedFile,
    #[error("frame ciphertext runs past the buffered packet")]
    TruncatedCiphertext,
    #[error("not a valid hexadecimal number")]
    BadHexNumber,
    #[error("modulus must be nonzero")]
    ZeroModulus,
    #[error("prime must be {expected} hex digits, got {got}")]
    PrimeSize { expected: usize, got: usize },
    #[error("public value must be {expected} hex digits, got {got}")]
    PublicSize { expected: usize, got: usize },
    #[error("degenerate public value")]
    DegeneratePublic,
    #[error("random digit count {0} is odd")]
    OddRandomSize(i32),
    #[error("connection is not encrypted")]
    NotEncrypted,
}

/// A decrypted frame does not decompose into commands plus padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame sizes are inconsistent (padded {padded}, real {real})")]
    BadSizes { padded: u32, real: u32 },
    #[error("not enough data for a command header ({left} bytes left)")]
    CommandHeaderTruncated { left: u32 },
    #[error("command size {size} is smaller than its own header")]
    CommandTooShort { size: u16 },
    #[error("command data runs past the end of the frame (size {size}, {left} bytes left)")]
    CommandOverrun { size: u16, left: u32 },
    #[error("frame has {left} bytes of extra trailing data")]
    TrailingData { left: u32 },
}

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring buffer capacity {0} is outside the supported range")]
    InvalidCapacity(i32),
    #[error("failed to memory map ring buffer: {0}")]
    Map(#[from] nix::Error),
}

/// Umbrella over the component errors, used where layers meet.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
