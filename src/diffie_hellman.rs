//! Diffie-Hellman key agreement for the session handshake.
//!
//! Parameters are a 1024-bit prime with base 2. Public values and the
//! prime travel as 256-digit hex strings, right-justified with zeroes; a
//! completed agreement yields a shared secret of exactly 128 big-endian
//! bytes, of which the first 8 become the session Blowfish key.

use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use rand::rngs::OsRng;

use crate::error::CryptoError;

/// Bit size of the prime.
pub const KEY_BIT_SIZE: usize = 1024;

/// Hex-digit size of the prime and of public values on the wire.
pub const KEY_HEX_SIZE: usize = 256;

/// Byte size of the shared secret (and of the persisted prime).
pub const SHARED_DATA_SIZE: usize = 128;

/// The generator, as it appears on the wire.
pub const BASE_STRING: &str = "2";

/// A reusable parameter set `(p, g)`. Generated once per process and
/// copied to each connection.
#[derive(Clone, Debug)]
pub struct DhParams {
    prime: BigUint,
    base: BigUint,
}

impl DhParams {
    /// Generate a fresh 1024-bit parameter set. This takes a moment; run
    /// it on a blocking task from async contexts.
    pub fn generate() -> DhParams {
        DhParams {
            prime: OsRng.gen_prime(KEY_BIT_SIZE),
            base: BigUint::from(2u32),
        }
    }

    /// Reconstruct a parameter set from a 256-digit hex prime.
    pub fn load_hex(prime_hex: &str) -> Result<DhParams, CryptoError> {
        if prime_hex.len() != KEY_HEX_SIZE {
            return Err(CryptoError::PrimeSize {
                expected: KEY_HEX_SIZE,
                got: prime_hex.len(),
            });
        }

        let prime =
            BigUint::parse_bytes(prime_hex.as_bytes(), 16).ok_or(CryptoError::BadHexNumber)?;
        DhParams::checked(prime)
    }

    /// Reconstruct a parameter set from a 128-byte big-endian prime.
    pub fn load_bytes(prime: &[u8]) -> Result<DhParams, CryptoError> {
        if prime.len() != SHARED_DATA_SIZE {
            return Err(CryptoError::PrimeSize {
                expected: SHARED_DATA_SIZE,
                got: prime.len(),
            });
        }

        DhParams::checked(BigUint::from_bytes_be(prime))
    }

    fn checked(prime: BigUint) -> Result<DhParams, CryptoError> {
        if (prime.bits() + 7) / 8 != SHARED_DATA_SIZE {
            return Err(CryptoError::PrimeSize {
                expected: KEY_BIT_SIZE,
                got: prime.bits(),
            });
        }

        Ok(DhParams {
            prime,
            base: BigUint::from(2u32),
        })
    }

    /// The prime as 128 big-endian bytes, for persisting.
    pub fn save(&self) -> Vec<u8> {
        left_pad_bytes(self.prime.to_bytes_be(), SHARED_DATA_SIZE)
    }

    /// The prime as a 256-digit hex string, for the wire and the
    /// configuration file.
    pub fn prime_hex(&self) -> String {
        right_justified(&even_hex(&self.prime), KEY_HEX_SIZE)
    }

    /// Generate a keypair under these parameters.
    pub fn create_context(&self) -> DhContext {
        let two = BigUint::from(2u32);

        let private = loop {
            let candidate = OsRng.gen_biguint_below(&self.prime);

            if candidate >= two {
                break candidate;
            }
        };

        let public = self.base.modpow(&private, &self.prime);

        DhContext {
            params: self.clone(),
            private,
            public,
        }
    }
}

/// One side's keypair for a single handshake.
pub struct DhContext {
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl DhContext {
    pub fn params(&self) -> &DhParams {
        &self.params
    }

    /// The public value as a 256-digit hex string, right-justified with
    /// zeroes.
    pub fn public_hex(&self) -> String {
        right_justified(&even_hex(&self.public), KEY_HEX_SIZE)
    }

    /// Complete the agreement with the peer's 256-digit hex public value,
    /// yielding the 128-byte shared secret.
    pub fn shared_secret(&self, peer_public_hex: &str) -> Result<Vec<u8>, CryptoError> {
        if peer_public_hex.len() != KEY_HEX_SIZE {
            return Err(CryptoError::PublicSize {
                expected: KEY_HEX_SIZE,
                got: peer_public_hex.len(),
            });
        }

        let peer = BigUint::parse_bytes(peer_public_hex.as_bytes(), 16)
            .ok_or(CryptoError::BadHexNumber)?;

        if peer <= BigUint::from(1u32) || peer >= self.params.prime {
            return Err(CryptoError::DegeneratePublic);
        }

        let shared = peer.modpow(&self.private, &self.params.prime);
        Ok(left_pad_bytes(shared.to_bytes_be(), SHARED_DATA_SIZE))
    }
}

/// Compute `g^a mod p` over hex strings. The result is lower-case hex,
/// zero-padded to an even number of digits, and right-justified to
/// `output_size` when that is nonzero.
pub fn gen_diffie_hellman(
    g: &str,
    p: &str,
    a: &str,
    output_size: usize,
) -> Result<String, CryptoError> {
    let base = BigUint::parse_bytes(g.as_bytes(), 16).ok_or(CryptoError::BadHexNumber)?;
    let prime = BigUint::parse_bytes(p.as_bytes(), 16).ok_or(CryptoError::BadHexNumber)?;
    let secret = BigUint::parse_bytes(a.as_bytes(), 16).ok_or(CryptoError::BadHexNumber)?;

    if prime == BigUint::from(0u32) {
        return Err(CryptoError::ZeroModulus);
    }

    let result = even_hex(&base.modpow(&secret, &prime));

    if output_size > 0 {
        Ok(right_justified(&result, output_size))
    } else {
        Ok(result)
    }
}

/// Lower-case hex with an even number of digits, so the string maps to
/// whole bytes.
fn even_hex(value: &BigUint) -> String {
    let mut out = format!("{value:x}");

    if out.len() % 2 != 0 {
        out.insert(0, '0');
    }

    out
}

fn right_justified(value: &str, width: usize) -> String {
    if value.len() >= width {
        value.to_string()
    } else {
        let mut out = "0".repeat(width - value.len());
        out.push_str(value);
        out
    }
}

fn left_pad_bytes(bytes: Vec<u8>, width: usize) -> Vec<u8> {
    if bytes.len() >= width {
        bytes
    } else {
        let mut out = vec![0u8; width - bytes.len()];
        out.extend_from_slice(&bytes);
        out
    }
}
