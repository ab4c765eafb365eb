//! Blowfish primitives, the per-frame encryption envelope, and the
//! encrypted-file envelope.
//!
//! The block primitive operates on 8-byte blocks with *little-endian* word
//! order, matching the legacy wire and file formats this transport speaks.
//! ECB zero-pads the unaligned tail on encrypt and ignores it on decrypt;
//! CBC chains through a caller-held 64-bit IV that is updated in place so
//! the functions can be called incrementally.
//!
//! Steady-state frame envelope:
//!
//! ```ascii
//! 0: padded size (u32 BE) - ciphertext length, a multiple of 8
//! 4: real size   (u32 BE) - plaintext length inside
//! 8: Blowfish-ECB ciphertext, padded size bytes
//! ```
//!
//! Encrypted file envelope:
//!
//! ```ascii
//! 0: magic (4 bytes)
//! 4: original size (u32 LE)
//! 8: Blowfish-CBC ciphertext of original size bytes, zero-padded to 8
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::BlowfishLE;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config;
use crate::error::{CryptoError, Error};
use crate::packet::Packet;
use crate::read_only_packet::PacketRead;

/// Size of one Blowfish block in bytes.
pub const BLOWFISH_BLOCK_SIZE: usize = 8;

/// Number of shared-secret bytes used as the per-session network key.
pub const NET_KEY_BYTE_SIZE: usize = 8;

/// An expanded Blowfish key schedule.
#[derive(Clone)]
pub struct BlowfishKey {
    cipher: BlowfishLE,
}

impl fmt::Debug for BlowfishKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlowfishKey(..)")
    }
}

impl BlowfishKey {
    pub fn new(key: &[u8]) -> Result<BlowfishKey, CryptoError> {
        BlowfishLE::new_from_slice(key)
            .map(|cipher| BlowfishKey { cipher })
            .map_err(|_| CryptoError::InvalidKeyLength(key.len()))
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        self.cipher
            .decrypt_block(GenericArray::from_mut_slice(block));
    }
}

fn pad_to_block(data: &mut Vec<u8>) {
    let remainder = data.len() % BLOWFISH_BLOCK_SIZE;

    if remainder != 0 {
        data.resize(data.len() + BLOWFISH_BLOCK_SIZE - remainder, 0);
    }
}

fn check_sizes(data: &[u8], real_size: Option<usize>) -> Result<(), CryptoError> {
    if data.len() % BLOWFISH_BLOCK_SIZE != 0 {
        return Err(CryptoError::BlockAlignment(data.len()));
    }

    if let Some(real) = real_size {
        if real > data.len() {
            return Err(CryptoError::BadRealSize {
                real,
                len: data.len(),
            });
        }
    }

    Ok(())
}

/// ECB-encrypt `data` in place, zero-padding to a whole number of blocks.
pub fn encrypt(key: &BlowfishKey, data: &mut Vec<u8>) {
    pad_to_block(data);

    for block in data.chunks_exact_mut(BLOWFISH_BLOCK_SIZE) {
        key.encrypt_block(block);
    }
}

/// ECB-decrypt `data` in place. The ciphertext length must be a multiple
/// of the block size; when `real_size` is given the buffer is truncated to
/// it afterwards, dropping any padding.
pub fn decrypt(
    key: &BlowfishKey,
    data: &mut Vec<u8>,
    real_size: Option<usize>,
) -> Result<(), CryptoError> {
    check_sizes(data, real_size)?;

    for block in data.chunks_exact_mut(BLOWFISH_BLOCK_SIZE) {
        key.decrypt_block(block);
    }

    if let Some(real) = real_size {
        data.truncate(real);
    }

    Ok(())
}

/// CBC-encrypt `data` in place. `iv` is updated to the last ciphertext
/// block so the function can be called incrementally.
pub fn encrypt_cbc(key: &BlowfishKey, iv: &mut [u8; BLOWFISH_BLOCK_SIZE], data: &mut Vec<u8>) {
    pad_to_block(data);
    let mut previous = *iv;

    for block in data.chunks_exact_mut(BLOWFISH_BLOCK_SIZE) {
        for (byte, chained) in block.iter_mut().zip(previous) {
            *byte ^= chained;
        }

        key.encrypt_block(block);
        previous.copy_from_slice(block);
    }

    *iv = previous;
}

/// CBC-decrypt `data` in place, truncating to `real_size` when given.
/// `iv` is updated to the last ciphertext block.
pub fn decrypt_cbc(
    key: &BlowfishKey,
    iv: &mut [u8; BLOWFISH_BLOCK_SIZE],
    data: &mut Vec<u8>,
    real_size: Option<usize>,
) -> Result<(), CryptoError> {
    check_sizes(data, real_size)?;
    let mut previous = *iv;

    for block in data.chunks_exact_mut(BLOWFISH_BLOCK_SIZE) {
        let mut ciphertext = [0u8; BLOWFISH_BLOCK_SIZE];
        ciphertext.copy_from_slice(block);

        key.decrypt_block(block);

        for (byte, chained) in block.iter_mut().zip(previous) {
            *byte ^= chained;
        }

        previous = ciphertext;
    }

    *iv = previous;

    if let Some(real) = real_size {
        data.truncate(real);
    }

    Ok(())
}

/// Apply the frame envelope to `packet`, which must contain 8 blank bytes
/// followed by the plaintext body. On return the packet holds
/// `padded_size (u32 BE) || real_size (u32 BE) || ciphertext` with the
/// cursor at the end.
pub fn encrypt_packet(key: &BlowfishKey, packet: &mut Packet) -> Result<(), Error> {
    let real_size = packet
        .size()
        .checked_sub(2 * std::mem::size_of::<u32>() as u32)
        .ok_or(CryptoError::TruncatedCiphertext)?;

    packet.seek(4)?;
    packet.write_u32_be(real_size)?;

    // Round up to a whole number of blocks and pad with zeroes.
    let padded_size = (real_size + 7) & !7;

    if padded_size != real_size {
        packet.end();
        packet.write_blank(padded_size - real_size)?;
    }

    let total = packet.size();
    let data = packet.direct(total)?;

    for block in data[8..].chunks_exact_mut(BLOWFISH_BLOCK_SIZE) {
        key.encrypt_block(block);
    }

    packet.rewind();
    packet.write_u32_be(padded_size)?;
    packet.end();
    Ok(())
}

/// Decrypt a framed packet in place. The packet must hold the two size
/// words followed by `padded_size` bytes of ciphertext; anything smaller
/// than one block is left untouched.
pub fn decrypt_packet(key: &BlowfishKey, packet: &mut Packet) -> Result<(), Error> {
    if (packet.size() as usize) < 2 * std::mem::size_of::<u32>() + BLOWFISH_BLOCK_SIZE {
        return Ok(());
    }

    packet.rewind();
    let padded_size = packet.read_u32_be()?;

    if padded_size as usize % BLOWFISH_BLOCK_SIZE != 0 {
        return Err(CryptoError::BlockAlignment(padded_size as usize).into());
    }

    if u64::from(padded_size) + 8 > u64::from(packet.size()) {
        return Err(CryptoError::TruncatedCiphertext.into());
    }

    let total = packet.size();
    let data = packet.direct(total)?;
    let end = 8 + padded_size as usize;

    for block in data[8..end].chunks_exact_mut(BLOWFISH_BLOCK_SIZE) {
        key.decrypt_block(block);
    }

    Ok(())
}

/// The process-wide file encryption context: magic, key schedule and IV,
/// constructed once at startup from the configuration.
#[derive(Clone)]
pub struct FileCipher {
    magic: [u8; 4],
    key: BlowfishKey,
    iv: [u8; BLOWFISH_BLOCK_SIZE],
}

impl FileCipher {
    pub fn new(
        magic: [u8; 4],
        key: &[u8],
        iv: [u8; BLOWFISH_BLOCK_SIZE],
    ) -> Result<FileCipher, CryptoError> {
        Ok(FileCipher {
            magic,
            key: BlowfishKey::new(key)?,
            iv,
        })
    }

    /// The cipher for the compiled-in default key material.
    pub fn default_keys() -> FileCipher {
        FileCipher::new(
            config::DEFAULT_FILE_MAGIC,
            &config::DEFAULT_FILE_KEY,
            config::DEFAULT_FILE_IV,
        )
        .expect("compiled-in key material is valid")
    }

    pub fn from_config(config: &config::ServerConfig) -> Result<FileCipher, CryptoError> {
        FileCipher::new(config.file_magic, &config.file_key, config.file_iv)
    }

    /// Produce the on-disk encrypted form of `data`.
    pub fn encrypt_data(&self, data: &[u8]) -> Vec<u8> {
        let mut body = data.to_vec();
        let mut iv = self.iv;
        encrypt_cbc(&self.key, &mut iv, &mut body);

        // The on-disk header stores the plaintext size as a u32.
        let size = data.len() as u32;
        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&self.magic);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Verify and strip the header, decrypt, and truncate to the original
    /// size.
    pub fn decrypt_data(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() <= 8 {
            return Err(CryptoError::TruncatedFile);
        }

        if data[..4] != self.magic {
            return Err(CryptoError::BadMagic);
        }

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&data[4..8]);
        let original_size = u32::from_le_bytes(size_bytes) as usize;

        let mut body = data[8..].to_vec();

        if original_size > body.len() {
            return Err(CryptoError::TruncatedFile);
        }

        let mut iv = self.iv;
        decrypt_cbc(&self.key, &mut iv, &mut body, Some(original_size))?;
        Ok(body)
    }

    pub fn encrypt_file(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        let data = std::fs::read(input)?;
        std::fs::write(output, self.encrypt_data(&data))?;
        Ok(())
    }

    pub fn decrypt_file(&self, input: &Path) -> anyhow::Result<Vec<u8>> {
        let data = std::fs::read(input)?;
        Ok(self.decrypt_data(&data)?)
    }
}

/// Read a whole file, or exactly the first `requested_size` bytes of it.
pub fn load_file(path: &Path, requested_size: Option<usize>) -> std::io::Result<Vec<u8>> {
    match requested_size {
        None => std::fs::read(path),
        Some(size) => {
            let mut data = vec![0u8; size];
            File::open(path)?.read_exact(&mut data)?;
            Ok(data)
        }
    }
}

/// Generate `digits` lower-case hex digits from the OS CSPRNG. `digits`
/// must be even and at least 2; zero or negative means 80.
pub fn generate_random(digits: i32) -> Result<String, CryptoError> {
    if digits > 0 && digits % 2 != 0 {
        return Err(CryptoError::OddRandomSize(digits));
    }

    let count = if digits <= 0 { 40 } else { (digits / 2) as usize };
    let mut bytes = vec![0u8; count];
    OsRng.fill_bytes(&mut bytes);

    let mut out = String::with_capacity(count * 2);

    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }

    Ok(out)
}

/// A 31-bit session key. Never zero: the zero draw is replaced by a fixed
/// sentinel.
pub fn generate_session_key() -> u32 {
    let key = OsRng.next_u32() & 0x7fff_ffff;

    if key == 0 {
        0x8bad_f00d
    } else {
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn session_key() -> BlowfishKey {
        BlowfishKey::new(b"8bytekey").unwrap()
    }

    #[rstest]
    #[case::aligned(16)]
    #[case::unaligned(21)]
    #[case::single_byte(1)]
    fn test_ecb_round_trip(#[case] len: usize) {
        let key = session_key();
        let original: Vec<u8> = (0..len).map(|i| i as u8).collect();

        let mut data = original.clone();
        encrypt(&key, &mut data);
        assert_eq!(data.len() % BLOWFISH_BLOCK_SIZE, 0);
        assert_ne!(&data[..original.len().min(data.len())], &original[..]);

        decrypt(&key, &mut data, Some(len)).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_ecb_decrypt_misaligned() {
        let key = session_key();
        let mut data = vec![0u8; 13];
        assert_eq!(
            decrypt(&key, &mut data, None),
            Err(CryptoError::BlockAlignment(13))
        );
    }

    #[test]
    fn test_cbc_round_trip_and_chaining() {
        let key = session_key();
        let original = b"a test payload that spans several blocks".to_vec();

        let mut data = original.clone();
        let mut iv = *b"initvect";
        encrypt_cbc(&key, &mut iv, &mut data);

        // The IV must have advanced to the last ciphertext block.
        assert_eq!(iv[..], data[data.len() - 8..]);

        // Two identical plaintext blocks must not produce identical
        // ciphertext blocks.
        let mut repeated = vec![0x55u8; 16];
        let mut iv2 = *b"initvect";
        encrypt_cbc(&key, &mut iv2, &mut repeated);
        assert_ne!(repeated[..8], repeated[8..16]);

        let mut iv = *b"initvect";
        decrypt_cbc(&key, &mut iv, &mut data, Some(original.len())).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cbc_incremental_matches_one_shot() {
        let key = session_key();
        let payload = vec![0x5au8; 32];

        let mut whole = payload.clone();
        let mut iv = *b"P[?jd6c4";
        encrypt_cbc(&key, &mut iv, &mut whole);

        let mut first = payload[..16].to_vec();
        let mut second = payload[16..].to_vec();
        let mut iv = *b"P[?jd6c4";
        encrypt_cbc(&key, &mut iv, &mut first);
        encrypt_cbc(&key, &mut iv, &mut second);

        first.extend_from_slice(&second);
        assert_eq!(first, whole);
    }

    // The literal on-disk form of "This is a test file.\n" under the
    // default key material.
    const TEST_FILE_PLAIN: &[u8] = b"This is a test file.\n";
    const TEST_FILE_ENCRYPTED: [u8; 32] = [
        0x43, 0x48, 0x45, 0x44, 0x15, 0x00, 0x00, 0x00, 0x20, 0x9b, 0x0e, 0x4a, 0x65, 0x48, 0x05,
        0x46, 0xb2, 0x55, 0x3b, 0x53, 0x2c, 0x71, 0xcf, 0x77, 0xbd, 0xa0, 0xb3, 0x1c, 0x2b, 0x53,
        0x5e, 0xaf,
    ];

    #[test]
    fn test_encrypted_file_literal() {
        let cipher = FileCipher::default_keys();

        let encrypted = cipher.encrypt_data(TEST_FILE_PLAIN);
        assert_eq!(encrypted.len(), 32);
        assert_eq!(encrypted, TEST_FILE_ENCRYPTED);

        let decrypted = cipher.decrypt_data(&encrypted).unwrap();
        assert_eq!(decrypted, TEST_FILE_PLAIN);
    }

    #[test]
    fn test_encrypted_file_rejects_garbage() {
        let cipher = FileCipher::default_keys();

        let mut wrong_magic = TEST_FILE_ENCRYPTED;
        wrong_magic[0] = b'X';
        assert_eq!(
            cipher.decrypt_data(&wrong_magic),
            Err(CryptoError::BadMagic)
        );

        assert_eq!(
            cipher.decrypt_data(&TEST_FILE_ENCRYPTED[..8]),
            Err(CryptoError::TruncatedFile)
        );

        let mut bad_size = TEST_FILE_ENCRYPTED.to_vec();
        bad_size[4] = 0xff;
        assert_eq!(
            cipher.decrypt_data(&bad_size),
            Err(CryptoError::TruncatedFile)
        );
    }

    #[test]
    fn test_packet_envelope_round_trip() {
        let key = session_key();
        let body = b"a command stream that is not block aligned";

        let mut packet = Packet::new();
        packet.write_blank(8).unwrap();
        packet.write_array(body).unwrap();
        encrypt_packet(&key, &mut packet).unwrap();

        packet.rewind();
        let padded_size = packet.read_u32_be().unwrap();
        let real_size = packet.read_u32_be().unwrap();
        assert_eq!(real_size as usize, body.len());
        assert_eq!(padded_size as usize, (body.len() + 7) / 8 * 8);
        assert_eq!(packet.size(), 8 + padded_size);
        assert_ne!(&packet.const_data()[8..8 + body.len()], body);

        decrypt_packet(&key, &mut packet).unwrap();
        assert_eq!(&packet.const_data()[8..8 + body.len()], body);
    }

    #[test]
    fn test_packet_envelope_bad_ciphertext() {
        let key = session_key();

        let mut packet = Packet::new();
        packet.write_u32_be(24).unwrap();
        packet.write_u32_be(20).unwrap();
        packet.write_blank(8).unwrap();

        // Claims 24 bytes of ciphertext but only holds 8.
        assert!(decrypt_packet(&key, &mut packet).is_err());
    }

    #[test]
    fn test_generate_random() {
        assert_eq!(generate_random(0).unwrap().len(), 80);
        assert_eq!(generate_random(-11).unwrap().len(), 80);
        assert_eq!(generate_random(20).unwrap().len(), 20);
        assert_eq!(generate_random(3), Err(CryptoError::OddRandomSize(3)));

        let value = generate_random(40).unwrap();
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_random(40).unwrap(), value);
    }

    #[test]
    fn test_generate_session_key() {
        for _ in 0..1000 {
            let key = generate_session_key();
            assert_ne!(key, 0);
            assert_eq!(key & 0x8000_0000, 0);
        }
    }

    #[test]
    fn test_load_file_bounded() {
        let path = std::env::temp_dir().join("lobbynet-load-file-test");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(load_file(&path, Some(4)).unwrap(), b"0123");
        assert_eq!(load_file(&path, None).unwrap(), b"0123456789");
        assert!(load_file(&path, Some(64)).is_err());

        std::fs::remove_file(&path).ok();
    }
}
