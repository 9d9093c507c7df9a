//! Password sealing for the key store container.
//!
//! Layout of a sealed store:
//!
//! ```text
//! magic "CDKS" | version u8 | pbkdf2 iterations u32 LE | salt [16]
//! | nonce [12] | tag [16] | ciphertext length u32 LE | ciphertext
//! ```
//!
//! The key is PBKDF2-HMAC-SHA256 over the password; the payload is
//! AES-256-GCM with everything up to the salt as additional authenticated
//! data, so a wrong password and a tampered header fail the same way.

use anyhow::{anyhow, Result};
use openssl::hash::MessageDigest;
use openssl::symm::Cipher;
use secrecy::zeroize::Zeroize;

/// File signature of a sealed key store
pub const STORE_MAGIC: &[u8; 4] = b"CDKS";
pub const STORE_FORMAT_VERSION: u8 = 1;
/// PBKDF2 rounds used for newly sealed stores
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Most PBKDF2 rounds accepted from a store file
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;
pub const SALT_SIZE: usize = 16;
/// Size of AES-256 key (256 bits = 32 bytes)
pub const AES_GCM_256_KEY_SIZE: usize = 32;
/// Size of AES-GCM nonce (96 bits = 12 bytes)
pub const AES_GCM_NONCE_SIZE: usize = 12;
/// Size of AES-GCM authentication tag (128 bits = 16 bytes)
pub const AES_GCM_TAG_SIZE: usize = 16;
/// Size of ciphertext length field (u32 = 4 bytes)
pub const DATA_LEN_SIZE: usize = 4;

const ITERATIONS_SIZE: usize = 4;

pub struct SealedStore {
    iterations: u32,
    salt: Vec<u8>,
    nonce: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl SealedStore {
    /// Encrypt `plaintext` under a key derived from `password`.
    pub fn seal(plaintext: &[u8], password: &[u8]) -> Result<SealedStore> {
        let mut salt = [0u8; SALT_SIZE];
        openssl::rand::rand_bytes(&mut salt)
            .map_err(|e| anyhow!("Failed to generate salt: {}", e))?;

        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        openssl::rand::rand_bytes(&mut nonce)
            .map_err(|e| anyhow!("Failed to generate random nonce: {}", e))?;

        let mut sealed = SealedStore {
            iterations: PBKDF2_ITERATIONS,
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            tag: Vec::new(),
            ciphertext: Vec::new(),
        };

        let mut key = derive_key(password, &sealed.salt, sealed.iterations)?;
        let mut tag = [0u8; AES_GCM_TAG_SIZE];
        let encrypted = openssl::symm::encrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(&sealed.nonce),
            &sealed.header(),
            plaintext,
            &mut tag,
        );
        key.zeroize();

        sealed.ciphertext = encrypted.map_err(|e| anyhow!("AES-GCM encryption failed: {}", e))?;
        sealed.tag = tag.to_vec();
        Ok(sealed)
    }

    /// Decrypt the payload. Fails on a wrong password or any tampering.
    pub fn open(&self, password: &[u8]) -> Result<Vec<u8>> {
        let mut key = derive_key(password, &self.salt, self.iterations)?;
        let decrypted = openssl::symm::decrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(&self.nonce),
            &self.header(),
            &self.ciphertext,
            &self.tag,
        );
        key.zeroize();

        decrypted.map_err(|_| anyhow!("integrity check failed (wrong password or corrupted file)"))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut data = self.header();
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.tag);
        let data_len = self.ciphertext.len() as u32;
        data.extend_from_slice(&data_len.to_le_bytes());
        data.extend_from_slice(&self.ciphertext);
        data
    }

    pub fn deserialize(serialized: &[u8]) -> Result<SealedStore> {
        let mut reader = ByteReader::new(serialized);

        if reader.take(STORE_MAGIC.len())? != STORE_MAGIC {
            return Err(anyhow!("Not a key store file (bad signature)"));
        }
        let version = reader.take(1)?[0];
        if version != STORE_FORMAT_VERSION {
            return Err(anyhow!("Unsupported key store format version {}", version));
        }
        let iterations = reader.read_u32()?;
        if iterations == 0 {
            return Err(anyhow!("Key store declares zero key derivation rounds"));
        }
        if iterations > MAX_PBKDF2_ITERATIONS {
            return Err(anyhow!(
                "Key store declares too many key derivation rounds ({})",
                iterations
            ));
        }
        let salt = reader.take(SALT_SIZE)?.to_vec();
        let nonce = reader.take(AES_GCM_NONCE_SIZE)?.to_vec();
        let tag = reader.take(AES_GCM_TAG_SIZE)?.to_vec();
        let data_len = reader.read_u32()? as usize;
        let ciphertext = reader.take(data_len)?.to_vec();
        if !reader.is_empty() {
            return Err(anyhow!("Trailing bytes after key store payload"));
        }

        Ok(SealedStore {
            iterations,
            salt,
            nonce,
            tag,
            ciphertext,
        })
    }

    fn header(&self) -> Vec<u8> {
        let mut header =
            Vec::with_capacity(STORE_MAGIC.len() + 1 + ITERATIONS_SIZE + self.salt.len());
        header.extend_from_slice(STORE_MAGIC);
        header.push(STORE_FORMAT_VERSION);
        header.extend_from_slice(&self.iterations.to_le_bytes());
        header.extend_from_slice(&self.salt);
        header
    }
}

fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; AES_GCM_256_KEY_SIZE]> {
    let mut key = [0u8; AES_GCM_256_KEY_SIZE];
    openssl::pkcs5::pbkdf2_hmac(
        password,
        salt,
        iterations as usize,
        MessageDigest::sha256(),
        &mut key,
    )
    .map_err(|e| anyhow!("Key derivation failed: {}", e))?;
    Ok(key)
}

struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| anyhow!("Key store file is truncated"))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(DATA_LEN_SIZE)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn is_empty(&self) -> bool {
        self.offset == self.data.len()
    }
}
