/*!
Crypto things
*/
use ring::aead::BoundKey;
use std::num::NonZeroU32;

use crate::{Error, Result};

const PBKDF2_ITERATIONS: u32 = 100_000;
const PASSWORD_SALT_LEN: usize = 16;
const PASSWORD_HASH_LEN: usize = 32;

fn crypto_fault(msg: &str) -> Error {
    Error::Configuration(msg.to_string())
}

/// ring requires an implementor of `NonceSequence`,
/// which if a wrapping trait around `ring::aead::Nonce`.
/// We have to make a wrapper that can pass ownership
/// of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| crypto_fault("error getting random bytes"))?;
    Ok(buf)
}

pub fn new_nonce() -> Result<Vec<u8>> {
    rand_bytes(12)
}

/// Compare two secrets without leaking where they differ
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}

/// Hex encoded value + nonce pair as stored in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enc {
    pub value: String,
    pub nonce: String,
}

/// Holds the server secret used for signing stored tokens and
/// encrypting provider credentials at rest.
#[derive(Clone)]
pub struct Vault {
    key: Vec<u8>,
}

impl Vault {
    /// `key` must be exactly 32 bytes (AES_256_GCM)
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Configuration(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self { key: key.to_vec() })
    }

    pub fn hmac_sign(&self, s: &str) -> String {
        let s_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &self.key);
        let tag = ring::hmac::sign(&s_key, s.as_bytes());
        hex::encode(tag.as_ref())
    }

    pub fn encrypt(&self, s: &str) -> Result<Enc> {
        let nonce = new_nonce()?;
        let b = encrypt(s.as_bytes(), &nonce, &self.key)?;
        Ok(Enc {
            value: hex::encode(&b),
            nonce: hex::encode(&nonce),
        })
    }

    pub fn decrypt(&self, enc: &Enc) -> Result<String> {
        let nonce = hex::decode(&enc.nonce).map_err(|_| crypto_fault("nonce hex decode error"))?;
        let mut value =
            hex::decode(&enc.value).map_err(|_| crypto_fault("value hex decode error"))?;
        let bytes = decrypt(value.as_mut_slice(), &nonce, &self.key)?;
        String::from_utf8(bytes.to_owned()).map_err(|_| crypto_fault("decrypted value not utf8"))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Vault(..)")
    }
}

/// Encrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
pub fn encrypt(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| crypto_fault("encryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass)
        .map_err(|_| crypto_fault("error building sealing key"))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| crypto_fault("failed encrypting bytes"))?;
    Ok(in_out)
}

/// Decrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are decrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
pub fn decrypt<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| crypto_fault("decryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass)
        .map_err(|_| crypto_fault("error building opening key"))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| crypto_fault("failed decrypting bytes"))?;
    Ok(out_slice)
}

fn pbkdf2_iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

/// Hash a password for storage.
///
/// Format is `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`
pub fn hash_password(password: &str) -> Result<String> {
    let salt = rand_bytes(PASSWORD_SALT_LEN)?;
    let iterations = pbkdf2_iterations();
    let mut out = [0u8; PASSWORD_HASH_LEN];
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &mut out,
    );
    Ok(format!(
        "pbkdf2-sha256${}${}${}",
        iterations,
        hex::encode(&salt),
        hex::encode(out)
    ))
}

/// Check `password` against a hash produced by `hash_password`.
/// Malformed hashes never verify.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let parts = encoded.split('$').collect::<Vec<_>>();
    if parts.len() != 4 || parts[0] != "pbkdf2-sha256" {
        return false;
    }
    let iterations = match parts[1].parse::<u32>().ok().and_then(NonZeroU32::new) {
        Some(i) => i,
        None => return false,
    };
    let (salt, expected) = match (hex::decode(parts[2]), hex::decode(parts[3])) {
        (Ok(s), Ok(e)) => (s, e),
        _ => return false,
    };
    ring::pbkdf2::verify(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &expected,
    )
    .is_ok()
}
