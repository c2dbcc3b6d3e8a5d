//! L1 — cryptographic primitives (spec §4.2).
//!
//! AEAD sealing/opening, a memory-hard KDF, hashing, HMAC and the
//! CSPRNG used for salts, nonces and identifiers. Every KDF invocation
//! mixes in exactly one domain-separation label.

use aead::{Aead, KeyInit, Payload};
#[cfg(feature = "gcm-siv")]
use aes_gcm_siv::{Aes256GcmSiv as Cipher, Nonce as CipherNonce};
#[cfg(all(not(feature = "gcm-siv"), feature = "gcm"))]
use aes_gcm::{Aes256Gcm as Cipher, Nonce as CipherNonce};
#[cfg(all(not(feature = "gcm-siv"), not(feature = "gcm")))]
compile_error!("enable either 'gcm-siv' (default) or 'gcm'");

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{MyfsError, Result};

/// Domain-separation labels (spec §4.2). Exactly one is mixed into
/// every KDF invocation.
pub mod labels {
    pub const MASTER: &[u8] = b"mfs/master";
    pub const FILE: &[u8] = b"mfs/file";
    pub const TABLE: &[u8] = b"mfs/table";
    pub const MACHINE: &[u8] = b"mfs/machine";
}

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit key that zeroizes its backing memory on drop.
pub struct Key(Secret<[u8; KEY_LEN]>);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(Secret::new(bytes))
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose_secret()
    }
}

impl Clone for Key {
    fn clone(&self) -> Self {
        Key::from_bytes(*self.expose())
    }
}

/// Argon2id parameters, recorded in the volume header so a later
/// reader reproduces them exactly (spec §4.2, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KdfParams {
    /// Memory cost in bytes, as stored on disk (container layout §6).
    pub memory_cost_bytes: u64,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Interactive/offline-appropriate defaults: 64 MiB, 3 passes, single lane.
    pub const DEFAULT: KdfParams = KdfParams {
        memory_cost_bytes: 64 * 1024 * 1024,
        iterations: 3,
        parallelism: 1,
    };

    fn argon2_params(self) -> Result<Params> {
        let memory_kib = (self.memory_cost_bytes / 1024).max(8) as u32;
        Params::new(memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|e| MyfsError::InvalidInput(format!("invalid KDF params: {e}")))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::DEFAULT
    }
}

/// Derive a 256-bit key from a secret, a salt and a domain label.
pub fn derive_key(secret: &[u8], salt: &[u8], label: &[u8], params: KdfParams) -> Result<Key> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.argon2_params()?);
    // Mix the label into the salt material so the same (secret, salt)
    // pair used under two labels never collides.
    let mut salted = Vec::with_capacity(salt.len() + label.len());
    salted.extend_from_slice(salt);
    salted.extend_from_slice(label);
    let context_salt = Sha256::digest(&salted);

    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(secret, &context_salt, &mut out)
        .map_err(|e| MyfsError::InvalidInput(format!("KDF failed: {e}")))?;
    Ok(Key::from_bytes(out))
}

/// Seal `plaintext` under `key`/`nonce`, binding `aad` to the ciphertext.
pub fn seal(key: &Key, nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::new_from_slice(key.expose()).expect("key is 32 bytes");
    let n = CipherNonce::from_slice(nonce);
    cipher
        .encrypt(n, Payload { msg: plaintext, aad })
        .map_err(|_| MyfsError::AuthFailed)
}

/// Open a ciphertext produced by [`seal`]. Any failure — wrong key or
/// tampered bytes — is surfaced uniformly as [`MyfsError::AuthFailed`];
/// callers that need to distinguish "wrong content digest" do so after
/// a successful open (spec §7).
pub fn open(key: &Key, nonce: &[u8; NONCE_LEN], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Cipher::new_from_slice(key.expose()).expect("key is 32 bytes");
    let n = CipherNonce::from_slice(nonce);
    cipher
        .decrypt(n, Payload { msg: ciphertext, aad })
        .map_err(|_| MyfsError::AuthFailed)
}

/// SHA-256 content digest, used for plaintext integrity checks (spec §3, §4.7).
pub fn content_digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256, used for machine-binding tokens and the header integrity tag.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time comparison, used wherever a derived tag is checked
/// against a stored one.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Fill `buf` with CSPRNG output (salts, nonces, identifiers).
pub fn fill_random(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut n = [0u8; NONCE_LEN];
    fill_random(&mut n);
    n
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    fill_random(&mut out);
    out
}

#[allow(dead_code)]
pub fn zeroize_bytes(mut v: Vec<u8>) {
    v.zeroize();
}
