//! Bit-exact container header (spec §6).
//!
//! ```text
//! offset  size  field
//! 0       4     magic = "MFS1"
//! 4       2     format version (big-endian)
//! 6       16    volume identifier (random)
//! 22      16    master salt
//! 38      8     KDF memory cost (bytes)
//! 46      4     KDF iterations
//! 50      4     KDF parallelism
//! 54      12    header AEAD nonce
//! 66      32    header AEAD tag over bytes [0..54)
//! 98      8     table segment offset
//! 106     8     table segment length
//! 114     8     data region offset
//! ```
//! All multi-byte integers are big-endian. The "AEAD tag" is an
//! HMAC-SHA256 keyed by the master key rather than a confidentiality
//! AEAD — see `DESIGN.md` open question 3 for why: bytes `[0..54)`
//! must remain plaintext on disk (a reader needs the salt and KDF
//! params before it can derive any key), so what protects them is a
//! keyed MAC, sized to exactly fill the 32-byte tag field.

use crate::crypto::{self, labels, KdfParams, Key};
use crate::error::{MyfsError, Result};
use crate::pae;

pub const MAGIC: [u8; 4] = *b"MFS1";
pub const FORMAT_VERSION: u16 = 1;
/// Bytes `[0..54)`: the portion covered by the header integrity tag.
pub const COVERED_LEN: usize = 54;
/// Full fixed-size header, before the variable-length table segment.
pub const HEADER_LEN: usize = 122;

#[derive(Debug, Clone)]
pub struct Header {
    pub version: u16,
    pub volume_id: [u8; 16],
    pub master_salt: [u8; 16],
    pub kdf: KdfParams,
    pub header_nonce: [u8; 12],
    pub header_tag: [u8; 32],
    pub table_offset: u64,
    pub table_len: u64,
    pub data_offset: u64,
}

impl Header {
    /// Build a fresh header for `Format` (spec §4.6). The tag is left
    /// zeroed; call [`Header::seal`] once the master key is available.
    pub fn new(volume_id: [u8; 16], master_salt: [u8; 16], kdf: KdfParams) -> Self {
        Header {
            version: FORMAT_VERSION,
            volume_id,
            master_salt,
            kdf,
            header_nonce: crypto::random_array::<12>(),
            header_tag: [0u8; 32],
            table_offset: HEADER_LEN as u64,
            table_len: 0,
            data_offset: HEADER_LEN as u64,
        }
    }

    fn encode_covered(&self) -> [u8; COVERED_LEN] {
        let mut out = [0u8; COVERED_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..22].copy_from_slice(&self.volume_id);
        out[22..38].copy_from_slice(&self.master_salt);
        out[38..46].copy_from_slice(&self.kdf.memory_cost_bytes.to_be_bytes());
        out[46..50].copy_from_slice(&self.kdf.iterations.to_be_bytes());
        out[50..54].copy_from_slice(&self.kdf.parallelism.to_be_bytes());
        out
    }

    /// Recompute and store the header integrity tag under `master_key`,
    /// drawing a fresh nonce (each seal must use a fresh one — spec §4.2).
    pub fn seal(&mut self, master_key: &Key) {
        self.header_nonce = crypto::random_array::<12>();
        self.header_tag = self.compute_tag(master_key);
    }

    fn compute_tag(&self, master_key: &Key) -> [u8; 32] {
        let covered = self.encode_covered();
        let aad = pae::header_aad(&self.volume_id, &covered);
        crypto::hmac_sha256(master_key.expose(), &[&aad, &self.header_nonce])
    }

    /// Verify the header integrity tag under a candidate master key.
    /// Any mismatch — wrong secret or tampered header — is
    /// [`MyfsError::AuthFailed`] with no distinction surfaced (spec §4.4).
    pub fn verify(&self, master_key: &Key) -> Result<()> {
        let expected = self.compute_tag(master_key);
        if crypto::constant_time_eq(&expected, &self.header_tag) {
            Ok(())
        } else {
            Err(MyfsError::AuthFailed)
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..COVERED_LEN].copy_from_slice(&self.encode_covered());
        out[54..66].copy_from_slice(&self.header_nonce);
        out[66..98].copy_from_slice(&self.header_tag);
        out[98..106].copy_from_slice(&self.table_offset.to_be_bytes());
        out[106..114].copy_from_slice(&self.table_len.to_be_bytes());
        out[114..122].copy_from_slice(&self.data_offset.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(MyfsError::InvalidInput("header too short".into()));
        }
        if bytes[0..4] != MAGIC {
            return Err(MyfsError::InvalidInput("bad magic".into()));
        }
        let version = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
        let mut volume_id = [0u8; 16];
        volume_id.copy_from_slice(&bytes[6..22]);
        let mut master_salt = [0u8; 16];
        master_salt.copy_from_slice(&bytes[22..38]);
        let memory_cost_bytes = u64::from_be_bytes(bytes[38..46].try_into().unwrap());
        let iterations = u32::from_be_bytes(bytes[46..50].try_into().unwrap());
        let parallelism = u32::from_be_bytes(bytes[50..54].try_into().unwrap());
        let mut header_nonce = [0u8; 12];
        header_nonce.copy_from_slice(&bytes[54..66]);
        let mut header_tag = [0u8; 32];
        header_tag.copy_from_slice(&bytes[66..98]);
        let table_offset = u64::from_be_bytes(bytes[98..106].try_into().unwrap());
        let table_len = u64::from_be_bytes(bytes[106..114].try_into().unwrap());
        let data_offset = u64::from_be_bytes(bytes[114..122].try_into().unwrap());

        Ok(Header {
            version,
            volume_id,
            master_salt,
            kdf: KdfParams { memory_cost_bytes, iterations, parallelism },
            header_nonce,
            header_tag,
            table_offset,
            table_len,
            data_offset,
        })
    }

    pub fn derive_master_key(&self, master_secret: &[u8]) -> Result<Key> {
        crypto::derive_key(master_secret, &self.master_salt, labels::MASTER, self.kdf)
    }
}

/// The sidecar mirror's fixed prefix (spec §6): "the table segment
/// alone, prefixed by the volume identifier and KDF params (same
/// encoding as offsets 6..54)" — i.e. everything the container header
/// carries except magic, version and the header tag itself.
pub const SIDECAR_HEADER_LEN: usize = 48;

#[derive(Debug, Clone)]
pub struct SidecarHeader {
    pub volume_id: [u8; 16],
    pub master_salt: [u8; 16],
    pub kdf: KdfParams,
}

impl SidecarHeader {
    pub fn from_header(header: &Header) -> Self {
        SidecarHeader { volume_id: header.volume_id, master_salt: header.master_salt, kdf: header.kdf }
    }

    pub fn to_bytes(&self) -> [u8; SIDECAR_HEADER_LEN] {
        let mut out = [0u8; SIDECAR_HEADER_LEN];
        out[0..16].copy_from_slice(&self.volume_id);
        out[16..32].copy_from_slice(&self.master_salt);
        out[32..40].copy_from_slice(&self.kdf.memory_cost_bytes.to_be_bytes());
        out[40..44].copy_from_slice(&self.kdf.iterations.to_be_bytes());
        out[44..48].copy_from_slice(&self.kdf.parallelism.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SIDECAR_HEADER_LEN {
            return Err(MyfsError::InvalidInput("sidecar header too short".into()));
        }
        let mut volume_id = [0u8; 16];
        volume_id.copy_from_slice(&bytes[0..16]);
        let mut master_salt = [0u8; 16];
        master_salt.copy_from_slice(&bytes[16..32]);
        let memory_cost_bytes = u64::from_be_bytes(bytes[32..40].try_into().unwrap());
        let iterations = u32::from_be_bytes(bytes[40..44].try_into().unwrap());
        let parallelism = u32::from_be_bytes(bytes[44..48].try_into().unwrap());
        Ok(SidecarHeader { volume_id, master_salt, kdf: KdfParams { memory_cost_bytes, iterations, parallelism } })
    }

    pub fn derive_master_key(&self, master_secret: &[u8]) -> Result<Key> {
        crypto::derive_key(master_secret, &self.master_salt, labels::MASTER, self.kdf)
    }

    /// Rebuild a full container header from this sidecar prefix, with a
    /// fresh table/data layout. Caller must [`Header::seal`] it before
    /// writing to disk.
    pub fn reconstruct_header(&self) -> Header {
        Header::new(self.volume_id, self.master_salt, self.kdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut hdr = Header::new(crypto::random_array::<16>(), crypto::random_array::<16>(), KdfParams::DEFAULT);
        let key = hdr.derive_master_key(b"hunter2").unwrap();
        hdr.seal(&key);
        hdr.table_offset = 500;
        hdr.table_len = 42;
        hdr.data_offset = 600;

        let bytes = hdr.to_bytes();
        let back = Header::from_bytes(&bytes).unwrap();
        assert_eq!(back.volume_id, hdr.volume_id);
        assert_eq!(back.table_offset, 500);
        assert!(back.verify(&key).is_ok());
    }

    #[test]
    fn wrong_master_secret_fails_verify() {
        let mut hdr = Header::new(crypto::random_array::<16>(), crypto::random_array::<16>(), KdfParams::DEFAULT);
        let key = hdr.derive_master_key(b"hunter2").unwrap();
        hdr.seal(&key);
        let wrong_key = hdr.derive_master_key(b"wrong").unwrap();
        assert!(hdr.verify(&wrong_key).is_err());
    }

    #[test]
    fn tampered_header_fails_verify() {
        let mut hdr = Header::new(crypto::random_array::<16>(), crypto::random_array::<16>(), KdfParams::DEFAULT);
        let key = hdr.derive_master_key(b"hunter2").unwrap();
        hdr.seal(&key);
        hdr.master_salt[0] ^= 1;
        assert!(hdr.verify(&key).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(b"NOPE");
        assert!(Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn sidecar_header_round_trips_and_derives_same_key() {
        let hdr = Header::new(crypto::random_array::<16>(), crypto::random_array::<16>(), KdfParams::DEFAULT);
        let sidecar = SidecarHeader::from_header(&hdr);
        let bytes = sidecar.to_bytes();
        let back = SidecarHeader::from_bytes(&bytes).unwrap();
        let k1 = hdr.derive_master_key(b"hunter2").unwrap();
        let k2 = back.derive_master_key(b"hunter2").unwrap();
        assert_eq!(k1.expose(), k2.expose());
    }
}
