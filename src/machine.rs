//! L2 — machine identity and binding (spec §4.3).
//!
//! The fingerprint is never written to the container in the clear;
//! only an HMAC keyed by a KDF of the fingerprint ever touches disk,
//! in the separate `.machine` binding record.

use std::fs;
use std::path::Path;

use crate::crypto::{self, labels, KdfParams, Key};
use crate::error::{MyfsError, Result};

const BINDING_RECORD_LEN: usize = 16 + 32;

/// Raw, caller-supplied hardware identifiers (spec §4.3, §9). Probing
/// the OS for these is a platform concern left to the caller; this
/// crate only pins the canonicalization and hashing.
#[derive(Debug, Clone)]
pub struct MachineIdentity {
    pub machine_uuid: String,
    pub primary_mac: String,
    pub cpu_identifier: String,
    pub os_name: String,
}

impl MachineIdentity {
    /// Canonicalize (lowercase, newline-joined) and hash (spec §4.3).
    pub fn fingerprint(&self) -> [u8; 32] {
        let joined = [
            self.machine_uuid.to_lowercase(),
            self.primary_mac.to_lowercase(),
            self.cpu_identifier.to_lowercase(),
            self.os_name.to_lowercase(),
        ]
        .join("\n");
        crypto::content_digest(joined.as_bytes())
    }
}

/// Witnesses that a specific host was authorized to open a volume
/// (spec §3, §6): 16 bytes volume id ‖ 32 bytes HMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRecord {
    pub volume_id: [u8; 16],
    pub tag: [u8; 32],
}

impl BindingRecord {
    fn binding_key(fingerprint: &[u8; 32], volume_id: &[u8; 16], params: KdfParams) -> Result<Key> {
        crypto::derive_key(fingerprint, volume_id, labels::MACHINE, params)
    }

    /// Compute the binding record for `volume_id` under `identity`.
    pub fn compute(identity: &MachineIdentity, volume_id: [u8; 16], params: KdfParams) -> Result<Self> {
        let fingerprint = identity.fingerprint();
        let key = Self::binding_key(&fingerprint, &volume_id, params)?;
        let tag = crypto::hmac_sha256(key.expose(), &[&volume_id]);
        Ok(BindingRecord { volume_id, tag })
    }

    /// Verify that `identity` reproduces this record's HMAC (spec P7).
    pub fn verify(&self, identity: &MachineIdentity, params: KdfParams) -> Result<()> {
        let fingerprint = identity.fingerprint();
        let key = Self::binding_key(&fingerprint, &self.volume_id, params)?;
        let expected = crypto::hmac_sha256(key.expose(), &[&self.volume_id]);
        if crypto::constant_time_eq(&expected, &self.tag) {
            Ok(())
        } else {
            Err(MyfsError::AuthFailed)
        }
    }

    pub fn to_bytes(&self) -> [u8; BINDING_RECORD_LEN] {
        let mut out = [0u8; BINDING_RECORD_LEN];
        out[..16].copy_from_slice(&self.volume_id);
        out[16..].copy_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BINDING_RECORD_LEN {
            return Err(MyfsError::InvalidInput("malformed binding record".into()));
        }
        let mut volume_id = [0u8; 16];
        let mut tag = [0u8; 32];
        volume_id.copy_from_slice(&bytes[..16]);
        tag.copy_from_slice(&bytes[16..]);
        Ok(BindingRecord { volume_id, tag })
    }

    /// Load the `.machine` sidecar. Its absence is a hard failure
    /// except during `Format`, which is the caller's job to special-case.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Persist the `.machine` sidecar with restrictive permissions.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
