//! L6 — per-file operations (spec §4.7): Import, Export, Set/Change
//! file secret, Soft-delete, Recover, Hard-delete, Purge.
//!
//! Every payload is sealed under either the master key directly
//! (`Payload::Direct`) or a per-file key wrapped by the master key
//! (`Payload::Wrapped`), mirroring the teacher's `seal`/`unseal` body —
//! here retargeted from a one-shot sealed blob to an entry inside a
//! shared volume.

use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::crypto::{self, labels, Key};
use crate::error::{MyfsError, Result};
use crate::pae;
use crate::table::{EntryState, FileEntry, Locator, Payload};
use crate::volume::Volume;

/// How `Export` should format the bytes it writes out (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Decrypt fully; the destination file is the original plaintext.
    Decrypted,
    /// Write out the sealed bytes unchanged (plus the entry's own salt,
    /// for subkey-protected entries — DESIGN.md open question 1), so it
    /// can be re-imported without the volume that produced it.
    Raw,
}

/// Recover the key that seals an entry's payload, given whatever file
/// secret the caller supplied. A protected entry's file key is derived
/// deterministically from the secret and the entry's own salt, so this
/// never needs to touch the stored `wrapped_key` — that field exists
/// only so the master secret alone can recover the same key later
/// (see `unwrap_file_key`).
fn resolve_payload_key(master_key: &Key, entry: &FileEntry, file_secret: Option<&str>) -> Result<Key> {
    match (&entry.payload, file_secret) {
        (Payload::Direct, _) => Ok(master_key.clone()),
        (Payload::Wrapped { .. }, Some(secret)) => {
            crypto::derive_key(secret.as_bytes(), &entry.salt, labels::FILE, crypto::KdfParams::DEFAULT)
        }
        (Payload::Wrapped { .. }, None) => Err(MyfsError::AuthFailed),
    }
}

/// Recover a protected entry's file key from the master key alone, by
/// unwrapping `wrapped_key` (spec §4.7: Import "wraps the file key
/// under the master key"). This is what makes the force-change form of
/// `set_file_secret` possible without ever knowing the old file secret.
fn unwrap_file_key(master_key: &Key, entry: &FileEntry, volume_id: &[u8; 16]) -> Result<Key> {
    match &entry.payload {
        Payload::Direct => Ok(master_key.clone()),
        Payload::Wrapped { wrapped_key, wrap_nonce } => {
            let aad = pae::wrap_aad(volume_id, entry.id);
            let raw = crypto::open(master_key, wrap_nonce, &aad, wrapped_key)?;
            if raw.len() != crypto::KEY_LEN {
                return Err(MyfsError::AuthFailed);
            }
            let mut bytes = [0u8; crypto::KEY_LEN];
            bytes.copy_from_slice(&raw);
            Ok(Key::from_bytes(bytes))
        }
    }
}

pub(crate) fn now_unix() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Import a local file into the volume under `name`, sealing it either
/// directly under the master key or, if `file_secret` is given, under
/// a freshly wrapped per-file key (spec §4.7 Import). Fails
/// `NameTaken` if an `Active` entry already uses `name`.
pub async fn import(volume: &mut Volume, source_path: &std::path::Path, name: &str, file_secret: Option<&str>) -> Result<u64> {
    if volume.table().find_by_name(name, false).is_some() {
        return Err(MyfsError::NameTaken(name.to_string()));
    }

    let mut plaintext = Vec::new();
    fs::File::open(source_path).await?.read_to_end(&mut plaintext).await?;
    let content_digest = crypto::content_digest(&plaintext);
    let original_size = plaintext.len() as u64;

    let id = volume.table_mut().allocate_id();
    let volume_id = volume.volume_id();
    let entry_salt = crypto::random_array::<32>();

    let (seal_key, payload) = match file_secret {
        None => (volume.master_key().clone(), Payload::Direct),
        Some(secret) => {
            let file_key = crypto::derive_key(secret.as_bytes(), &entry_salt, labels::FILE, crypto::KdfParams::DEFAULT)?;
            let wrap_nonce = crypto::random_nonce();
            let wrap_aad = pae::wrap_aad(&volume_id, id);
            let wrapped_key = crypto::seal(volume.master_key(), &wrap_nonce, &wrap_aad, file_key.expose())?;
            (file_key, Payload::Wrapped { wrapped_key, wrap_nonce })
        }
    };

    let payload_nonce = crypto::random_nonce();
    let payload_aad = pae::payload_aad(&volume_id, id);
    let ciphertext = crypto::seal(&seal_key, &payload_nonce, &payload_aad, &plaintext)?;
    let mut sealed = Vec::with_capacity(payload_nonce.len() + ciphertext.len());
    sealed.extend_from_slice(&payload_nonce);
    sealed.extend_from_slice(&ciphertext);

    let locator = volume.append_payload(&sealed);

    let entry = FileEntry {
        id,
        name: name.to_string(),
        original_size,
        ciphertext_size: locator.length,
        imported_at: now_unix(),
        salt: entry_salt,
        payload,
        content_digest,
        locator,
        state: EntryState::Active,
        deleted_at: None,
    };
    volume.table_mut().insert(entry)?;

    tracing::info!(entry = id, name, size = original_size, "file imported");
    Ok(id)
}

/// Decrypt (or pass through, in `Raw` mode) an entry's payload and
/// write it to `dest_path` (spec §4.7 Export). Works on any
/// non-purged entry, `Active` or `SoftDeleted`, so a file can be
/// recovered by export even before `Recover` flips it back to `Active`.
pub async fn export(
    volume: &Volume,
    name: &str,
    file_secret: Option<&str>,
    dest_path: &std::path::Path,
    mode: ExportMode,
) -> Result<()> {
    let entry = volume.table().find_by_name(name, true).ok_or_else(|| MyfsError::NotFound(name.to_string()))?;
    if entry.state == EntryState::PendingPurge {
        return Err(MyfsError::NotFound(name.to_string()));
    }
    let volume_id = volume.volume_id();
    let sealed = volume.read_payload(entry.locator)?;

    match mode {
        ExportMode::Raw => {
            let mut out = Vec::new();
            if entry.payload.is_protected() {
                out.extend_from_slice(&entry.salt);
            }
            out.extend_from_slice(sealed);
            fs::write(dest_path, out).await?;
        }
        ExportMode::Decrypted => {
            if sealed.len() < crypto::NONCE_LEN {
                return Err(MyfsError::IntegrityFailed { name: name.to_string() });
            }
            let nonce: [u8; crypto::NONCE_LEN] = sealed[..crypto::NONCE_LEN].try_into().unwrap();
            let key = resolve_payload_key(volume.master_key(), entry, file_secret)?;
            let aad = pae::payload_aad(&volume_id, entry.id);
            let plaintext = crypto::open(&key, &nonce, &aad, &sealed[crypto::NONCE_LEN..])
                .map_err(|_| MyfsError::IntegrityFailed { name: name.to_string() })?;
            if crypto::content_digest(&plaintext) != entry.content_digest {
                return Err(MyfsError::IntegrityFailed { name: name.to_string() });
            }
            fs::write(dest_path, plaintext).await?;
        }
    }

    tracing::info!(entry = entry.id, name, "file exported");
    Ok(())
}

/// Re-seal an entry's payload under a freshly derived per-file key
/// (spec §4.7 Set/Change file secret). Three forms, selected by
/// `(entry.payload, old_secret)`:
/// - add-secret: entry is `Direct`, `old_secret` is ignored.
/// - change-secret: entry is `Wrapped`, `old_secret` is the current
///   file secret.
/// - force-change: entry is `Wrapped`, `old_secret` is `None` — the
///   payload is unwrapped using the master secret alone, via the
///   stored `wrapped_key` (possible because Import wraps the file key
///   under the master key, not under a secret-derived key).
pub fn set_file_secret(volume: &mut Volume, name: &str, old_secret: Option<&str>, new_secret: &str) -> Result<()> {
    let volume_id = volume.volume_id();
    let master_key = volume.master_key().clone();
    let entry = volume.table().find_by_name(name, false).ok_or_else(|| MyfsError::NotFound(name.to_string()))?.clone();

    let sealed = volume.read_payload(entry.locator)?.to_vec();
    if sealed.len() < crypto::NONCE_LEN {
        return Err(MyfsError::IntegrityFailed { name: name.to_string() });
    }
    let nonce: [u8; crypto::NONCE_LEN] = sealed[..crypto::NONCE_LEN].try_into().unwrap();
    let old_key = match (&entry.payload, old_secret) {
        (Payload::Direct, _) => master_key.clone(),
        (Payload::Wrapped { .. }, Some(secret)) => resolve_payload_key(&master_key, &entry, Some(secret))?,
        (Payload::Wrapped { .. }, None) => unwrap_file_key(&master_key, &entry, &volume_id)?,
    };
    let aad = pae::payload_aad(&volume_id, entry.id);
    let plaintext =
        crypto::open(&old_key, &nonce, &aad, &sealed[crypto::NONCE_LEN..]).map_err(|_| MyfsError::AuthFailed)?;

    let new_entry_salt = crypto::random_array::<32>();
    let file_key = crypto::derive_key(new_secret.as_bytes(), &new_entry_salt, labels::FILE, crypto::KdfParams::DEFAULT)?;
    let wrap_nonce = crypto::random_nonce();
    let wrap_aad = pae::wrap_aad(&volume_id, entry.id);
    let wrapped_key = crypto::seal(&master_key, &wrap_nonce, &wrap_aad, file_key.expose())?;

    let new_payload_nonce = crypto::random_nonce();
    let ciphertext = crypto::seal(&file_key, &new_payload_nonce, &aad, &plaintext)?;
    let mut new_sealed = Vec::with_capacity(new_payload_nonce.len() + ciphertext.len());
    new_sealed.extend_from_slice(&new_payload_nonce);
    new_sealed.extend_from_slice(&ciphertext);

    let new_locator = volume.append_payload(&new_sealed);

    let stored = volume.table_mut().get_mut(entry.id).ok_or_else(|| MyfsError::NotFound(name.to_string()))?;
    stored.salt = new_entry_salt;
    stored.payload = Payload::Wrapped { wrapped_key, wrap_nonce };
    stored.ciphertext_size = new_locator.length;
    stored.locator = new_locator;

    // the superseded payload bytes at the old locator are reclaimed by the next Purge.
    tracing::info!(entry = entry.id, name, "file secret changed");
    Ok(())
}

/// `Active → SoftDeleted` (spec §3, §4.7 Soft-delete). The name
/// becomes available for a new `Import` while this entry is recoverable.
pub fn soft_delete(volume: &mut Volume, name: &str) -> Result<()> {
    let id = volume.table().find_by_name(name, false).ok_or_else(|| MyfsError::NotFound(name.to_string()))?.id;
    volume.table_mut().transition(id, EntryState::SoftDeleted, now_unix())?;
    tracing::info!(entry = id, name, "file soft-deleted");
    Ok(())
}

/// `SoftDeleted → Active` (spec §4.7 Recover). Fails `NameTaken` if
/// another `Active` entry has since claimed the same name.
pub fn recover(volume: &mut Volume, name: &str) -> Result<()> {
    let id = volume
        .table()
        .find_by_name(name, true)
        .filter(|e| e.state == EntryState::SoftDeleted)
        .ok_or_else(|| MyfsError::NotFound(name.to_string()))?
        .id;
    volume.table_mut().transition(id, EntryState::Active, now_unix())?;
    tracing::info!(entry = id, name, "file recovered");
    Ok(())
}

/// `{Active,SoftDeleted} → PendingPurge` (spec §4.7 Hard-delete). The
/// entry and its payload bytes remain on disk, unreachable by name,
/// until the next `Purge` reclaims the space.
pub fn hard_delete(volume: &mut Volume, name: &str) -> Result<()> {
    let id = volume.table().find_by_name(name, true).ok_or_else(|| MyfsError::NotFound(name.to_string()))?.id;
    volume.table_mut().transition(id, EntryState::PendingPurge, now_unix())?;
    tracing::info!(entry = id, name, "file hard-deleted");
    Ok(())
}

/// Repack the data region, dropping every `PendingPurge` entry and
/// compacting the survivors' locators in id order (spec §4.5
/// `compact()`, §4.7 Purge). Returns the number of entries reclaimed.
pub fn purge(volume: &mut Volume) -> Result<usize> {
    let plan = volume.table().compact_plan();
    let reclaimed = volume.table().iter().filter(|e| e.state == EntryState::PendingPurge).count();

    let old_data = volume.data_region().to_vec();
    let mut new_data = vec![0u8; old_data.len()];
    let mut new_len = 0usize;
    let surviving: Vec<(u64, Locator)> = volume
        .table()
        .iter()
        .filter(|e| e.state != EntryState::PendingPurge)
        .map(|e| (e.id, e.locator))
        .collect();
    let mut cursor = 0u64;
    for (id, old_locator) in &surviving {
        let step = plan.iter().find(|s| s.id == *id);
        let new_locator = step.map(|s| s.new_locator).unwrap_or(Locator { offset: cursor, length: old_locator.length });
        let start = old_locator.offset as usize;
        let end = old_locator.end() as usize;
        new_data[new_locator.offset as usize..new_locator.end() as usize].copy_from_slice(&old_data[start..end]);
        new_len = new_len.max(new_locator.end() as usize);
        cursor += old_locator.length;
    }
    new_data.truncate(new_len);

    volume.table_mut().apply_compaction(&plan);
    volume.replace_data_region(new_data);

    tracing::info!(reclaimed, "purge compacted data region");
    Ok(reclaimed)
}
