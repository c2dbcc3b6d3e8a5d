//! Pre-authenticated encoding (PAE) — builds the associated data that
//! binds every sealed blob to its logical role and volume identity
//! (spec §4.2: "Associated data binds each ciphertext to its logical role").
//!
//! `AAD = "MFS-PAE\x01" || Σ ( u64_be(len_i) || item_i )`, the same
//! length-prefixed shape as the teacher's `qsfs-core::pae` module.

const PAE_TAG: &[u8] = b"MFS-PAE\x01";

fn build(items: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PAE_TAG.len() + items.iter().map(|i| 8 + i.len()).sum::<usize>());
    out.extend_from_slice(PAE_TAG);
    for item in items {
        out.extend_from_slice(&(item.len() as u64).to_be_bytes());
        out.extend_from_slice(item);
    }
    out
}

/// AAD for the header integrity tag: role, volume id, the plaintext
/// header bytes being authenticated.
pub fn header_aad(volume_id: &[u8; 16], header_bytes: &[u8]) -> Vec<u8> {
    build(&[b"mfs/header/v1", volume_id, header_bytes])
}

/// AAD for a sealed file-table segment (spec §4.5): role, volume id.
pub fn table_aad(volume_id: &[u8; 16]) -> Vec<u8> {
    build(&[b"mfs/table", volume_id])
}

/// AAD for a sealed file payload (spec §4.7): role, volume id, entry id.
pub fn payload_aad(volume_id: &[u8; 16], entry_id: u64) -> Vec<u8> {
    build(&[b"mfs/file", volume_id, &entry_id.to_be_bytes()])
}

/// AAD for a wrapped per-file key (spec §4.7's "wrapped-file-key").
pub fn wrap_aad(volume_id: &[u8; 16], entry_id: u64) -> Vec<u8> {
    build(&[b"mfs/file/wrap", volume_id, &entry_id.to_be_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_roles_produce_distinct_aad() {
        let vol = [1u8; 16];
        assert_ne!(table_aad(&vol), payload_aad(&vol, 1));
        assert_ne!(payload_aad(&vol, 1), payload_aad(&vol, 2));
        assert_ne!(payload_aad(&vol, 1), wrap_aad(&vol, 1));
    }

    #[test]
    fn deterministic() {
        let vol = [9u8; 16];
        assert_eq!(table_aad(&vol), table_aad(&vol));
    }
}
