//! L7 — integrity monitor (spec §4.8).
//!
//! Re-verifies the header tag and, for every entry sealed directly
//! under the master key, re-opens its payload and recomputes the
//! content digest. Entries protected by a per-file secret (spec §9
//! `Payload::Wrapped`) can't be fully re-verified without that secret;
//! the monitor still confirms their locator is in-bounds and leaves
//! payload verification to the next `Export`. Every mismatch is
//! surfaced as a `tracing::error!` audit record — the log sink itself
//! is the caller's collaborator (spec §4.8, `SPEC_FULL.md` §B).

use crate::crypto;
use crate::error::Result;
use crate::pae;
use crate::table::{EntryState, Payload};
use crate::volume::Volume;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    /// The payload failed to open under the master key: wrong key or tampered ciphertext.
    PayloadAuthFailed,
    /// The payload opened, but its plaintext no longer hashes to the stored digest.
    ContentDigestMismatch,
    /// The entry's locator falls outside the current data region.
    LocatorOutOfBounds,
}

#[derive(Debug, Clone)]
pub struct Mismatch {
    pub entry_id: u64,
    pub name: String,
    pub kind: MismatchKind,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub entries_checked: usize,
    pub entries_skipped_wrapped: usize,
    pub mismatches: Vec<Mismatch>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Re-verify the header integrity tag alone (cheap, spec §4.6/§4.8).
pub fn verify_header(volume: &Volume) -> Result<()> {
    volume.header().verify(volume.master_key())
}

/// Walk every non-purged entry and re-derive what can be re-derived
/// without out-of-band secrets (spec §4.8). Never returns `Err` for a
/// per-entry problem — those accumulate in the report instead, so one
/// bad entry doesn't abort the scan of the rest.
pub fn scan(volume: &Volume) -> Result<IntegrityReport> {
    verify_header(volume)?;

    let volume_id = volume.volume_id();
    let master_key = volume.master_key();
    let mut report = IntegrityReport::default();

    for entry in volume.table().iter() {
        if entry.state == EntryState::PendingPurge {
            continue;
        }

        let sealed = match volume.read_payload(entry.locator) {
            Ok(bytes) => bytes,
            Err(_) => {
                report.mismatches.push(Mismatch {
                    entry_id: entry.id,
                    name: entry.name.clone(),
                    kind: MismatchKind::LocatorOutOfBounds,
                });
                tracing::error!(entry = entry.id, name = %entry.name, "locator out of bounds");
                continue;
            }
        };

        if entry.payload.is_protected() {
            report.entries_skipped_wrapped += 1;
            continue;
        }
        let Payload::Direct = &entry.payload else { unreachable!("checked above") };

        report.entries_checked += 1;
        if sealed.len() < crypto::NONCE_LEN {
            report.mismatches.push(Mismatch {
                entry_id: entry.id,
                name: entry.name.clone(),
                kind: MismatchKind::PayloadAuthFailed,
            });
            tracing::error!(entry = entry.id, name = %entry.name, "payload shorter than a nonce");
            continue;
        }
        let nonce: [u8; crypto::NONCE_LEN] = sealed[..crypto::NONCE_LEN].try_into().unwrap();
        let aad = pae::payload_aad(&volume_id, entry.id);
        match crypto::open(master_key, &nonce, &aad, &sealed[crypto::NONCE_LEN..]) {
            Err(_) => {
                report.mismatches.push(Mismatch {
                    entry_id: entry.id,
                    name: entry.name.clone(),
                    kind: MismatchKind::PayloadAuthFailed,
                });
                tracing::error!(entry = entry.id, name = %entry.name, "payload failed to authenticate");
            }
            Ok(plaintext) => {
                if crypto::content_digest(&plaintext) != entry.content_digest {
                    report.mismatches.push(Mismatch {
                        entry_id: entry.id,
                        name: entry.name.clone(),
                        kind: MismatchKind::ContentDigestMismatch,
                    });
                    tracing::error!(entry = entry.id, name = %entry.name, "content digest mismatch");
                }
            }
        }
    }

    report
        .mismatches
        .iter()
        .for_each(|_| tracing::warn!(clean = report.is_clean(), "integrity scan found mismatches"));

    Ok(report)
}
