//! L5 — volume lifecycle: Format, Open, Commit, Repair (spec §4.6).
//!
//! The file table and the data region are buffered entirely in memory
//! while a volume is open (spec §4.1: "writes to the container are
//! buffered until commit"); [`Volume::commit`] is the only place that
//! touches the container file, always in header-then-table-then-data
//! order, followed by an fsync'd mirror write to the sidecar.

use std::path::{Path, PathBuf};

use crate::crypto::{self, KdfParams, Key};
use crate::error::{MyfsError, Result};
use crate::header::{Header, SidecarHeader, HEADER_LEN, SIDECAR_HEADER_LEN};
use crate::io::ByteIo;
use crate::machine::{BindingRecord, MachineIdentity};
use crate::pae;
use crate::session::{Session, SessionState};
use crate::table::{FileTable, Locator};

/// The three files that make up a volume on disk (spec §6): the
/// container, its sidecar mirror, and the machine binding record.
#[derive(Debug, Clone)]
pub struct VolumePaths {
    pub container: PathBuf,
    pub sidecar: PathBuf,
    pub binding: PathBuf,
}

impl VolumePaths {
    pub fn new(container: impl AsRef<Path>, sidecar: impl AsRef<Path>, binding: impl AsRef<Path>) -> Self {
        VolumePaths {
            container: container.as_ref().to_path_buf(),
            sidecar: sidecar.as_ref().to_path_buf(),
            binding: binding.as_ref().to_path_buf(),
        }
    }
}

/// Surfaced by [`Volume::open`] when the container's own table failed
/// to verify and the sidecar mirror had to stand in for it (spec §4.6,
/// scenario 5).
#[derive(Debug, Clone, Default)]
pub struct OpenReport {
    pub repaired: bool,
    pub warning: Option<String>,
}

pub struct Volume {
    paths: VolumePaths,
    container: ByteIo,
    sidecar: ByteIo,
    header: Header,
    table: FileTable,
    master_key: Key,
    /// In-memory mirror of the data region; flushed to `container` by `commit`.
    data: Vec<u8>,
}

fn seal_table(table: &FileTable, volume_id: &[u8; 16], master_key: &Key) -> Result<Vec<u8>> {
    let plaintext = table.save()?;
    let nonce = crypto::random_nonce();
    let aad = pae::table_aad(volume_id);
    let ciphertext = crypto::seal(master_key, &nonce, &aad, &plaintext)?;
    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_table(sealed: &[u8], volume_id: &[u8; 16], master_key: &Key) -> Result<FileTable> {
    if sealed.len() < crypto::NONCE_LEN {
        return Err(MyfsError::TableCorrupt);
    }
    let nonce: [u8; crypto::NONCE_LEN] = sealed[..crypto::NONCE_LEN].try_into().unwrap();
    let aad = pae::table_aad(volume_id);
    let plaintext =
        crypto::open(master_key, &nonce, &aad, &sealed[crypto::NONCE_LEN..]).map_err(|_| MyfsError::TableCorrupt)?;
    FileTable::load(&plaintext)
}

fn encode_sidecar(header: &Header, sealed_table: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SIDECAR_HEADER_LEN + sealed_table.len());
    out.extend_from_slice(&SidecarHeader::from_header(header).to_bytes());
    out.extend_from_slice(sealed_table);
    out
}

/// Rebuild a header, master key and table entirely from the sidecar
/// mirror, laying the table out immediately after the fixed header the
/// way `commit` always does (spec §4.6 Repair). Returns the sealed
/// table bytes too, so the caller can write them straight back to the
/// container without re-sealing.
fn repair_from_sidecar(sidecar_path: &Path, master_secret: &[u8]) -> Result<(Header, Key, FileTable, Vec<u8>)> {
    let mut sidecar = ByteIo::open(sidecar_path)?;
    let len = sidecar.len()?;
    if len <= SIDECAR_HEADER_LEN as u64 {
        return Err(MyfsError::Unrecoverable);
    }
    let bytes = sidecar.read_at(0, len as usize)?;
    let sidecar_header = SidecarHeader::from_bytes(&bytes[..SIDECAR_HEADER_LEN])?;
    let sealed_table = bytes[SIDECAR_HEADER_LEN..].to_vec();

    let master_key = sidecar_header.derive_master_key(master_secret).map_err(|_| MyfsError::Unrecoverable)?;
    let table =
        open_table(&sealed_table, &sidecar_header.volume_id, &master_key).map_err(|_| MyfsError::Unrecoverable)?;

    let mut header = sidecar_header.reconstruct_header();
    header.table_offset = HEADER_LEN as u64;
    header.table_len = sealed_table.len() as u64;
    header.data_offset = HEADER_LEN as u64 + sealed_table.len() as u64;
    header.seal(&master_key);

    Ok((header, master_key, table, sealed_table))
}

/// Truncate whatever `Format` managed to create before it failed (spec
/// §4.6: "Any failure after partial writes truncates all created
/// files."). Best-effort: a file that was never created is left alone.
fn cleanup_partial_format(paths: &VolumePaths) {
    for path in [&paths.container, &paths.sidecar, &paths.binding] {
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
            let _ = file.set_len(0);
        }
    }
}

impl Volume {
    /// Create a brand-new volume: fresh volume id and master salt, an
    /// empty table, an empty data region, and a binding record for
    /// `identity` (spec §4.6 Format). Fails if any of the three files
    /// already exist. Any failure after partial writes truncates every
    /// file this call created, rather than leaving a half-formatted
    /// volume on disk.
    pub fn format(
        paths: VolumePaths,
        master_secret: &[u8],
        kdf: KdfParams,
        identity: &MachineIdentity,
    ) -> Result<Volume> {
        match Self::format_inner(&paths, master_secret, kdf, identity) {
            Ok(volume) => Ok(volume),
            Err(err) => {
                cleanup_partial_format(&paths);
                Err(err)
            }
        }
    }

    fn format_inner(
        paths: &VolumePaths,
        master_secret: &[u8],
        kdf: KdfParams,
        identity: &MachineIdentity,
    ) -> Result<Volume> {
        let volume_id = crypto::random_array::<16>();
        let master_salt = crypto::random_array::<16>();
        let mut header = Header::new(volume_id, master_salt, kdf);
        let master_key = header.derive_master_key(master_secret)?;
        header.seal(&master_key);

        let table = FileTable::new();
        let sealed_table = seal_table(&table, &volume_id, &master_key)?;
        header.table_offset = HEADER_LEN as u64;
        header.table_len = sealed_table.len() as u64;
        header.data_offset = HEADER_LEN as u64 + sealed_table.len() as u64;

        let mut container = ByteIo::create_new(&paths.container)?;
        container.lock_exclusive()?;
        container.write_at(0, &header.to_bytes())?;
        container.write_at(header.table_offset, &sealed_table)?;
        container.truncate(header.data_offset)?;
        container.commit()?;

        let mut sidecar = ByteIo::create_new(&paths.sidecar)?;
        let sidecar_bytes = encode_sidecar(&header, &sealed_table);
        sidecar.write_at(0, &sidecar_bytes)?;
        sidecar.truncate(sidecar_bytes.len() as u64)?;
        sidecar.commit()?;

        let binding = BindingRecord::compute(identity, volume_id, kdf)?;
        binding.save_to_file(&paths.binding)?;

        tracing::info!(path = %paths.container.display(), "volume formatted");

        Ok(Volume { paths: paths.clone(), container, sidecar, header, table, master_key, data: Vec::new() })
    }

    /// Open an existing volume (spec §4.6 Open): verify the header
    /// tag under the candidate master secret, verify the machine
    /// binding, load the table, and fall back to the sidecar mirror if
    /// the container's own table (or header) doesn't check out.
    /// Requires `session` to already be in `SessionOpen`; on success it
    /// advances to `VolumeOpen`.
    pub fn open(
        paths: VolumePaths,
        session: &mut Session,
        master_secret: &[u8],
        identity: &MachineIdentity,
    ) -> Result<(Volume, OpenReport)> {
        if session.state() != SessionState::SessionOpen {
            return Err(MyfsError::InvalidInput("session must be open before a volume can be attached".into()));
        }

        let mut container = ByteIo::open(&paths.container)?;
        container.lock_exclusive()?;
        let container_len = container.len()?;

        // A wrong master secret must surface as `AuthFailed` directly,
        // never trigger a sidecar rebuild — repair is only for a
        // structurally corrupt header or a table that fails to
        // authenticate *under a header that already verified* (spec
        // §4.6 Repair's two bullets, both conditioned on the secret
        // being right).
        let header_bytes = if container_len >= HEADER_LEN as u64 { container.read_at(0, HEADER_LEN).ok() } else { None };
        let header_parsed = header_bytes.as_deref().and_then(|b| Header::from_bytes(b).ok());

        let mut repaired = false;
        let mut warning = None;

        let (header, master_key, table, data) = match header_parsed {
            Some(header) => {
                let master_key = header.derive_master_key(master_secret)?;
                header.verify(&master_key)?;

                let table_opened = container
                    .read_at(header.table_offset, header.table_len as usize)
                    .ok()
                    .and_then(|bytes| open_table(&bytes, &header.volume_id, &master_key).ok());

                match table_opened {
                    Some(table) => {
                        let data_len = container_len.saturating_sub(header.data_offset);
                        let data = if data_len > 0 { container.read_at(header.data_offset, data_len as usize)? } else { Vec::new() };
                        (header, master_key, table, data)
                    }
                    None => {
                        tracing::warn!(path = %paths.container.display(), "container table failed to authenticate, attempting sidecar repair");
                        let (header, master_key, table, sealed_table) = repair_from_sidecar(&paths.sidecar, master_secret)?;
                        container.write_at(0, &header.to_bytes())?;
                        container.write_at(header.table_offset, &sealed_table)?;
                        container.commit()?;
                        let data_len = container_len.saturating_sub(header.data_offset);
                        let data = if data_len > 0 && header.data_offset <= container_len {
                            container.read_at(header.data_offset, data_len as usize)?
                        } else {
                            Vec::new()
                        };
                        repaired = true;
                        warning = Some("file table rebuilt from sidecar mirror (container table failed to authenticate)".to_string());
                        (header, master_key, table, data)
                    }
                }
            }
            None => {
                tracing::warn!(path = %paths.container.display(), "container header failed to parse, attempting sidecar repair");
                let (header, master_key, table, sealed_table) = repair_from_sidecar(&paths.sidecar, master_secret)?;
                container.write_at(0, &header.to_bytes())?;
                container.write_at(header.table_offset, &sealed_table)?;
                container.commit()?;
                let data_len = container_len.saturating_sub(header.data_offset);
                let data = if data_len > 0 && header.data_offset <= container_len {
                    container.read_at(header.data_offset, data_len as usize)?
                } else {
                    Vec::new()
                };
                repaired = true;
                warning = Some("header and table rebuilt from sidecar mirror (container header failed to parse)".to_string());
                (header, master_key, table, data)
            }
        };

        let binding = BindingRecord::load_from_file(&paths.binding)?;
        binding.verify(identity, header.kdf)?;

        let sidecar = ByteIo::open(&paths.sidecar)?;

        let mut volume = Volume { paths, container, sidecar, header, table, master_key, data };

        // The integrity monitor runs on every open (spec §4.8); a
        // content-digest mismatch escalates to Repair by marking the
        // affected entries PendingPurge and surfacing their names,
        // separately from the header/table repair above.
        let scan_report = crate::integrity::scan(&volume)?;
        if !scan_report.is_clean() {
            let mut lost_names = Vec::new();
            for mismatch in &scan_report.mismatches {
                if matches!(
                    mismatch.kind,
                    crate::integrity::MismatchKind::PayloadAuthFailed | crate::integrity::MismatchKind::ContentDigestMismatch
                ) && volume
                    .table_mut()
                    .transition(mismatch.entry_id, crate::table::EntryState::PendingPurge, crate::files::now_unix())
                    .is_ok()
                {
                    lost_names.push(mismatch.name.clone());
                }
            }
            if !lost_names.is_empty() {
                volume.commit()?;
                repaired = true;
                let scan_warning = format!("integrity scan marked entries for purge: {}", lost_names.join(", "));
                warning = Some(match warning {
                    Some(existing) => format!("{existing}; {scan_warning}"),
                    None => scan_warning,
                });
            }
        }

        session.mark_volume_open()?;

        tracing::info!(path = %volume.paths.container.display(), repaired, entries = volume.table.len(), "volume opened");

        Ok((volume, OpenReport { repaired, warning }))
    }

    /// Reseal the table under a fresh nonce and flush header, table and
    /// data region to the container, then mirror header+table to the
    /// sidecar. Nothing written since the last commit is durable before
    /// this returns (spec §4.1, §4.6).
    pub fn commit(&mut self) -> Result<()> {
        let sealed_table = seal_table(&self.table, &self.header.volume_id, &self.master_key)?;
        self.header.table_offset = HEADER_LEN as u64;
        self.header.table_len = sealed_table.len() as u64;
        self.header.data_offset = HEADER_LEN as u64 + sealed_table.len() as u64;

        self.container.write_at(0, &self.header.to_bytes())?;
        self.container.write_at(self.header.table_offset, &sealed_table)?;
        self.container.write_at(self.header.data_offset, &self.data)?;
        self.container.truncate(self.header.data_offset + self.data.len() as u64)?;
        self.container.commit()?;

        let sidecar_bytes = encode_sidecar(&self.header, &sealed_table);
        self.sidecar.write_at(0, &sidecar_bytes)?;
        self.sidecar.truncate(sidecar_bytes.len() as u64)?;
        self.sidecar.commit()?;

        tracing::info!(path = %self.paths.container.display(), entries = self.table.len(), "volume committed");
        Ok(())
    }

    /// Release the advisory lock and close the session (spec §4.4).
    /// Does not commit; callers must commit explicitly beforehand.
    pub fn close(mut self, session: &mut Session) {
        self.container.unlock();
        session.close();
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn volume_id(&self) -> [u8; 16] {
        self.header.volume_id
    }

    pub fn master_key(&self) -> &Key {
        &self.master_key
    }

    pub fn table(&self) -> &FileTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut FileTable {
        &mut self.table
    }

    pub fn paths(&self) -> &VolumePaths {
        &self.paths
    }

    /// Read a payload's ciphertext out of the in-memory data region.
    pub fn read_payload(&self, locator: Locator) -> Result<&[u8]> {
        let start = locator.offset as usize;
        let end = locator.end() as usize;
        self.data.get(start..end).ok_or(MyfsError::TableCorrupt)
    }

    /// Append ciphertext to the end of the in-memory data region,
    /// returning its locator. Not durable until `commit`.
    pub fn append_payload(&mut self, bytes: &[u8]) -> Locator {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        Locator { offset, length: bytes.len() as u64 }
    }

    /// Replace the data region wholesale, used after a purge/compaction
    /// rewrite plan has repacked every surviving payload (spec §4.7 Purge).
    pub fn replace_data_region(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    pub fn data_region(&self) -> &[u8] {
        &self.data
    }
}
