use thiserror::Error;

/// Exhaustive error taxonomy for the core (spec §7).
///
/// Cryptographic failures never distinguish causes at the boundary:
/// a wrong secret and a tampered ciphertext both collapse to
/// [`MyfsError::AuthFailed`] or [`MyfsError::IntegrityFailed`]
/// depending on which layer caught the failure. Callers that need more
/// detail should watch the `tracing` output instead.
#[derive(Debug, Error)]
pub enum MyfsError {
    /// Session secret, master secret, file secret, or machine binding rejected.
    #[error("authentication failed")]
    AuthFailed,

    /// Named entry absent, or SoftDeleted when caller requested Active.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Import/Recover would create a duplicate Active display name.
    #[error("name already in use: {0}")]
    NameTaken(String),

    /// AEAD open failed, or a content digest mismatch on a specific entry.
    #[error("integrity check failed for {name}")]
    IntegrityFailed {
        name: String,
    },

    /// Table AEAD open failed on both container and sidecar.
    #[error("file table is corrupt")]
    TableCorrupt,

    /// Repair cannot proceed — both headers are corrupt.
    #[error("volume is unrecoverable")]
    Unrecoverable,

    /// Another process holds the container lock.
    #[error("container is locked by another process")]
    Locked,

    /// Lower-level read/write failure. Partial commits are rolled back by truncation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller passed a value that cannot possibly be valid (e.g. an
    /// out-of-range locator, a malformed path). Not part of the §7
    /// taxonomy proper but needed to keep internal invariants total.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, MyfsError>;
