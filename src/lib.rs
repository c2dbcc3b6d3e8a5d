//! MyFS — a single-user encrypted virtual volume with mirrored
//! metadata and machine-bound sessions.
//!
//! Layered roughly bottom-up: [`io`] (positional byte access) under
//! [`crypto`]/[`pae`] (primitives) under [`header`]/[`table`] (on-disk
//! formats) under [`machine`]/[`session`] (authentication) under
//! [`volume`] (lifecycle) under [`files`] (per-file operations) and
//! [`integrity`] (the monitor). Callers drive a [`session::Session`]
//! through `Closed → SessionOpen → VolumeOpen`, then call [`volume`]
//! and [`files`] operations against the resulting [`volume::Volume`].

pub mod crypto;
pub mod error;
pub mod files;
pub mod header;
pub mod integrity;
pub mod io;
pub mod machine;
pub mod pae;
pub mod session;
pub mod table;
pub mod volume;

pub use error::{MyfsError, Result};
pub use files::ExportMode;
pub use machine::MachineIdentity;
pub use session::{Session, SessionState};
pub use volume::{OpenReport, Volume, VolumePaths};
