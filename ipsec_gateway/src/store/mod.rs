//! File-backed state: the gateway descriptor and the IPsec daemon's
//! connection and secrets files.
//!
//! These files are the only persistence the tool has. Every accessor assumes
//! a single writer; nothing here locks.

mod excise;
mod gateway;
mod ipsec;
mod template;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use excise::excise;
pub use gateway::{GatewayFile, GatewayStore};
pub use ipsec::{check_identifier, ConfigStore, DEST_KEYWORD, MANAGED_REGION_MARKER, SOURCE_KEYWORD};
pub use template::{render_template, Template, Templates, WriteMode};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while reading or editing the persisted files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The title marker of the managed region is absent
    #[error("Managed tunnel region not found in {0}")]
    ManagedRegionMissing(PathBuf),

    /// No `conn <name>` header in the managed region
    #[error("No tunnel named {0} exists")]
    TunnelNotFound(String),

    /// On-disk content does not have the shape this tool writes
    #[error("Malformed configuration in {path}: {detail}")]
    MalformedConfig { path: PathBuf, detail: String },

    /// A value would break the fixed block layout
    #[error("Invalid tunnel entry: {0}")]
    InvalidEntry(String),
}
