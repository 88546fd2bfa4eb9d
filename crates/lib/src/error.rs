//! Typed failures callers may want to match on.

/// Errors from stage1 placement which are meaningful to callers.
///
/// Everything else (I/O, malformed inventory data) is carried as a
/// plain [`anyhow::Error`] with context attached.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Stage1Error {
    /// A device reference (kernel name or persistent alias) matched nothing
    /// in the storage inventory.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    /// The architecture has no defined placement rules.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    /// No legal stage1 location exists for this system.
    #[error("No usable stage1 location: {0}")]
    NoBootLocation(String),
    /// A restore was requested but no boot record backup exists.
    #[error("No boot record backup exists for {0}")]
    BackupMissing(String),
}
