//! Error types surfaced by store operations.

use thiserror::Error;

/// Errors returned by store clients, processors, and storage engines.
///
/// RPC and connection failures are never surfaced through this type; they
/// are logged, close the affected connection, and become observable only
/// through change listeners once connectivity recovers.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation on a store name that was never registered.
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// A write whose clock is before or equal to every existing version.
    /// The caller must re-read and retry with the current version.
    #[error("obsolete write")]
    ObsoleteVersion,

    /// The inconsistency resolver reduced an antichain to something other
    /// than exactly one value.
    #[error("inconsistent data for {store}: {remaining} remaining")]
    InconsistentData { store: String, remaining: usize },

    /// Encode or decode failure from a key/value serializer.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure reported by a storage backend.
    #[error("storage error: {0}")]
    Storage(String),

    /// The context is missing required local configuration.
    #[error("local node not configured")]
    NotConfigured,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
