use thiserror::Error;

use crate::cni::schema::ErrorCode;

/// The plugin's unified error type. Every lower-level error (store, netlink,
/// nftables, namespace, I/O) is flattened into one of these variants at the
/// orchestrator boundary, per the CNI error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed network configuration: {0}")]
    Config(String),

    #[error("no free address in range for container {container_id}")]
    AllocationExhausted { container_id: String },

    #[error("address offset out of range for this prefix's address family")]
    AddressOutOfRange,

    #[error("store busy after waiting for lock")]
    StoreBusy,

    #[error("store constraint violated: {0}")]
    StoreConstraint(String),

    #[error("store i/o error")]
    StoreIo(#[from] rusqlite::Error),

    #[error("netlink error: {context}")]
    Netlink {
        context: String,
        #[source]
        error: rtnetlink::Error,
    },

    #[error("nftables error: {0}")]
    Nftables(String),

    #[error("network namespace not found: {0}")]
    NamespaceMissing(String),

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("system error: {context}")]
    System {
        context: String,
        #[source]
        error: nix::Error,
    },
}

impl Error {
    /// Map this error onto the CNI well-known error code space. Codes 100
    /// and above are the plugin-specific range the CNI spec reserves for
    /// implementations (`ErrorCode::Plugin`).
    pub fn cni_code(&self) -> ErrorCode {
        match self {
            Error::Config(_) => ErrorCode::InvalidNetworkConfiguration,
            Error::AllocationExhausted { .. } => ErrorCode::Plugin(101),
            Error::AddressOutOfRange => ErrorCode::Plugin(107),
            Error::StoreBusy => ErrorCode::Transient,
            Error::StoreConstraint(_) => ErrorCode::Plugin(102),
            Error::StoreIo(_) => ErrorCode::Io,
            Error::Netlink { .. } => ErrorCode::Plugin(103),
            Error::Nftables(_) => ErrorCode::Plugin(104),
            Error::NamespaceMissing(_) => ErrorCode::Plugin(105),
            Error::Io { .. } => ErrorCode::Io,
            Error::System { .. } => ErrorCode::Plugin(106),
        }
    }

    /// True if this failure happened while tearing something down; those
    /// are logged but never cause DEL to fail, since DEL must be idempotent.
    pub fn is_benign_on_delete(&self) -> bool {
        matches!(self, Error::NamespaceMissing(_))
    }
}
