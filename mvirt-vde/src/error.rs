//! Driver error types.

use std::io;
use thiserror::Error;

/// Coarse classification of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unparseable CIDR/MAC/address or malformed options.
    InvalidInput,
    /// Unknown network, endpoint or pool.
    NotFound,
    /// Already exists, already joined, network in use or down.
    Conflict,
    /// Pool has no free address.
    ResourceExhausted,
    /// A subprocess or OS interface command failed.
    ExternalFailure,
    /// The daemon is shutting down and aborted the call chain.
    Interrupted,
}

/// Errors returned by the network and IPAM drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Invalid network option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("{ip} is not in pool range {pool}")]
    OutOfRange { ip: String, pool: String },

    #[error("Network does not exist: {0}")]
    NetworkNotFound(String),

    #[error("Endpoint does not exist: {0}")]
    EndpointNotFound(String),

    #[error("Pool does not exist: {0}")]
    PoolNotFound(String),

    #[error("Network already exists: {0}")]
    NetworkExists(String),

    #[error("Endpoint already exists: {0}")]
    EndpointExists(String),

    #[error("Tap device {0} still exists for endpoint")]
    AlreadyJoined(String),

    #[error("Network still in use: {0} endpoints attached")]
    NetworkInUse(usize),

    #[error("Network switch process has exited")]
    NetworkDown,

    #[error("No free address in pool {0}")]
    NoAddress(String),

    #[error("Could not assign address {ip} from pool {pool}")]
    AddressUnavailable { ip: String, pool: String },

    #[error("Socket directory {path}: {reason}")]
    SocketDir { path: String, reason: String },

    #[error("vde_switch failed to start (exited within grace period)")]
    SwitchStartup,

    #[error("{cmd} failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("Failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Interrupted by shutdown")]
    Interrupted,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::InvalidCidr(_)
            | DriverError::InvalidAddress(_)
            | DriverError::InvalidMac(_)
            | DriverError::InvalidOption { .. }
            | DriverError::OutOfRange { .. }
            | DriverError::SocketDir { .. } => ErrorKind::InvalidInput,
            DriverError::NetworkNotFound(_)
            | DriverError::EndpointNotFound(_)
            | DriverError::PoolNotFound(_) => ErrorKind::NotFound,
            DriverError::NetworkExists(_)
            | DriverError::EndpointExists(_)
            | DriverError::AlreadyJoined(_)
            | DriverError::NetworkInUse(_)
            | DriverError::NetworkDown
            | DriverError::AddressUnavailable { .. } => ErrorKind::Conflict,
            DriverError::NoAddress(_) => ErrorKind::ResourceExhausted,
            DriverError::SwitchStartup
            | DriverError::Command { .. }
            | DriverError::Spawn { .. }
            | DriverError::Io(_) => ErrorKind::ExternalFailure,
            DriverError::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Fatal errors abort the whole call chain instead of being reported as a normal fault.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
