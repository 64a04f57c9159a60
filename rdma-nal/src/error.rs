//! Error taxonomy for the NAL
//!
//! Every failure that can reach the RPC layer is a [`NalError`]. It is
//! `Clone` because a single failure may finalize two completion handles
//! (a GET and its reply).

use crate::fabric::FabricError;
use crate::wire::WireError;
use crate::Nid;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NalError {
    /// No free descriptor and the caller may not block
    #[error("No transmit descriptor available")]
    NoSpace,

    #[error("Host {0:#x} unreachable")]
    HostUnreachable(Nid),

    #[error("Timeout waiting for peer")]
    Timeout,

    /// The remote upper layer had nothing posted for this PUT/GET
    #[error("No match at remote node")]
    NoMatch,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large: {size} bytes, max {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Buffer can't be made contiguous: {0}")]
    Fragmented(String),

    #[error("Connection to {0:#x} closed")]
    ConnectionClosed(Nid),

    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("Invalid descriptor release: {0}")]
    BadRelease(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to spawn thread: {0}")]
    Spawn(String),

    #[error("NAL is shutting down")]
    Shutdown,
}

impl NalError {
    /// POSIX error code for RPC layers that report status as errno
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSpace => libc::ENOMEM,
            Self::HostUnreachable(_) => libc::EHOSTUNREACH,
            Self::Timeout => libc::ETIMEDOUT,
            Self::NoMatch => libc::ENOENT,
            Self::Protocol(_) => libc::EPROTO,
            Self::MessageTooLarge { .. } => libc::EMSGSIZE,
            Self::Fragmented(_) | Self::BadRelease(_) | Self::Config(_) => libc::EINVAL,
            Self::ConnectionClosed(_) => libc::ECONNABORTED,
            Self::Fabric(FabricError::NoResources) => libc::ENOMEM,
            Self::Fabric(_) => libc::EIO,
            Self::Spawn(_) => libc::EAGAIN,
            Self::Shutdown => libc::ESHUTDOWN,
        }
    }
}

impl From<WireError> for NalError {
    fn from(e: WireError) -> Self {
        NalError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NalError>;
