// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// service. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CmsError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Peer evicted: {0}")]
    PeerEvicted(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No export matches the path")]
    PathUnknown,

    #[error("No servers have access to the file")]
    NoServers,

    #[error("Busy; retry in {0} seconds")]
    Busy(u32),

    #[error("{1}")]
    FsError(i32, String),

    #[error("Request rejected by policy")]
    PolicyReject,

    #[error("Subscriber table full")]
    Overflow,

    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CmsError {
    /// Creates an `FsError` from an OS errno, carrying its strerror text.
    pub fn from_errno(errno: i32) -> Self {
        let msg = std::io::Error::from_raw_os_error(errno).to_string();
        CmsError::FsError(errno, msg)
    }

    /// The errno carried by wire error replies. `NoServers` and
    /// `PathUnknown` report as ENOENT per the protocol; unmapped kinds
    /// report as EINVAL.
    pub fn wire_errno(&self) -> u32 {
        match self {
            CmsError::FsError(errno, _) => *errno as u32,
            CmsError::PathUnknown | CmsError::NoServers => libc::ENOENT as u32,
            CmsError::Overflow => libc::EMFILE as u32,
            CmsError::Timeout => libc::ETIMEDOUT as u32,
            CmsError::Busy(_) => libc::EBUSY as u32,
            _ => libc::EINVAL as u32,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for CmsError {
    fn clone(&self) -> Self {
        match self {
            CmsError::Io(e) => CmsError::Io(Arc::clone(e)),
            CmsError::IncompleteData => CmsError::IncompleteData,
            CmsError::TransportLost(s) => CmsError::TransportLost(s.clone()),
            CmsError::PeerEvicted(s) => CmsError::PeerEvicted(s.clone()),
            CmsError::BadRequest(s) => CmsError::BadRequest(s.clone()),
            CmsError::PathUnknown => CmsError::PathUnknown,
            CmsError::NoServers => CmsError::NoServers,
            CmsError::Busy(d) => CmsError::Busy(*d),
            CmsError::FsError(e, s) => CmsError::FsError(*e, s.clone()),
            CmsError::PolicyReject => CmsError::PolicyReject,
            CmsError::Overflow => CmsError::Overflow,
            CmsError::Timeout => CmsError::Timeout,
            CmsError::Config(s) => CmsError::Config(s.clone()),
            CmsError::Internal(s) => CmsError::Internal(s.clone()),
        }
    }
}

impl PartialEq for CmsError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CmsError::Io(e1), CmsError::Io(e2)) => e1.to_string() == e2.to_string(),
            (CmsError::TransportLost(a), CmsError::TransportLost(b)) => a == b,
            (CmsError::PeerEvicted(a), CmsError::PeerEvicted(b)) => a == b,
            (CmsError::BadRequest(a), CmsError::BadRequest(b)) => a == b,
            (CmsError::Busy(a), CmsError::Busy(b)) => a == b,
            (CmsError::FsError(a, _), CmsError::FsError(b, _)) => a == b,
            (CmsError::Config(a), CmsError::Config(b)) => a == b,
            (CmsError::Internal(a), CmsError::Internal(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for CmsError {
    fn from(e: std::io::Error) -> Self {
        CmsError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for CmsError {
    fn from(_: std::str::Utf8Error) -> Self {
        CmsError::BadRequest("payload is not valid UTF-8".to_string())
    }
}

impl From<std::string::FromUtf8Error> for CmsError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        CmsError::BadRequest("payload is not valid UTF-8".to_string())
    }
}
