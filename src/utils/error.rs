//! Error types for calls to external services
//!
//! Outbound calls to the AI provider, Reddit and the collaborator API fail in
//! two broad ways: transiently (a reset connection, a timeout, a 5xx or a 429)
//! or permanently (validation failures, other 4xx). [`Transient`] exposes the
//! facts needed to tell them apart and [`is_retryable_error`] applies the
//! classification rule.

use std::fmt;
use std::io;
use thiserror::Error;

/// Low-level network failure codes that are always worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkCode {
    /// Peer reset the connection (ECONNRESET)
    ConnectionReset,
    /// Operation timed out (ETIMEDOUT)
    TimedOut,
    /// Host name could not be resolved (ENOTFOUND)
    HostNotFound,
    /// Peer refused the connection (ECONNREFUSED)
    ConnectionRefused,
}

impl NetworkCode {
    /// Conventional errno-style name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionReset => "ECONNRESET",
            Self::TimedOut => "ETIMEDOUT",
            Self::HostNotFound => "ENOTFOUND",
            Self::ConnectionRefused => "ECONNREFUSED",
        }
    }

    /// Map an I/O error kind onto a network code, if it is one
    pub fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Some(Self::ConnectionReset)
            }
            io::ErrorKind::TimedOut => Some(Self::TimedOut),
            io::ErrorKind::ConnectionRefused => Some(Self::ConnectionRefused),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by calls to external services
#[derive(Error, Debug)]
pub enum ExternalError {
    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status from a service
    #[error("{service} responded with HTTP {status}")]
    Status { service: String, status: u16 },

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Network-level failure
    #[error("Network error: {0}")]
    Network(NetworkCode),

    /// Request was rejected as invalid and must not be repeated
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl ExternalError {
    /// Create a status error for a service
    pub fn status(service: impl Into<String>, status: u16) -> Self {
        Self::Status {
            service: service.into(),
            status,
        }
    }
}

/// Facts about an error that decide whether a retry can help
///
/// Both methods default to `None`, so an implementation only needs to report
/// what its error type actually carries.
pub trait Transient {
    /// Network failure code carried by the error
    fn network_code(&self) -> Option<NetworkCode> {
        None
    }

    /// HTTP status carried by the error
    fn http_status(&self) -> Option<u16> {
        None
    }
}

/// Classify an error as retryable
///
/// Retryable: any [`NetworkCode`], HTTP 429 and HTTP 500-599.
/// Everything else (other 4xx, validation and programming errors) is not.
pub fn is_retryable_error<E: Transient + ?Sized>(error: &E) -> bool {
    if error.network_code().is_some() {
        return true;
    }

    matches!(error.http_status(), Some(429) | Some(500..=599))
}

impl Transient for ExternalError {
    fn network_code(&self) -> Option<NetworkCode> {
        match self {
            Self::Network(code) => Some(*code),
            Self::Http(e) => e.network_code(),
            _ => None,
        }
    }

    fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::RateLimited => Some(429),
            Self::Http(e) => e.http_status(),
            _ => None,
        }
    }
}

impl Transient for reqwest::Error {
    fn network_code(&self) -> Option<NetworkCode> {
        if self.is_timeout() {
            return Some(NetworkCode::TimedOut);
        }

        // Walk the source chain looking for the underlying socket error
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if let Some(code) = NetworkCode::from_io_kind(io_err.kind()) {
                    return Some(code);
                }
            }
            source = std::error::Error::source(err);
        }

        if self.is_connect() {
            return Some(NetworkCode::ConnectionRefused);
        }

        None
    }

    fn http_status(&self) -> Option<u16> {
        self.status().map(|s| s.as_u16())
    }
}

impl Transient for io::Error {
    fn network_code(&self) -> Option<NetworkCode> {
        NetworkCode::from_io_kind(self.kind())
    }
}

impl Transient for anyhow::Error {
    fn network_code(&self) -> Option<NetworkCode> {
        self.chain().find_map(|cause| {
            if let Some(e) = cause.downcast_ref::<ExternalError>() {
                e.network_code()
            } else if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
                e.network_code()
            } else if let Some(e) = cause.downcast_ref::<io::Error>() {
                e.network_code()
            } else {
                None
            }
        })
    }

    fn http_status(&self) -> Option<u16> {
        self.chain().find_map(|cause| {
            if let Some(e) = cause.downcast_ref::<ExternalError>() {
                e.http_status()
            } else if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
                e.http_status()
            } else {
                None
            }
        })
    }
}
