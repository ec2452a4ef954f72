//! Contains the `Error` and `Result` types that this crate uses.

use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::verify::CertStatus;

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate. The inner [`ErrorKind`] is boxed to keep `Error` small
/// to pass around; a cloned cause is kept behind an `Arc` so errors remain cheaply `Clone` across
/// the boundary between the certificate verifier's worker and its origin task.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    #[source]
    pub(crate) source: Option<Arc<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            source: None,
        }
    }

    pub(crate) fn with_source(kind: ErrorKind, source: Error) -> Self {
        Self {
            kind: Box::new(kind),
            source: Some(Arc::new(source)),
        }
    }

    /// Returns the [`ErrorKind`] describing what went wrong.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }

    pub(crate) fn network(kind: NetworkErrorKind) -> Self {
        Self::new(ErrorKind::Network(kind))
    }

    pub(crate) fn tls(kind: TlsErrorKind) -> Self {
        Self::new(ErrorKind::Tls(kind))
    }

    pub(crate) fn no_dns_results(destination: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Network(NetworkErrorKind::AddressInvalid(
            destination.to_string(),
        )))
    }

    /// Classifies this error into the "try next address" bucket used by the plaintext stream's
    /// connect fallback (§4.2), vs. one that should be surfaced immediately.
    pub(crate) fn is_try_next(&self) -> bool {
        matches!(
            &*self.kind,
            ErrorKind::Network(
                NetworkErrorKind::AddressUnreachable
                    | NetworkErrorKind::ConnectionRefused
                    | NetworkErrorKind::TimedOut
                    | NetworkErrorKind::AddressInvalid(_)
            )
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NetworkErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NetworkErrorKind::ConnectionAborted,
            io::ErrorKind::TimedOut => NetworkErrorKind::TimedOut,
            io::ErrorKind::NotConnected => NetworkErrorKind::ConnectionClosed,
            _ => return Self::new(ErrorKind::Io(Arc::new(err))),
        };
        Self::new(ErrorKind::Network(kind))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        use rustls::Error as R;
        let kind = match err {
            R::CorruptMessage | R::General(_) => TlsErrorKind::ProtocolError,
            R::NoCertificatesPresented => TlsErrorKind::ClientAuthCertNeeded,
            R::InvalidCertificate(_) => TlsErrorKind::BadClientAuthCert,
            R::PeerIncompatible(_) | R::NoApplicationProtocol => {
                TlsErrorKind::VersionOrCipherMismatch
            }
            _ => TlsErrorKind::ProtocolError,
        };
        Self::with_source(
            ErrorKind::Tls(kind),
            Self::internal(err.to_string()),
        )
    }
}

/// The category of error that occurred, per the taxonomy in §6 of the design.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A network-level transport error.
    #[error("network error: {0}")]
    Network(#[from] NetworkErrorKind),

    /// A TLS protocol-level error.
    #[error("tls error: {0}")]
    Tls(#[from] TlsErrorKind),

    /// The peer's certificate chain failed validation. Carries the full bitmask so callers can
    /// inspect exactly which checks failed.
    #[error("certificate verification failed: {status:?}")]
    Certificate { status: CertStatus },

    /// An error that does not fit the taxonomy above; carries a human-readable message.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// A lower-level I/O error that the network taxonomy above does not name explicitly (e.g.
    /// resolver failures).
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

/// Network-level errors surfaced by the plaintext stream and the connection pool.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum NetworkErrorKind {
    #[error("the internet connection appears to be disconnected")]
    InternetDisconnected,
    #[error("operation timed out")]
    TimedOut,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("address unreachable")]
    AddressUnreachable,
    #[error("address invalid: {0}")]
    AddressInvalid(String),
}

/// TLS-level errors surfaced by the TLS stream's driver loop.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TlsErrorKind {
    #[error("tls protocol error")]
    ProtocolError,
    #[error("no mutually supported protocol version or cipher suite")]
    VersionOrCipherMismatch,
    #[error("no ssl/tls versions enabled in configuration")]
    NoSslVersionsEnabled,
    #[error("bad client authentication certificate")]
    BadClientAuthCert,
    #[error("server requires a client authentication certificate")]
    ClientAuthCertNeeded,
    #[error("peer requested renegotiation, which is not supported")]
    RenegotiationRequested,
}
