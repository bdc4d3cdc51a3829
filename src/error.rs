use crate::cert::{ChainStatus, PolicyErrors};
use crate::engine::SecurityStatus;
use crate::record::alert::AlertDescription;

#[cfg(feature = "std")]
use std::sync::Arc;

/// Logical operation an error was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Authenticate,
    Renegotiate,
    Shutdown,
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Authenticate => "authenticate",
            Operation::Renegotiate => "renegotiate",
            Operation::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Malformed record framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// First record is neither SSLv2 nor SSLv3+ framed.
    UnknownFraming,
    /// Content type byte is not a known record type.
    InvalidContentType(u8),
    /// Major version byte is not 3.
    UnsupportedVersion(u8),
    /// Declared record length exceeds the protocol maximum.
    Oversized { length: usize },
}

/// Why a handshake was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The engine reported a failure status.
    Engine,
    /// The peer sent a fatal alert.
    AlertReceived,
    /// Certificate policy rejected the remote certificate.
    CertificateRejected,
    /// The validation callback returned `false`.
    ValidationRejected,
    /// The engine could not produce a credential.
    Credential,
    /// A server stream had no certificate to present.
    MissingCertificate,
}

/// Details of a failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationError {
    pub kind: AuthFailure,
    /// Alert received from the peer, or sent to it for certificate failures.
    pub alert: Option<AlertDescription>,
    pub status: Option<SecurityStatus>,
    pub policy_errors: PolicyErrors,
    pub chain_status: ChainStatus,
}

impl AuthenticationError {
    pub fn new(kind: AuthFailure) -> Self {
        Self {
            kind,
            alert: None,
            status: None,
            policy_errors: PolicyErrors::NONE,
            chain_status: ChainStatus::NO_ERROR,
        }
    }

    pub fn engine(status: SecurityStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::new(AuthFailure::Engine)
        }
    }

    pub fn alert_received(alert: AlertDescription, status: SecurityStatus) -> Self {
        Self {
            alert: Some(alert),
            status: Some(status),
            ..Self::new(AuthFailure::AlertReceived)
        }
    }
}

impl core::fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            AuthFailure::Engine => f.write_str("handshake failed")?,
            AuthFailure::AlertReceived => f.write_str("peer aborted the handshake")?,
            AuthFailure::CertificateRejected => {
                write!(f, "remote certificate rejected ({:?})", self.policy_errors)?
            }
            AuthFailure::ValidationRejected => {
                f.write_str("remote certificate rejected by validation callback")?
            }
            AuthFailure::Credential => f.write_str("failed to acquire credential")?,
            AuthFailure::MissingCertificate => f.write_str("server certificate required")?,
        }
        if let Some(alert) = self.alert {
            write!(f, ", alert: {}", alert.message())?;
        }
        if let Some(status) = self.status {
            write!(f, ", status: {status}")?;
        }
        Ok(())
    }
}

/// Top-level crate error.
#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed or oversized record header.
    Framing(FramingError),
    /// Handshake failure, certificate rejection or received alert.
    Authentication(AuthenticationError),
    /// Underlying transport failure.
    #[cfg(feature = "std")]
    Io {
        op: Option<Operation>,
        source: Arc<std::io::Error>,
    },
    /// Transport ended in the middle of a record or handshake.
    UnexpectedEof { op: Operation },
    /// Record decryption failed.
    Decrypt(SecurityStatus),
    /// Record encryption failed.
    Encrypt(SecurityStatus),
    /// Cancelled by the caller.
    Cancelled,
    /// Another operation of the same kind is already in flight.
    NestedCall(Operation),
    /// The stream has been disposed.
    Disposed,
    /// Operation requires a completed handshake.
    NotAuthenticated,
    /// Authentication was already performed on this stream.
    AlreadyAuthenticated,
    /// Write attempted after `shutdown`.
    WriteAfterShutdown,
    /// Renegotiation requested with unread data buffered.
    RenegotiateWithUnreadData,
    /// Peer requested renegotiation and it is not allowed.
    RenegotiationNotAllowed,
    /// The engine cannot renegotiate.
    RenegotiationUnsupported,
    /// Application data received while renegotiating.
    UnexpectedApplicationData,
    /// Invalid state for the requested operation.
    InvalidState,
    /// Requested buffer capacity is not representable.
    OutOfRange { requested: usize },
    /// Caller-provided buffer too small.
    BufferTooSmall { needed: usize },
}

impl Error {
    /// Attach the logical operation to an unlabelled transport error.
    pub fn during(self, op: Operation) -> Self {
        match self {
            #[cfg(feature = "std")]
            Error::Io { op: None, source } => Error::Io {
                op: Some(op),
                source,
            },
            other => other,
        }
    }

    /// Whether this error leaves the session unusable.
    pub fn faults_session(&self) -> bool {
        matches!(
            self,
            Error::Framing(_)
                | Error::Authentication(_)
                | Error::UnexpectedEof { .. }
                | Error::Decrypt(_)
                | Error::Encrypt(_)
                | Error::RenegotiationNotAllowed
                | Error::UnexpectedApplicationData
        )
    }

    /// The alert carried by an authentication error, if any.
    pub fn alert(&self) -> Option<AlertDescription> {
        match self {
            Error::Authentication(e) => e.alert,
            _ => None,
        }
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}

impl From<AuthenticationError> for Error {
    fn from(e: AuthenticationError) -> Self {
        Error::Authentication(e)
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            op: None,
            source: Arc::new(e),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Framing(e) => write!(f, "framing error: {e:?}"),
            Error::Authentication(e) => write!(f, "authentication failed: {e}"),
            #[cfg(feature = "std")]
            Error::Io { op: Some(op), source } => write!(f, "{op} failed: {source}"),
            #[cfg(feature = "std")]
            Error::Io { op: None, source } => write!(f, "I/O error: {source}"),
            Error::UnexpectedEof { op } => {
                write!(f, "{op} failed: transport closed mid-record")
            }
            Error::Decrypt(status) => write!(f, "decryption failed: {status}"),
            Error::Encrypt(status) => write!(f, "encryption failed: {status}"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::NestedCall(op) => {
                write!(f, "a {op} operation is already in progress")
            }
            Error::Disposed => write!(f, "stream disposed"),
            Error::NotAuthenticated => write!(f, "stream is not authenticated"),
            Error::AlreadyAuthenticated => write!(f, "stream is already authenticated"),
            Error::WriteAfterShutdown => write!(f, "write after shutdown"),
            Error::RenegotiateWithUnreadData => {
                write!(f, "renegotiation requested with unread data buffered")
            }
            Error::RenegotiationNotAllowed => write!(f, "renegotiation not allowed"),
            Error::RenegotiationUnsupported => write!(f, "renegotiation unsupported"),
            Error::UnexpectedApplicationData => {
                write!(f, "application data received during renegotiation")
            }
            Error::InvalidState => write!(f, "invalid state"),
            Error::OutOfRange { requested } => {
                write!(f, "buffer size out of range: {requested} bytes")
            }
            Error::BufferTooSmall { needed } => {
                write!(f, "buffer too small, need {needed} bytes")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
