//! Security-context engine contract.
//!
//! The engine performs the cryptographic handshake steps and record
//! protection. The stream drives it with opaque tokens and never looks
//! inside them.

#[cfg(feature = "rustcrypto")]
pub mod loopback;
pub mod token;

use alloc::vec::Vec;

use crate::cert::Certificate;
use crate::record::alert::{AlertDescription, AlertLevel};
use crate::record::Protocol;

pub use token::ProtocolToken;

/// Engine status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    ContinueNeeded,
    /// The peer asked for a client certificate we have not supplied yet.
    CredentialsNeeded,
    /// A post-handshake handshake message arrived.
    Renegotiate,
    /// Record protection is paused while a renegotiation runs.
    TryAgain,
    /// The peer closed the session (close_notify).
    ContextExpired,
    /// The engine declined to start a renegotiation.
    NoRenegotiation,
    IncompleteMessage,
    InternalError,
    InvalidToken,
    MessageAltered,
    DecryptFailure,
    IllegalMessage,
    AlgorithmMismatch,
    ApplicationProtocolMismatch,
    ProtocolVersionMismatch,
    CertificateUnknown,
    Unsupported,
    BufferTooSmall,
}

/// Outcome of an engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityStatus {
    pub code: StatusCode,
    pub detail: Option<&'static str>,
}

impl SecurityStatus {
    pub const OK: Self = Self::new(StatusCode::Ok);

    pub const fn new(code: StatusCode) -> Self {
        Self { code, detail: None }
    }

    pub const fn with_detail(code: StatusCode, detail: &'static str) -> Self {
        Self {
            code,
            detail: Some(detail),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl core::fmt::Display for SecurityStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.detail {
            Some(detail) => write!(f, "{:?} ({detail})", self.code),
            None => write!(f, "{:?}", self.code),
        }
    }
}

/// Stream role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// IANA cipher suite identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u16);

impl CipherSuite {
    pub const TLS_AES_128_GCM_SHA256: Self = Self(0x1301);
    pub const TLS_AES_256_GCM_SHA384: Self = Self(0x1302);
    pub const TLS_CHACHA20_POLY1305_SHA256: Self = Self(0x1303);
    pub const TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: Self = Self(0xc02f);
    pub const TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: Self = Self(0xc02b);
}

/// Set of protocol versions a stream may negotiate. Empty means engine default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnabledProtocols(u8);

impl EnabledProtocols {
    pub const NONE: Self = Self(0);
    pub const SSL2: Self = Self(1 << 0);
    pub const SSL3: Self = Self(1 << 1);
    pub const TLS10: Self = Self(1 << 2);
    pub const TLS11: Self = Self(1 << 3);
    pub const TLS12: Self = Self(1 << 4);
    pub const TLS13: Self = Self(1 << 5);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn of(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Ssl2 => Self::SSL2,
            Protocol::Ssl3 => Self::SSL3,
            Protocol::Tls10 => Self::TLS10,
            Protocol::Tls11 => Self::TLS11,
            Protocol::Tls12 => Self::TLS12,
            Protocol::Tls13 => Self::TLS13,
        }
    }

    /// Whether `protocol` may be negotiated. An empty set allows TLS 1.2 and 1.3.
    pub fn allows(self, protocol: Protocol) -> bool {
        let set = if self.is_empty() {
            Self::TLS12.union(Self::TLS13)
        } else {
            self
        };
        set.0 & Self::of(protocol).0 != 0
    }
}

impl core::ops::BitOr for EnabledProtocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl FromIterator<Protocol> for EnabledProtocols {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, |acc, p| acc | Self::of(p))
    }
}

/// Negotiated session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub protocol: Protocol,
    pub cipher_suite: CipherSuite,
    /// Bytes the engine prepends to each protected record.
    pub header_size: usize,
    /// Bytes the engine appends (tag, padding, inner type).
    pub trailer_size: usize,
    /// Largest record the engine emits, header and trailer included.
    pub max_message_size: usize,
    pub application_protocol: Option<Vec<u8>>,
}

impl SessionInfo {
    /// Largest plaintext that fits one record.
    pub fn max_data_size(&self) -> usize {
        self.max_message_size
            .saturating_sub(self.header_size + self.trailer_size)
            .max(1)
    }
}

/// Role of an input buffer handed to a handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Bytes received from the peer.
    Token,
    /// ALPN `ProtocolNameList` the caller offers or accepts.
    ApplicationProtocols,
}

/// A tagged view passed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct SecurityBuffer<'a> {
    pub kind: BufferKind,
    pub data: &'a [u8],
}

impl<'a> SecurityBuffer<'a> {
    pub fn token(data: &'a [u8]) -> Self {
        Self {
            kind: BufferKind::Token,
            data,
        }
    }

    pub fn application_protocols(data: &'a [u8]) -> Self {
        Self {
            kind: BufferKind::ApplicationProtocols,
            data,
        }
    }
}

/// Fixed-capacity input list for one handshake step.
pub type InputBuffers<'a> = heapless::Vec<SecurityBuffer<'a>, 2>;

/// Find the buffer of a given kind.
pub fn find_buffer<'a>(input: &[SecurityBuffer<'a>], kind: BufferKind) -> Option<&'a [u8]> {
    input.iter().find(|b| b.kind == kind).map(|b| b.data)
}

/// Result of decrypting one record in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decrypted {
    pub status: SecurityStatus,
    /// Start of plaintext within the frame.
    pub offset: usize,
    /// Plaintext length.
    pub count: usize,
}

/// Parameters for acquiring a credential.
#[derive(Debug, Clone, Copy)]
pub struct CredentialParams<'a> {
    pub role: Role,
    pub certificate: Option<&'a Certificate>,
    pub protocols: EnabledProtocols,
    pub client_certificate_required: bool,
}

/// Certificate presented by the peer, with its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCertificate {
    pub certificate: Certificate,
    pub chain: Vec<Certificate>,
}

/// The external security-context engine.
///
/// Handshake steps write any outbound token into `output`. Record
/// protection works on whole records: `encrypt` appends header, ciphertext
/// and trailer; `decrypt` works in place and reports where the plaintext is.
pub trait SecurityEngine: Send {
    type Credential: Send + Sync;

    fn acquire_credential(&mut self, params: &CredentialParams<'_>) -> Result<Self::Credential, SecurityStatus>;

    fn initialize_outbound(
        &mut self,
        credential: &Self::Credential,
        target_name: Option<&str>,
        input: &[SecurityBuffer<'_>],
        output: &mut Vec<u8>,
    ) -> SecurityStatus;

    fn accept_inbound(
        &mut self,
        credential: &Self::Credential,
        input: &[SecurityBuffer<'_>],
        output: &mut Vec<u8>,
    ) -> SecurityStatus;

    /// Trailing bytes of the last handshake step's token that belong to a
    /// later flight. The stream keeps them buffered for the next step.
    fn unconsumed_input(&self) -> usize {
        0
    }

    fn encrypt(&mut self, plaintext: &[u8], output: &mut Vec<u8>) -> SecurityStatus;

    fn decrypt(&mut self, frame: &mut [u8]) -> Decrypted;

    fn session_info(&self) -> Option<SessionInfo>;

    fn remote_certificate(&self) -> Option<RemoteCertificate>;

    /// Queue an alert; the next handshake step emits it.
    fn apply_alert(&mut self, level: AlertLevel, description: AlertDescription) -> SecurityStatus;

    /// Queue a close_notify; the next handshake step emits it.
    fn apply_shutdown(&mut self) -> SecurityStatus;

    fn renegotiate(&mut self, _credential: &Self::Credential, _output: &mut Vec<u8>) -> SecurityStatus {
        SecurityStatus::new(StatusCode::Unsupported)
    }

    fn release(&mut self);
}

/// Exclusive owner of an engine context; releases it exactly once.
pub struct ContextHandle<E: SecurityEngine> {
    engine: E,
    released: bool,
}

impl<E: SecurityEngine> ContextHandle<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            released: false,
        }
    }

    /// The live engine, or `None` once released.
    pub fn get(&self) -> Option<&E> {
        (!self.released).then_some(&self.engine)
    }

    pub fn get_mut(&mut self) -> Option<&mut E> {
        (!self.released).then_some(&mut self.engine)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the context. Later calls are no-ops.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.engine.release();
        }
    }
}

impl<E: SecurityEngine> Drop for ContextHandle<E> {
    fn drop(&mut self) {
        self.release();
    }
}
