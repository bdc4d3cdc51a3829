//! TLS alert protocol (RFC 8446 §6).

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertLevel {
    Warning = 1,
    Fatal = 2,
}

impl AlertLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Warning),
            2 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// TLS alert description codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    CloseNotify = 0,
    UnexpectedMessage = 10,
    BadRecordMac = 20,
    DecryptionFailed = 21,
    RecordOverflow = 22,
    HandshakeFailure = 40,
    BadCertificate = 42,
    UnsupportedCertificate = 43,
    CertificateRevoked = 44,
    CertificateExpired = 45,
    CertificateUnknown = 46,
    IllegalParameter = 47,
    UnknownCa = 48,
    AccessDenied = 49,
    DecodeError = 50,
    DecryptError = 51,
    ProtocolVersion = 70,
    InsufficientSecurity = 71,
    InternalError = 80,
    UserCanceled = 90,
    NoRenegotiation = 100,
    MissingExtension = 109,
    UnsupportedExtension = 110,
    UnrecognizedName = 112,
    CertificateRequired = 116,
    NoApplicationProtocol = 120,
}

impl AlertDescription {
    /// Convert from a raw u8 byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::CloseNotify),
            10 => Some(Self::UnexpectedMessage),
            20 => Some(Self::BadRecordMac),
            21 => Some(Self::DecryptionFailed),
            22 => Some(Self::RecordOverflow),
            40 => Some(Self::HandshakeFailure),
            42 => Some(Self::BadCertificate),
            43 => Some(Self::UnsupportedCertificate),
            44 => Some(Self::CertificateRevoked),
            45 => Some(Self::CertificateExpired),
            46 => Some(Self::CertificateUnknown),
            47 => Some(Self::IllegalParameter),
            48 => Some(Self::UnknownCa),
            49 => Some(Self::AccessDenied),
            50 => Some(Self::DecodeError),
            51 => Some(Self::DecryptError),
            70 => Some(Self::ProtocolVersion),
            71 => Some(Self::InsufficientSecurity),
            80 => Some(Self::InternalError),
            90 => Some(Self::UserCanceled),
            100 => Some(Self::NoRenegotiation),
            109 => Some(Self::MissingExtension),
            110 => Some(Self::UnsupportedExtension),
            112 => Some(Self::UnrecognizedName),
            116 => Some(Self::CertificateRequired),
            120 => Some(Self::NoApplicationProtocol),
            _ => None,
        }
    }

    /// Convert to raw u8 byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable description for error reports.
    pub fn message(self) -> &'static str {
        match self {
            Self::CloseNotify => "the connection was closed",
            Self::UnexpectedMessage => "an unexpected message was received",
            Self::BadRecordMac => "a record failed integrity checks",
            Self::DecryptionFailed => "a record could not be decrypted",
            Self::RecordOverflow => "a record exceeded the maximum size",
            Self::HandshakeFailure => "no acceptable security parameters could be negotiated",
            Self::BadCertificate => "the certificate was corrupt or failed verification",
            Self::UnsupportedCertificate => "the certificate type is not supported",
            Self::CertificateRevoked => "the certificate was revoked",
            Self::CertificateExpired => "the certificate has expired or is not yet valid",
            Self::CertificateUnknown => "the certificate could not be accepted",
            Self::IllegalParameter => "a handshake field was out of range",
            Self::UnknownCa => "the certificate authority is not trusted",
            Self::AccessDenied => "access was denied",
            Self::DecodeError => "a message could not be decoded",
            Self::DecryptError => "a handshake cryptographic operation failed",
            Self::ProtocolVersion => "the protocol version is not supported",
            Self::InsufficientSecurity => "the offered parameters are too weak",
            Self::InternalError => "the peer hit an internal error",
            Self::UserCanceled => "the handshake was cancelled",
            Self::NoRenegotiation => "renegotiation was refused",
            Self::MissingExtension => "a required extension was missing",
            Self::UnsupportedExtension => "an unsupported extension was received",
            Self::UnrecognizedName => "the requested server name is unknown",
            Self::CertificateRequired => "a client certificate is required",
            Self::NoApplicationProtocol => "no common application protocol",
        }
    }
}

/// A decoded alert message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub description: AlertDescription,
}

impl Alert {
    /// Parse the 2-byte alert body.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 2 {
            return None;
        }
        Some(Self {
            level: AlertLevel::from_u8(body[0])?,
            description: AlertDescription::from_u8(body[1])?,
        })
    }

    /// Fatal and not a close_notify.
    pub fn is_fatal_error(&self) -> bool {
        self.level == AlertLevel::Fatal && self.description != AlertDescription::CloseNotify
    }
}
