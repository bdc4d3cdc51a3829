//! Authentication options and stream tunables.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use futures::future::BoxFuture;

use crate::cert::{Certificate, ChainReport, ChainVerifier, PolicyErrors, RevocationMode};
use crate::engine::{EnabledProtocols, Role};
use crate::error::Error;
use crate::record::hello::encode_alpn_list;

/// Read sizes used by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Buffer space ensured before reading handshake frames.
    pub handshake_read_size: usize,
    /// Buffer space ensured before reading application frames.
    pub read_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_read_size: 4096 + 64,
            read_size: 16384 + 64,
        }
    }
}

/// Final say on the remote certificate. Receives the certificate (if any),
/// the chain report and the policy errors found; returns whether to accept.
pub type ValidationCallback =
    Arc<dyn Fn(Option<&Certificate>, &ChainReport, PolicyErrors) -> bool + Send + Sync>;

/// Client certificate selection: target host, candidates and the issuers the
/// server asked for (if known).
pub type LocalCertificateSelector =
    Arc<dyn Fn(Option<&str>, &[Certificate], Option<&Certificate>) -> Option<Certificate> + Send + Sync>;

/// Server certificate selection by SNI host name.
pub type ServerCertificateSelector = Arc<dyn Fn(Option<&str>) -> Option<Certificate> + Send + Sync>;

/// What a server knows from the ClientHello before picking its options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub supported_versions: EnabledProtocols,
}

/// Asynchronous per-connection server option selection.
pub type ServerOptionsSelector =
    Arc<dyn Fn(ClientHelloInfo) -> BoxFuture<'static, Result<ServerOptions, Error>> + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    /// Host name used for SNI and name validation.
    pub target_host: Option<String>,
    pub client_certificates: Vec<Certificate>,
    pub certificate_selector: Option<LocalCertificateSelector>,
    pub application_protocols: Vec<Vec<u8>>,
    pub enabled_protocols: EnabledProtocols,
    pub revocation_mode: RevocationMode,
    pub allow_renegotiation: bool,
    pub trust_anchors: Vec<Certificate>,
    pub chain_verifier: Option<Arc<dyn ChainVerifier>>,
    pub validation: Option<ValidationCallback>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            target_host: None,
            client_certificates: Vec::new(),
            certificate_selector: None,
            application_protocols: Vec::new(),
            enabled_protocols: EnabledProtocols::NONE,
            revocation_mode: RevocationMode::NoCheck,
            allow_renegotiation: true,
            trust_anchors: Vec::new(),
            chain_verifier: None,
            validation: None,
        }
    }
}

impl ClientOptions {
    pub fn new(target_host: impl Into<String>) -> Self {
        Self {
            target_host: Some(target_host.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Default)]
pub struct ServerOptions {
    pub server_certificate: Option<Certificate>,
    pub certificate_selector: Option<ServerCertificateSelector>,
    pub client_certificate_required: bool,
    pub application_protocols: Vec<Vec<u8>>,
    pub enabled_protocols: EnabledProtocols,
    pub revocation_mode: RevocationMode,
    pub allow_renegotiation: bool,
    pub trust_anchors: Vec<Certificate>,
    pub chain_verifier: Option<Arc<dyn ChainVerifier>>,
    pub validation: Option<ValidationCallback>,
}

impl ServerOptions {
    pub fn new(certificate: Certificate) -> Self {
        Self {
            server_certificate: Some(certificate),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Unified view used by the handshake driver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct AuthOptions {
    pub role: Role,
    pub target_host: Option<String>,
    pub certificates: Vec<Certificate>,
    pub local_selector: Option<LocalCertificateSelector>,
    pub server_selector: Option<ServerCertificateSelector>,
    pub certificate_required: bool,
    /// ALPN protocols in `ProtocolNameList` wire form, empty if none.
    pub alpn_wire: Vec<u8>,
    pub enabled_protocols: EnabledProtocols,
    pub revocation_mode: RevocationMode,
    pub allow_renegotiation: bool,
    pub trust_anchors: Vec<Certificate>,
    pub chain_verifier: Option<Arc<dyn ChainVerifier>>,
    pub validation: Option<ValidationCallback>,
}

fn alpn_wire(protocols: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = Vec::new();
    if !protocols.is_empty() {
        encode_alpn_list(protocols, &mut wire);
    }
    wire
}

impl From<ClientOptions> for AuthOptions {
    fn from(o: ClientOptions) -> Self {
        Self {
            role: Role::Client,
            target_host: o.target_host,
            certificates: o.client_certificates,
            local_selector: o.certificate_selector,
            server_selector: None,
            certificate_required: false,
            alpn_wire: alpn_wire(&o.application_protocols),
            enabled_protocols: o.enabled_protocols,
            revocation_mode: o.revocation_mode,
            allow_renegotiation: o.allow_renegotiation,
            trust_anchors: o.trust_anchors,
            chain_verifier: o.chain_verifier,
            validation: o.validation,
        }
    }
}

impl From<ServerOptions> for AuthOptions {
    fn from(o: ServerOptions) -> Self {
        Self {
            role: Role::Server,
            target_host: None,
            certificates: o.server_certificate.into_iter().collect(),
            local_selector: None,
            server_selector: o.certificate_selector,
            certificate_required: o.client_certificate_required,
            alpn_wire: alpn_wire(&o.application_protocols),
            enabled_protocols: o.enabled_protocols,
            revocation_mode: o.revocation_mode,
            allow_renegotiation: o.allow_renegotiation,
            trust_anchors: o.trust_anchors,
            chain_verifier: o.chain_verifier,
            validation: o.validation,
        }
    }
}

impl AuthOptions {
    /// Replace server options picked after the ClientHello, keeping the SNI
    /// name already recorded.
    pub fn update_server_options(&mut self, options: ServerOptions) {
        let target_host = self.target_host.take();
        *self = options.into();
        self.target_host = target_host;
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Certificate the server presents for `target_host`.
    pub fn server_certificate(&self) -> Option<Certificate> {
        if let Some(selector) = &self.server_selector {
            if let Some(cert) = selector(self.target_host.as_deref()) {
                return Some(cert);
            }
        }
        self.certificates.first().cloned()
    }

    /// Client certificate offered after the server asked for one.
    pub fn client_certificate(&self, remote: Option<&Certificate>) -> Option<Certificate> {
        match &self.local_selector {
            Some(selector) => selector(self.target_host.as_deref(), &self.certificates, remote),
            None => self.certificates.first().cloned(),
        }
    }
}
