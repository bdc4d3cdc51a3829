//! Deterministic reference engine over RustCrypto primitives.
//!
//! Runs a small TLS-shaped handshake: ClientHello, a server flight
//! (ServerHello, Certificate, optional CertificateRequest), a configurable
//! number of extra `Continue` round trips, then Finished messages keyed off a
//! running SHA-256 transcript. Records are protected with AES-128-GCM under
//! keys expanded by HKDF-SHA256 from the two hello randoms.
//!
//! There is no key exchange: anyone who sees the hellos can derive the keys.
//! It exists to exercise the stream end to end, not to protect data.

use alloc::string::String;
use alloc::vec::Vec;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce, Tag};
use sha2::{Digest, Sha256};
use tracing::trace;

use super::{
    find_buffer, BufferKind, CipherSuite, CredentialParams, Decrypted, EnabledProtocols,
    RemoteCertificate, Role, SecurityBuffer, SecurityEngine, SecurityStatus, SessionInfo,
    StatusCode,
};
use crate::cert::Certificate;
use crate::record::alert::{Alert, AlertDescription, AlertLevel};
use crate::record::hello::{
    encode_client_hello, encode_server_hello, iter_handshake_messages, parse_alpn_list,
    parse_client_hello, parse_hello_extensions, parse_server_hello, write_handshake_message,
    HandshakeType,
};
use crate::record::{
    try_get_frame_header, ContentType, Framing, Protocol, MAX_RECORD_PAYLOAD, RECORD_HEADER_LEN,
};

pub const TAG_LEN: usize = 16;

/// Inner content type byte plus the AEAD tag.
pub const TRAILER_LEN: usize = 1 + TAG_LEN;

/// Private-use handshake type for the padding round trips.
const CONTINUE: u8 = 254;

const SUITE: CipherSuite = CipherSuite::TLS_AES_128_GCM_SHA256;

/// Knobs for the loopback handshake.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Round trips added between the hellos and the Finished messages.
    pub extra_round_trips: usize,
    /// Version the server selects if the client offers it.
    pub protocol: Protocol,
    /// Largest protected record, header and trailer included.
    pub max_message_size: usize,
    /// Seed for the hello randoms.
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            extra_round_trips: 0,
            protocol: Protocol::Tls12,
            max_message_size: 16384 + RECORD_HEADER_LEN + TRAILER_LEN,
            seed: 0,
        }
    }
}

/// Credential handed out by `LoopbackEngine::acquire_credential`.
#[derive(Debug, Clone)]
pub struct LoopbackCredential {
    pub role: Role,
    pub certificate: Option<Certificate>,
    pub protocols: EnabledProtocols,
    pub client_certificate_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitServerFlight,
    ClientContinue(usize),
    AwaitServerFinished,
    ServerContinue(usize),
    AwaitClientFinished,
    Established,
    /// Server sent HelloRequest.
    RenegotiateRequested,
    /// Client answered a HelloRequest.
    RenegotiateReplied,
    Closed,
}

struct Direction {
    cipher: Aes128Gcm,
    iv: [u8; 12],
    seq: u64,
}

pub struct LoopbackEngine {
    config: LoopbackConfig,
    state: State,
    role: Option<Role>,
    client_random: [u8; 32],
    server_random: [u8; 32],
    transcript: Sha256,
    send: Option<Direction>,
    recv: Option<Direction>,
    protocol: Option<Protocol>,
    application_protocol: Option<Vec<u8>>,
    remote: Option<RemoteCertificate>,
    certificate_requested: bool,
    awaiting_credentials: bool,
    pending_alert: Option<(AlertLevel, AlertDescription)>,
    /// Input left over after the flight the last step consumed.
    unconsumed: usize,
}

type Step = Result<StatusCode, SecurityStatus>;

fn status(code: StatusCode, detail: &'static str) -> SecurityStatus {
    SecurityStatus::with_detail(code, detail)
}

fn unexpected() -> SecurityStatus {
    status(StatusCode::IllegalMessage, "unexpected handshake message")
}

/// Build a nonce for AEAD: iv XOR padded sequence number (RFC 8446 §5.3).
fn build_nonce(iv: &[u8; 12], seq: u64) -> [u8; 12] {
    let mut nonce = *iv;
    for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
        *n ^= s;
    }
    nonce
}

fn seeded_random(seed: u64, label: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(seed.to_be_bytes())
        .chain_update(label)
        .finalize()
        .into()
}

// ---------------------------------------------------------------------------
// Certificate message body: count(1), then per certificate
// der_len(3) der names(1) [name_len(1) name]*
// ---------------------------------------------------------------------------

fn encode_certificates(certs: &[&Certificate], out: &mut Vec<u8>) {
    out.push(certs.len() as u8);
    for cert in certs {
        out.extend_from_slice(&(cert.der().len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(cert.der());
        out.push(cert.names().len() as u8);
        for name in cert.names() {
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
    }
}

fn decode_certificates(body: &[u8]) -> Option<Vec<Certificate>> {
    let (&count, mut rest) = body.split_first()?;
    let mut certs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = ((*rest.first()? as usize) << 16)
            | ((*rest.get(1)? as usize) << 8)
            | *rest.get(2)? as usize;
        let der = rest.get(3..3 + len)?.to_vec();
        rest = &rest[3 + len..];
        let (&n, tail) = rest.split_first()?;
        rest = tail;
        let mut names = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let (&l, tail) = rest.split_first()?;
            let name = core::str::from_utf8(tail.get(..l as usize)?).ok()?;
            names.push(String::from(name));
            rest = &tail[l as usize..];
        }
        certs.push(Certificate::new(der, names));
    }
    Some(certs)
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        let client_random = seeded_random(config.seed, b"client random");
        let server_random = seeded_random(config.seed, b"server random");
        Self {
            config,
            state: State::Start,
            role: None,
            client_random,
            server_random,
            transcript: Sha256::new(),
            send: None,
            recv: None,
            protocol: None,
            application_protocol: None,
            remote: None,
            certificate_requested: false,
            awaiting_credentials: false,
            pending_alert: None,
            unconsumed: 0,
        }
    }

    fn established(&self) -> bool {
        matches!(
            self.state,
            State::Established | State::RenegotiateRequested | State::RenegotiateReplied
        )
    }

    fn renegotiating(&self) -> bool {
        matches!(self.state, State::RenegotiateRequested | State::RenegotiateReplied)
    }

    fn max_data_size(&self) -> usize {
        self.config
            .max_message_size
            .saturating_sub(RECORD_HEADER_LEN + TRAILER_LEN)
            .min(MAX_RECORD_PAYLOAD - TRAILER_LEN)
    }

    // ---- transcript ----

    fn absorb(&mut self, ty: u8, body: &[u8]) {
        let len = (body.len() as u32).to_be_bytes();
        self.transcript.update([ty, len[1], len[2], len[3]]);
        self.transcript.update(body);
    }

    /// Append a message to `flight` and the transcript.
    fn push_message(&mut self, ty: HandshakeType, body: &[u8], flight: &mut Vec<u8>) {
        self.absorb(ty as u8, body);
        write_handshake_message(ty, body, flight);
    }

    fn push_continue(&mut self, index: usize, flight: &mut Vec<u8>) {
        let body = [index as u8];
        self.absorb(CONTINUE, &body);
        flight.push(CONTINUE);
        flight.extend_from_slice(&[0, 0, 1]);
        flight.extend_from_slice(&body);
    }

    fn finished_mac(&self, label: &[u8]) -> [u8; 32] {
        let transcript = self.transcript.clone().finalize();
        Sha256::new()
            .chain_update(label)
            .chain_update(transcript)
            .finalize()
            .into()
    }

    fn push_finished(&mut self, label: &[u8], flight: &mut Vec<u8>) {
        let mac = self.finished_mac(label);
        self.push_message(HandshakeType::Finished, &mac, flight);
    }

    fn check_finished(&mut self, label: &[u8], body: &[u8]) -> Result<(), SecurityStatus> {
        if body != self.finished_mac(label) {
            return Err(status(StatusCode::MessageAltered, "finished mismatch"));
        }
        self.absorb(HandshakeType::Finished as u8, body);
        Ok(())
    }

    // ---- keys and records ----

    fn derive_keys(&mut self, role: Role) -> Result<(), SecurityStatus> {
        let hk = hkdf::Hkdf::<Sha256>::new(Some(&self.client_random), &self.server_random);
        let expand = |label: &[u8], okm: &mut [u8]| {
            hk.expand(label, okm)
                .map_err(|_| status(StatusCode::InternalError, "key expansion"))
        };
        let mut client_key = [0u8; 16];
        let mut client_iv = [0u8; 12];
        let mut server_key = [0u8; 16];
        let mut server_iv = [0u8; 12];
        expand(b"loopback client write key", &mut client_key)?;
        expand(b"loopback client write iv", &mut client_iv)?;
        expand(b"loopback server write key", &mut server_key)?;
        expand(b"loopback server write iv", &mut server_iv)?;

        let direction = |key: &[u8; 16], iv: [u8; 12]| -> Result<Direction, SecurityStatus> {
            let cipher = Aes128Gcm::new_from_slice(key)
                .map_err(|_| status(StatusCode::InternalError, "cipher init"))?;
            Ok(Direction { cipher, iv, seq: 0 })
        };
        let client = direction(&client_key, client_iv)?;
        let server = direction(&server_key, server_iv)?;
        let (send, recv) = match role {
            Role::Client => (client, server),
            Role::Server => (server, client),
        };
        self.send = Some(send);
        self.recv = Some(recv);
        Ok(())
    }

    /// Append a protected record: header, payload, inner type, tag.
    fn seal(
        &mut self,
        outer: ContentType,
        inner: ContentType,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), SecurityStatus> {
        let dir = self
            .send
            .as_mut()
            .ok_or(status(StatusCode::InvalidToken, "no keys"))?;
        let body_len = payload.len() + TRAILER_LEN;
        if body_len > MAX_RECORD_PAYLOAD {
            return Err(SecurityStatus::new(StatusCode::BufferTooSmall));
        }
        let start = out.len();
        let [hi, lo] = (body_len as u16).to_be_bytes();
        let aad = [outer as u8, 3, 3, hi, lo];
        out.extend_from_slice(&aad);
        out.extend_from_slice(payload);
        out.push(inner as u8);

        let nonce = build_nonce(&dir.iv, dir.seq);
        dir.seq += 1;
        let tag = dir
            .cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &aad,
                &mut out[start + RECORD_HEADER_LEN..],
            )
            .map_err(|_| status(StatusCode::InternalError, "seal"))?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Decrypt a protected record in place; returns the inner type and
    /// plaintext length (plaintext starts after the header).
    fn open(&mut self, record: &mut [u8]) -> Result<(ContentType, usize), SecurityStatus> {
        if record.len() < RECORD_HEADER_LEN + TRAILER_LEN {
            return Err(status(StatusCode::MessageAltered, "record too short"));
        }
        let dir = self
            .recv
            .as_mut()
            .ok_or(status(StatusCode::InvalidToken, "no keys"))?;
        let mut aad = [0u8; RECORD_HEADER_LEN];
        aad.copy_from_slice(&record[..RECORD_HEADER_LEN]);
        let body = &mut record[RECORD_HEADER_LEN..];
        let ct_len = body.len() - TAG_LEN;
        let (data, tag) = body.split_at_mut(ct_len);

        let nonce = build_nonce(&dir.iv, dir.seq);
        dir.seq += 1;
        dir.cipher
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, data, Tag::from_slice(tag))
            .map_err(|_| status(StatusCode::MessageAltered, "bad record mac"))?;

        // inner content type is the last non-zero byte
        let mut end = data.len();
        while end > 0 && data[end - 1] == 0 {
            end -= 1;
        }
        if end == 0 {
            return Err(status(StatusCode::IllegalMessage, "no inner content type"));
        }
        let ct = ContentType::from_byte(data[end - 1])
            .ok_or(status(StatusCode::IllegalMessage, "bad inner content type"))?;
        Ok((ct, end - 1))
    }

    /// Wrap handshake messages in one record, protected once established.
    fn handshake_record(&mut self, flight: &[u8], out: &mut Vec<u8>) -> Result<(), SecurityStatus> {
        if self.established() {
            return self.seal(ContentType::Handshake, ContentType::Handshake, flight, out);
        }
        if flight.len() > MAX_RECORD_PAYLOAD {
            return Err(SecurityStatus::new(StatusCode::BufferTooSmall));
        }
        out.extend_from_slice(&[ContentType::Handshake as u8, 3, 3]);
        out.extend_from_slice(&(flight.len() as u16).to_be_bytes());
        out.extend_from_slice(flight);
        Ok(())
    }

    /// Handshake messages of the first flight in `token`. Every flight is a
    /// single handshake record; records after it are left unconsumed.
    fn inbound_messages(&mut self, token: &[u8]) -> Result<Vec<u8>, SecurityStatus> {
        let mut messages = Vec::new();
        let mut off = 0;
        let mut flight_read = false;
        while off < token.len() {
            if flight_read {
                self.unconsumed = token.len() - off;
                break;
            }
            let header = try_get_frame_header(&token[off..], Framing::Ssl3Plus)
                .ok()
                .flatten()
                .ok_or(status(StatusCode::IllegalMessage, "bad record header"))?;
            let end = off + header.frame_size();
            if end > token.len() {
                return Err(SecurityStatus::new(StatusCode::IncompleteMessage));
            }
            match header.content_type {
                ContentType::ChangeCipherSpec => {}
                ContentType::Alert => {
                    return Err(status(StatusCode::IllegalMessage, "alert received"));
                }
                ContentType::ApplicationData => return Err(unexpected()),
                ContentType::Handshake if self.renegotiating() => {
                    let mut record = token[off..end].to_vec();
                    let (ct, len) = self.open(&mut record)?;
                    if ct != ContentType::Handshake {
                        return Err(unexpected());
                    }
                    messages.extend_from_slice(&record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len]);
                    flight_read = true;
                }
                ContentType::Handshake => {
                    messages.extend_from_slice(&token[off + header.header_size..end]);
                    flight_read = true;
                }
            }
            off = end;
        }
        Ok(messages)
    }

    fn emit_alert(&mut self, level: AlertLevel, desc: AlertDescription, out: &mut Vec<u8>) -> Result<(), SecurityStatus> {
        let body = [level as u8, desc.to_u8()];
        if self.established() {
            self.seal(ContentType::Alert, ContentType::Alert, &body, out)?;
        } else {
            out.extend_from_slice(&[ContentType::Alert as u8, 3, 3, 0, 2]);
            out.extend_from_slice(&body);
        }
        if level == AlertLevel::Fatal {
            self.state = State::Closed;
        }
        trace!(?level, ?desc, "loopback alert emitted");
        Ok(())
    }

    fn fail_with_alert(&mut self, desc: AlertDescription, code: StatusCode, out: &mut Vec<u8>) -> Step {
        self.emit_alert(AlertLevel::Fatal, desc, out)?;
        Err(SecurityStatus::with_detail(code, desc.message()))
    }

    // ---- client ----

    fn client_step(
        &mut self,
        credential: &LoopbackCredential,
        target_name: Option<&str>,
        input: &[SecurityBuffer<'_>],
        out: &mut Vec<u8>,
    ) -> Step {
        let token = find_buffer(input, BufferKind::Token).unwrap_or(&[]);
        match self.state {
            State::Start => {
                self.role = Some(Role::Client);
                let alpn = find_buffer(input, BufferKind::ApplicationProtocols)
                    .and_then(parse_alpn_list)
                    .unwrap_or_default();
                let versions: Vec<u16> = [Protocol::Tls13, Protocol::Tls12, Protocol::Tls11, Protocol::Tls10]
                    .into_iter()
                    .filter(|&p| credential.protocols.allows(p))
                    .map(Protocol::to_wire)
                    .collect();
                let mut body = Vec::new();
                encode_client_hello(&self.client_random, &[SUITE.0], target_name, &versions, &alpn, &mut body);
                let mut flight = Vec::new();
                self.push_message(HandshakeType::ClientHello, &body, &mut flight);
                self.handshake_record(&flight, out)?;
                self.state = State::AwaitServerFlight;
                Ok(StatusCode::ContinueNeeded)
            }
            State::AwaitServerFlight => {
                if !self.awaiting_credentials {
                    let messages = self.inbound_messages(token)?;
                    self.read_server_flight(credential, &messages)?;
                    if self.certificate_requested && credential.certificate.is_none() {
                        self.awaiting_credentials = true;
                        return Ok(StatusCode::CredentialsNeeded);
                    }
                }
                self.awaiting_credentials = false;
                let mut flight = Vec::new();
                if self.config.extra_round_trips > 0 {
                    self.push_continue(0, &mut flight);
                    self.state = State::ClientContinue(1);
                } else {
                    self.push_client_final(credential, &mut flight);
                    self.state = State::AwaitServerFinished;
                }
                self.handshake_record(&flight, out)?;
                Ok(StatusCode::ContinueNeeded)
            }
            State::ClientContinue(sent) => {
                let messages = self.inbound_messages(token)?;
                self.expect_continue(&messages)?;
                let mut flight = Vec::new();
                if sent < self.config.extra_round_trips {
                    self.push_continue(sent, &mut flight);
                    self.state = State::ClientContinue(sent + 1);
                } else {
                    self.push_client_final(credential, &mut flight);
                    self.state = State::AwaitServerFinished;
                }
                self.handshake_record(&flight, out)?;
                Ok(StatusCode::ContinueNeeded)
            }
            State::AwaitServerFinished | State::RenegotiateReplied => {
                let label: &[u8] = if self.state == State::AwaitServerFinished {
                    b"server finished"
                } else {
                    b"server renegotiated"
                };
                let messages = self.inbound_messages(token)?;
                match iter_handshake_messages(&messages).next().flatten() {
                    Some((ty, body)) if ty == HandshakeType::Finished as u8 => {
                        self.check_finished(label, body)?
                    }
                    _ => return Err(unexpected()),
                }
                self.state = State::Established;
                Ok(StatusCode::Ok)
            }
            State::Established => {
                // decrypted HelloRequest handed back by the stream
                if !self.awaiting_credentials {
                    if token.is_empty() {
                        return Err(SecurityStatus::new(StatusCode::InvalidToken));
                    }
                    let mut requested = false;
                    for msg in iter_handshake_messages(token) {
                        let (ty, body) = msg.ok_or_else(unexpected)?;
                        match HandshakeType::from_u8(ty) {
                            Some(HandshakeType::HelloRequest) => {}
                            Some(HandshakeType::CertificateRequest) => requested = true,
                            _ => return Err(unexpected()),
                        }
                        self.absorb(ty, body);
                    }
                    if requested && credential.certificate.is_none() {
                        self.awaiting_credentials = true;
                        return Ok(StatusCode::CredentialsNeeded);
                    }
                }
                self.awaiting_credentials = false;
                let mut flight = Vec::new();
                let mut body = Vec::new();
                encode_certificates(&credential.certificate.iter().collect::<Vec<_>>(), &mut body);
                self.push_message(HandshakeType::Certificate, &body, &mut flight);
                self.push_finished(b"client renegotiated", &mut flight);
                self.handshake_record(&flight, out)?;
                self.state = State::RenegotiateReplied;
                Ok(StatusCode::ContinueNeeded)
            }
            _ => Err(SecurityStatus::new(StatusCode::InvalidToken)),
        }
    }

    fn read_server_flight(&mut self, credential: &LoopbackCredential, messages: &[u8]) -> Result<(), SecurityStatus> {
        let mut saw_hello = false;
        for msg in iter_handshake_messages(messages) {
            let (ty, body) = msg.ok_or_else(unexpected)?;
            match HandshakeType::from_u8(ty) {
                Some(HandshakeType::ServerHello) if !saw_hello => {
                    let hello = parse_server_hello(body).ok_or_else(unexpected)?;
                    if hello.cipher_suite != SUITE.0 {
                        return Err(SecurityStatus::new(StatusCode::AlgorithmMismatch));
                    }
                    let ext = parse_hello_extensions(hello.extensions, false).ok_or_else(unexpected)?;
                    let selected = ext.supported_versions.first().copied().unwrap_or(hello.version);
                    let protocol = Protocol::from_wire(selected)
                        .filter(|&p| credential.protocols.allows(p))
                        .ok_or(SecurityStatus::new(StatusCode::ProtocolVersionMismatch))?;
                    self.protocol = Some(protocol);
                    self.application_protocol = ext.application_protocols.into_iter().next();
                    self.server_random = *hello.random;
                    saw_hello = true;
                }
                Some(HandshakeType::Certificate) if saw_hello => {
                    let mut certs = decode_certificates(body).ok_or_else(unexpected)?;
                    if !certs.is_empty() {
                        let certificate = certs.remove(0);
                        self.remote = Some(RemoteCertificate { certificate, chain: certs });
                    }
                }
                Some(HandshakeType::CertificateRequest) if saw_hello => {
                    self.certificate_requested = true;
                }
                _ => return Err(unexpected()),
            }
            self.absorb(ty, body);
        }
        if !saw_hello {
            return Err(unexpected());
        }
        self.derive_keys(Role::Client)
    }

    fn push_client_final(&mut self, credential: &LoopbackCredential, flight: &mut Vec<u8>) {
        if self.certificate_requested {
            let mut body = Vec::new();
            encode_certificates(&credential.certificate.iter().collect::<Vec<_>>(), &mut body);
            self.push_message(HandshakeType::Certificate, &body, flight);
        }
        self.push_finished(b"client finished", flight);
    }

    fn expect_continue(&mut self, messages: &[u8]) -> Result<(), SecurityStatus> {
        match iter_handshake_messages(messages).next().flatten() {
            Some((ty, body)) if ty == CONTINUE => {
                self.absorb(ty, body);
                Ok(())
            }
            _ => Err(unexpected()),
        }
    }

    // ---- server ----

    fn server_step(
        &mut self,
        credential: &LoopbackCredential,
        input: &[SecurityBuffer<'_>],
        out: &mut Vec<u8>,
    ) -> Step {
        let token = find_buffer(input, BufferKind::Token).unwrap_or(&[]);
        match self.state {
            State::Start => {
                self.role = Some(Role::Server);
                let messages = self.inbound_messages(token)?;
                let (ty, body) = iter_handshake_messages(&messages)
                    .next()
                    .flatten()
                    .filter(|(ty, _)| *ty == HandshakeType::ClientHello as u8)
                    .ok_or_else(unexpected)?;
                let hello = parse_client_hello(body).ok_or_else(unexpected)?;
                self.client_random = *hello.random;
                let ext = parse_hello_extensions(hello.extensions, true).ok_or_else(unexpected)?;
                self.absorb(ty, body);

                let offered = if ext.supported_versions.is_empty() {
                    alloc::vec![hello.version]
                } else {
                    ext.supported_versions
                };
                let wanted = self.config.protocol;
                if !offered.contains(&wanted.to_wire()) || !credential.protocols.allows(wanted) {
                    return self.fail_with_alert(
                        AlertDescription::ProtocolVersion,
                        StatusCode::ProtocolVersionMismatch,
                        out,
                    );
                }
                self.protocol = Some(wanted);

                let ours = find_buffer(input, BufferKind::ApplicationProtocols)
                    .and_then(parse_alpn_list)
                    .unwrap_or_default();
                if !ours.is_empty() && !ext.application_protocols.is_empty() {
                    match ours.iter().find(|p| ext.application_protocols.contains(*p)) {
                        Some(p) => self.application_protocol = Some(p.clone()),
                        None => {
                            return self.fail_with_alert(
                                AlertDescription::NoApplicationProtocol,
                                StatusCode::ApplicationProtocolMismatch,
                                out,
                            )
                        }
                    }
                }

                let certificate = credential
                    .certificate
                    .as_ref()
                    .ok_or(status(StatusCode::InternalError, "no server certificate"))?;
                let mut flight = Vec::new();
                let mut body = Vec::new();
                let random = self.server_random;
                encode_server_hello(&random, SUITE.0, wanted.to_wire(), self.application_protocol.as_deref(), &mut body);
                self.push_message(HandshakeType::ServerHello, &body, &mut flight);
                body.clear();
                encode_certificates(&[certificate], &mut body);
                self.push_message(HandshakeType::Certificate, &body, &mut flight);
                if credential.client_certificate_required {
                    self.certificate_requested = true;
                    self.push_message(HandshakeType::CertificateRequest, &[], &mut flight);
                }
                self.derive_keys(Role::Server)?;
                self.handshake_record(&flight, out)?;
                self.state = if self.config.extra_round_trips > 0 {
                    State::ServerContinue(0)
                } else {
                    State::AwaitClientFinished
                };
                Ok(StatusCode::ContinueNeeded)
            }
            State::ServerContinue(received) => {
                let messages = self.inbound_messages(token)?;
                self.expect_continue(&messages)?;
                let mut flight = Vec::new();
                self.push_continue(received, &mut flight);
                self.handshake_record(&flight, out)?;
                let received = received + 1;
                self.state = if received >= self.config.extra_round_trips {
                    State::AwaitClientFinished
                } else {
                    State::ServerContinue(received)
                };
                Ok(StatusCode::ContinueNeeded)
            }
            State::AwaitClientFinished | State::RenegotiateRequested => {
                let (client_label, server_label): (&[u8], &[u8]) =
                    if self.state == State::AwaitClientFinished {
                        (b"client finished", b"server finished")
                    } else {
                        (b"client renegotiated", b"server renegotiated")
                    };
                let messages = self.inbound_messages(token)?;
                let mut finished = false;
                for msg in iter_handshake_messages(&messages) {
                    let (ty, body) = msg.ok_or_else(unexpected)?;
                    match HandshakeType::from_u8(ty) {
                        Some(HandshakeType::Certificate) if !finished => {
                            let mut certs = decode_certificates(body).ok_or_else(unexpected)?;
                            self.absorb(ty, body);
                            if !certs.is_empty() {
                                let certificate = certs.remove(0);
                                self.remote = Some(RemoteCertificate { certificate, chain: certs });
                            }
                        }
                        Some(HandshakeType::Finished) if !finished => {
                            self.check_finished(client_label, body)?;
                            finished = true;
                        }
                        _ => return Err(unexpected()),
                    }
                }
                if !finished {
                    return Err(unexpected());
                }
                let mut flight = Vec::new();
                self.push_finished(server_label, &mut flight);
                self.handshake_record(&flight, out)?;
                self.state = State::Established;
                Ok(StatusCode::Ok)
            }
            _ => Err(SecurityStatus::new(StatusCode::InvalidToken)),
        }
    }

    fn finish(&mut self, step: Step, out: &mut Vec<u8>) -> SecurityStatus {
        match step {
            Ok(code) => SecurityStatus::new(code),
            Err(status) => {
                trace!(%status, "loopback handshake step failed");
                // keep a fatal alert we just wrote
                if self.state != State::Closed {
                    out.clear();
                }
                status
            }
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl SecurityEngine for LoopbackEngine {
    type Credential = LoopbackCredential;

    fn acquire_credential(&mut self, params: &CredentialParams<'_>) -> Result<LoopbackCredential, SecurityStatus> {
        Ok(LoopbackCredential {
            role: params.role,
            certificate: params.certificate.cloned(),
            protocols: params.protocols,
            client_certificate_required: params.client_certificate_required,
        })
    }

    fn initialize_outbound(
        &mut self,
        credential: &LoopbackCredential,
        target_name: Option<&str>,
        input: &[SecurityBuffer<'_>],
        output: &mut Vec<u8>,
    ) -> SecurityStatus {
        self.unconsumed = 0;
        if let Some((level, desc)) = self.pending_alert.take() {
            let step = self.emit_alert(level, desc, output).map(|_| StatusCode::Ok);
            return self.finish(step, output);
        }
        let step = self.client_step(credential, target_name, input, output);
        self.finish(step, output)
    }

    fn accept_inbound(
        &mut self,
        credential: &LoopbackCredential,
        input: &[SecurityBuffer<'_>],
        output: &mut Vec<u8>,
    ) -> SecurityStatus {
        self.unconsumed = 0;
        if let Some((level, desc)) = self.pending_alert.take() {
            let step = self.emit_alert(level, desc, output).map(|_| StatusCode::Ok);
            return self.finish(step, output);
        }
        let step = self.server_step(credential, input, output);
        self.finish(step, output)
    }

    fn unconsumed_input(&self) -> usize {
        self.unconsumed
    }

    fn encrypt(&mut self, plaintext: &[u8], output: &mut Vec<u8>) -> SecurityStatus {
        match self.state {
            State::Established => {}
            State::RenegotiateRequested | State::RenegotiateReplied => {
                return SecurityStatus::new(StatusCode::TryAgain)
            }
            _ => return SecurityStatus::new(StatusCode::InvalidToken),
        }
        if plaintext.len() > self.max_data_size() {
            return SecurityStatus::new(StatusCode::BufferTooSmall);
        }
        match self.seal(ContentType::ApplicationData, ContentType::ApplicationData, plaintext, output) {
            Ok(()) => SecurityStatus::OK,
            Err(status) => status,
        }
    }

    fn decrypt(&mut self, frame: &mut [u8]) -> Decrypted {
        let failed = |status| Decrypted {
            status,
            offset: 0,
            count: 0,
        };
        if !self.established() {
            return failed(SecurityStatus::new(StatusCode::InvalidToken));
        }
        match self.open(frame) {
            Err(status) => failed(status),
            Ok((ContentType::ApplicationData, len)) => Decrypted {
                status: SecurityStatus::OK,
                offset: RECORD_HEADER_LEN,
                count: len,
            },
            Ok((ContentType::Handshake, len)) => Decrypted {
                status: SecurityStatus::new(StatusCode::Renegotiate),
                offset: RECORD_HEADER_LEN,
                count: len,
            },
            Ok((ContentType::Alert, len)) => {
                let alert = Alert::parse(&frame[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len]);
                match alert {
                    Some(a) if a.description == AlertDescription::CloseNotify => {
                        failed(SecurityStatus::new(StatusCode::ContextExpired))
                    }
                    Some(a) => failed(status(StatusCode::IllegalMessage, a.description.message())),
                    None => failed(status(StatusCode::IllegalMessage, "malformed alert")),
                }
            }
            Ok((ContentType::ChangeCipherSpec, _)) => failed(unexpected()),
        }
    }

    fn session_info(&self) -> Option<SessionInfo> {
        if !self.established() {
            return None;
        }
        Some(SessionInfo {
            protocol: self.protocol?,
            cipher_suite: SUITE,
            header_size: RECORD_HEADER_LEN,
            trailer_size: TRAILER_LEN,
            max_message_size: self.max_data_size() + RECORD_HEADER_LEN + TRAILER_LEN,
            application_protocol: self.application_protocol.clone(),
        })
    }

    fn remote_certificate(&self) -> Option<RemoteCertificate> {
        self.remote.clone()
    }

    fn apply_alert(&mut self, level: AlertLevel, description: AlertDescription) -> SecurityStatus {
        self.pending_alert = Some((level, description));
        SecurityStatus::OK
    }

    fn apply_shutdown(&mut self) -> SecurityStatus {
        self.pending_alert = Some((AlertLevel::Warning, AlertDescription::CloseNotify));
        SecurityStatus::OK
    }

    fn renegotiate(&mut self, _credential: &LoopbackCredential, output: &mut Vec<u8>) -> SecurityStatus {
        if self.role != Some(Role::Server) || self.state != State::Established {
            return SecurityStatus::new(StatusCode::Unsupported);
        }
        if self.protocol == Some(Protocol::Tls13) {
            return SecurityStatus::new(StatusCode::NoRenegotiation);
        }
        let mut flight = Vec::new();
        self.push_message(HandshakeType::HelloRequest, &[], &mut flight);
        self.push_message(HandshakeType::CertificateRequest, &[], &mut flight);
        self.certificate_requested = true;
        if let Err(status) = self.handshake_record(&flight, output) {
            return status;
        }
        self.state = State::RenegotiateRequested;
        SecurityStatus::new(StatusCode::ContinueNeeded)
    }

    fn release(&mut self) {
        self.send = None;
        self.recv = None;
        self.state = State::Closed;
    }
}
