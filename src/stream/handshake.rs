//! Handshake driver.
//!
//! Alternates engine steps with record exchange until the engine reports
//! success: every outbound token is written and flushed before the next
//! inbound frame is read. On success the remote certificate is checked
//! against the configured policy before the session is usable.

use alloc::sync::Arc;
use alloc::vec::Vec;

use tracing::{debug, trace, warn};

use super::session::Session;
use super::{ReadSide, SslStream};
use crate::cert::{
    alert_for_failure, AnchorVerifier, Certificate, ChainReport, ChainVerifier, KeyUsage,
    PolicyErrors, VerifyRequest,
};
use crate::config::{AuthOptions, ClientHelloInfo, ServerOptionsSelector};
use crate::credential::CredentialKey;
use crate::engine::{
    CredentialParams, InputBuffers, ProtocolToken, RemoteCertificate, Role, SecurityBuffer,
    SecurityEngine, SecurityStatus, StatusCode,
};
use crate::error::{AuthFailure, AuthenticationError, Error, Operation};
use crate::io::{CancellationToken, TransportRead, TransportWrite};
use crate::record::alert::{AlertDescription, AlertLevel};
use crate::record::hello::{try_get_frame_info, HandshakeType};
use crate::record::{create_alert_frame, try_get_frame_header, ContentType, Framing, Protocol};

impl<R: TransportRead, W: TransportWrite, E: SecurityEngine> SslStream<R, W, E> {
    pub(super) async fn authenticate(
        &self,
        options: AuthOptions,
        selector: Option<ServerOptionsSelector>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let _auth = self.nested_auth.enter(Operation::Authenticate)?;
        let receive_first = {
            let mut session = self.lock_session();
            session.check_usable()?;
            if session.handshake_completed || session.authenticating {
                return Err(Error::AlreadyAuthenticated);
            }
            let receive_first = options.is_server();
            debug!(server = receive_first, target = ?options.target_host, "starting handshake");
            session.options = Some(options);
            session.authenticating = true;
            receive_first
        };

        let mut rs = self.read_side.lock().await;
        let result = self
            .force_authentication(&mut rs, receive_first, None, selector.as_ref(), cancel)
            .await;
        self.settle_buffer(&mut rs);
        result
    }

    /// Run a full handshake and settle the session with its outcome.
    pub(super) async fn force_authentication(
        &self,
        rs: &mut ReadSide<R>,
        receive_first: bool,
        reauth_data: Option<Vec<u8>>,
        selector: Option<&ServerOptionsSelector>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let result = self
            .run_handshake(rs, receive_first, reauth_data, selector, cancel)
            .await;
        self.finish_handshake(result)
    }

    fn finish_handshake(&self, result: Result<(), Error>) -> Result<(), Error> {
        if let Err(error) = &result {
            self.fault(error);
        }
        let mut session = self.lock_session();
        session.is_renego = false;
        session.authenticating = false;
        session.resolve_waiter();
        result
    }

    async fn run_handshake(
        &self,
        rs: &mut ReadSide<R>,
        receive_first: bool,
        reauth_data: Option<Vec<u8>>,
        selector: Option<&ServerOptionsSelector>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if !receive_first {
            let (token, _) = self.next_message(reauth_data.as_deref().unwrap_or(&[]))?;
            if token.size() > 0 {
                self.send_token(&token.payload, cancel).await?;
            }
            if token.failed() {
                return Err(AuthenticationError::engine(token.status).into());
            }
            if token.done() {
                return self.complete_handshake(cancel).await;
            }
        }

        loop {
            let token = self.receive_handshake_frame(rs, selector, cancel).await?;
            if token.size() > 0 {
                let sent = self.send_token(&token.payload, cancel).await;
                // an alert riding on a failed token is best-effort
                if !token.failed() {
                    sent?;
                }
            }
            if token.failed() {
                return Err(self.handshake_failure(rs, &token, cancel).await);
            }
            if token.done() {
                break;
            }
        }
        self.complete_handshake(cancel).await
    }

    /// Turn a failed token into the error reported to the caller.
    async fn handshake_failure(
        &self,
        rs: &ReadSide<R>,
        token: &ProtocolToken,
        cancel: &CancellationToken,
    ) -> Error {
        let last = rs.last_header.filter(|h| {
            matches!(
                h.content_type,
                ContentType::Handshake | ContentType::ChangeCipherSpec
            )
        });
        if let (Some(header), 0) = (last, token.size()) {
            debug!(status = %token.status, "rejecting handshake with protocol_version");
            let alert = create_alert_frame(header.version, AlertDescription::ProtocolVersion);
            let _ = self.send_token(&alert, cancel).await;
            return AuthenticationError::engine(token.status).into();
        }
        if let Some(alert) = rs.last_alert.filter(|a| a.is_fatal_error()) {
            return AuthenticationError::alert_received(alert.description, token.status).into();
        }
        AuthenticationError::engine(token.status).into()
    }

    async fn send_token(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        trace!(len = payload.len(), "sending handshake token");
        let mut writer = self.writer.lock().await;
        writer
            .write(payload, cancel)
            .await
            .map_err(|e| e.during(Operation::Authenticate))?;
        writer
            .flush(cancel)
            .await
            .map_err(|e| e.during(Operation::Authenticate))
    }

    async fn receive_handshake_frame(
        &self,
        rs: &mut ReadSide<R>,
        selector: Option<&ServerOptionsSelector>,
        cancel: &CancellationToken,
    ) -> Result<ProtocolToken, Error> {
        let frame_size = self
            .ensure_full_tls_frame(rs, Operation::Authenticate, self.config.handshake_read_size, cancel)
            .await?;
        if frame_size == 0 {
            return Err(Error::UnexpectedEof {
                op: Operation::Authenticate,
            });
        }
        let header = rs.last_header.ok_or(Error::InvalidState)?;
        rs.last_alert = None;

        match header.content_type {
            ContentType::Alert => {
                let info = try_get_frame_info(&rs.buffer.encrypted()[..frame_size], rs.framing)?;
                rs.last_alert = info.and_then(|i| i.alert);
                if let Some(alert) = rs.last_alert.filter(|a| a.is_fatal_error()) {
                    warn!(alert = alert.description.message(), "peer sent fatal alert");
                }
            }
            ContentType::Handshake => self.inspect_client_hello(rs, frame_size, selector).await?,
            ContentType::ApplicationData => {
                let session = self.lock_session();
                let tls13 = session
                    .info
                    .as_ref()
                    .is_some_and(|i| i.protocol == Protocol::Tls13);
                if session.is_renego && !tls13 {
                    return Err(Error::UnexpectedApplicationData);
                }
            }
            ContentType::ChangeCipherSpec => {}
        }

        self.process_tls_frame(rs, frame_size)
    }

    /// Pick up SNI from the first ClientHello and run the options selector.
    async fn inspect_client_hello(
        &self,
        rs: &ReadSide<R>,
        frame_size: usize,
        selector: Option<&ServerOptionsSelector>,
    ) -> Result<(), Error> {
        let first_hello = {
            let session = self.lock_session();
            session.is_server() && !session.is_renego && !session.handshake_completed
        };
        if !first_hello {
            return Ok(());
        }
        let info = try_get_frame_info(&rs.buffer.encrypted()[..frame_size], rs.framing)?;
        let Some(info) = info.filter(|i| i.handshake_type == Some(HandshakeType::ClientHello)) else {
            return Ok(());
        };
        trace!(sni = ?info.server_name, "client hello");
        if let Some(options) = self.lock_session().options.as_mut() {
            options.target_host = info.server_name.clone();
        }

        if let Some(selector) = selector {
            let hello = ClientHelloInfo {
                server_name: info.server_name,
                supported_versions: info.supported_versions.into_iter().collect(),
            };
            let selected = selector(hello).await?;
            debug!("server options selected");
            if let Some(options) = self.lock_session().options.as_mut() {
                options.update_server_options(selected);
            }
        }
        Ok(())
    }

    /// Hand the frame at the front of the buffer to the engine.
    fn process_tls_frame(&self, rs: &mut ReadSide<R>, frame_size: usize) -> Result<ProtocolToken, Error> {
        let mut chunk = frame_size;
        if self.lock_session().is_renego {
            // fold in complete handshake records already buffered
            while let Ok(Some(next)) = try_get_frame_header(&rs.buffer.encrypted()[chunk..], Framing::Ssl3Plus) {
                let folds = matches!(
                    next.content_type,
                    ContentType::Handshake | ContentType::ChangeCipherSpec
                );
                if !folds || chunk + next.frame_size() > rs.buffer.encrypted_length() {
                    break;
                }
                chunk += next.frame_size();
            }
        }
        let (token, unconsumed) = self.next_message(&rs.buffer.encrypted()[..chunk])?;
        // records of a later flight stay buffered; the frame in hand never does
        let kept = unconsumed.min(chunk - frame_size);
        if kept > 0 {
            trace!(kept, "engine left records for the next step");
        }
        rs.buffer.discard_encrypted(chunk - kept);
        rs.frame_consumed();
        Ok(token)
    }

    /// One engine step over `input`. Also returns how many trailing input
    /// bytes the engine left for a later step.
    pub(super) fn next_message(&self, input: &[u8]) -> Result<(ProtocolToken, usize), Error> {
        let mut guard = self.lock_session();
        let session = &mut *guard;

        if session.credential.is_none() {
            let certificate = if session.is_server() {
                let certificate = session
                    .options()?
                    .server_certificate()
                    .ok_or_else(|| AuthenticationError::new(AuthFailure::MissingCertificate))?;
                Some(certificate)
            } else {
                session.local_certificate.clone()
            };
            self.acquire_credential(session, certificate.as_ref())?;
            session.local_certificate = certificate;
        }

        let mut payload = Vec::new();
        let mut status = generate_token(session, input, &mut payload)?;
        let unconsumed = session.context.get().map_or(0, |e| e.unconsumed_input());
        if status.code == StatusCode::CredentialsNeeded && !session.is_server() {
            let remote = session
                .context
                .get()
                .and_then(|e| e.remote_certificate())
                .map(|r| r.certificate);
            let certificate = session.options()?.client_certificate(remote.as_ref());
            debug!(offered = certificate.is_some(), "server asked for a client certificate");
            self.acquire_credential(session, certificate.as_ref())?;
            session.local_certificate = certificate;
            payload.clear();
            status = generate_token(session, &[], &mut payload)?;
        }
        trace!(%status, len = payload.len(), "handshake step");
        Ok((ProtocolToken::new(status, payload), unconsumed))
    }

    fn acquire_credential(&self, session: &mut Session<E>, certificate: Option<&Certificate>) -> Result<(), Error> {
        let options = session.options()?;
        let params = CredentialParams {
            role: options.role,
            certificate,
            protocols: options.enabled_protocols,
            client_certificate_required: options.certificate_required,
        };
        let key = CredentialKey::new(params.role, certificate, params.protocols)
            .requiring_certificate(params.client_certificate_required);

        let engine = session.engine()?;
        let acquired = match &self.credentials {
            Some(cache) => cache.get_or_try_insert(key, || engine.acquire_credential(&params)),
            None => engine.acquire_credential(&params).map(Arc::new),
        };
        let credential = acquired.map_err(|status| AuthenticationError {
            status: Some(status),
            ..AuthenticationError::new(AuthFailure::Credential)
        })?;
        session.credential = Some(credential);
        Ok(())
    }

    /// Record the negotiated parameters once the remote certificate passes.
    async fn complete_handshake(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let rejected = {
            let mut guard = self.lock_session();
            let session = &mut *guard;
            let engine = session.engine()?;
            let info = engine.session_info().ok_or(Error::InvalidState)?;
            let remote = engine.remote_certificate();

            match verify_remote_certificate(session, remote.as_ref()) {
                Ok(()) => {
                    debug!(
                        protocol = ?info.protocol,
                        suite = info.cipher_suite.0,
                        renegotiation = session.is_renego,
                        "handshake complete"
                    );
                    session.max_data_size = info.max_data_size();
                    session.info = Some(info);
                    session.remote_certificate = remote;
                    session.handshake_completed = true;
                    None
                }
                Err(error) => {
                    let description = error.alert().unwrap_or(AlertDescription::CertificateUnknown);
                    let mut payload = Vec::new();
                    let applied = session.engine()?.apply_alert(AlertLevel::Fatal, description);
                    if applied.is_ok() {
                        let _ = generate_token(session, &[], &mut payload);
                    }
                    Some((error, payload))
                }
            }
        };

        match rejected {
            None => Ok(()),
            Some((error, payload)) => {
                warn!(%error, "remote certificate rejected");
                if !payload.is_empty() {
                    let _ = self.send_token(&payload, cancel).await;
                }
                Err(error.into())
            }
        }
    }

    /// Caller-initiated renegotiation.
    pub(super) async fn run_renegotiation(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let _auth = self.nested_auth.enter(Operation::Renegotiate)?;
        let _read = self.nested_read.enter(Operation::Renegotiate)?;
        let _write = self.nested_write.enter(Operation::Renegotiate)?;
        self.lock_session().check_authenticated()?;

        let mut rs = self.read_side.lock().await;
        if rs.buffer.active_length() > 0 {
            return Err(Error::RenegotiateWithUnreadData);
        }

        let token = {
            let mut guard = self.lock_session();
            let session = &mut *guard;
            let credential = session.credential.clone().ok_or(Error::InvalidState)?;
            let mut payload = Vec::new();
            let status = session.engine()?.renegotiate(&credential, &mut payload);
            match status.code {
                StatusCode::NoRenegotiation => {
                    debug!("engine declined renegotiation");
                    return Ok(());
                }
                StatusCode::Unsupported => return Err(Error::RenegotiationUnsupported),
                _ => {}
            }
            session.remote_certificate_required = true;
            session.is_renego = true;
            session.authenticating = true;
            session.arm_waiter();
            ProtocolToken::new(status, payload)
        };
        debug!("renegotiating");

        let result = self.drive_renegotiation(&mut rs, token, cancel).await;
        let result = self.finish_handshake(result);
        self.settle_buffer(&mut rs);
        result
    }

    async fn drive_renegotiation(
        &self,
        rs: &mut ReadSide<R>,
        token: ProtocolToken,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if token.size() > 0 {
            self.send_token(&token.payload, cancel).await?;
        }
        if token.failed() {
            return Err(AuthenticationError::engine(token.status).into());
        }
        if token.status.code == StatusCode::ContinueNeeded {
            self.run_handshake(rs, true, None, None, cancel).await
        } else {
            self.complete_handshake(cancel).await
        }
    }
}

/// Call the engine for one handshake step with the session's credential.
pub(super) fn generate_token<E: SecurityEngine>(
    session: &mut Session<E>,
    input: &[u8],
    output: &mut Vec<u8>,
) -> Result<SecurityStatus, Error> {
    let credential = session.credential.clone().ok_or(Error::InvalidState)?;
    let options = session.options.as_ref().ok_or(Error::InvalidState)?;
    let engine = session.context.get_mut().ok_or(Error::Disposed)?;

    let mut buffers = InputBuffers::new();
    if !input.is_empty() {
        buffers
            .push(SecurityBuffer::token(input))
            .map_err(|_| Error::InvalidState)?;
    }
    if !options.alpn_wire.is_empty() {
        buffers
            .push(SecurityBuffer::application_protocols(&options.alpn_wire))
            .map_err(|_| Error::InvalidState)?;
    }
    let status = match options.role {
        Role::Server => engine.accept_inbound(&credential, &buffers, output),
        Role::Client => engine.initialize_outbound(
            &credential,
            options.target_host.as_deref(),
            &buffers,
            output,
        ),
    };
    Ok(status)
}

/// Apply certificate policy to what the peer presented.
fn verify_remote_certificate<E: SecurityEngine>(
    session: &Session<E>,
    remote: Option<&RemoteCertificate>,
) -> Result<(), Error> {
    let options = session.options()?;
    if let (Some(previous), Some(remote)) = (&session.remote_certificate, remote) {
        if previous.certificate.der() == remote.certificate.der() {
            trace!("remote certificate unchanged");
            return Ok(());
        }
    }

    let is_server = options.is_server();
    let mut policy = PolicyErrors::NONE;
    let mut report = ChainReport::default();
    match remote {
        None => policy |= PolicyErrors::NOT_AVAILABLE,
        Some(remote) => {
            let request = VerifyRequest {
                certificate: &remote.certificate,
                chain: &remote.chain,
                usage: if is_server {
                    KeyUsage::ClientAuth
                } else {
                    KeyUsage::ServerAuth
                },
                revocation: options.revocation_mode,
                trust_anchors: &options.trust_anchors,
            };
            report = match &options.chain_verifier {
                Some(verifier) => verifier.verify(&request),
                None => AnchorVerifier::default().verify(&request),
            };
            if !report.status.is_empty() {
                policy |= PolicyErrors::CHAIN_ERRORS;
            }
            if !is_server {
                if let Some(host) = options.target_host.as_deref() {
                    if !remote.certificate.matches_host(host) {
                        policy |= PolicyErrors::NAME_MISMATCH;
                    }
                }
            }
        }
    }

    let accepted = match &options.validation {
        Some(callback) => callback(remote.map(|r| &r.certificate), &report, policy),
        None => {
            let required =
                !is_server || options.certificate_required || session.remote_certificate_required;
            if !required {
                policy.remove(PolicyErrors::NOT_AVAILABLE);
            }
            policy.is_empty()
        }
    };
    if accepted {
        return Ok(());
    }

    let kind = if options.validation.is_some() {
        AuthFailure::ValidationRejected
    } else {
        AuthFailure::CertificateRejected
    };
    Err(AuthenticationError {
        kind,
        alert: Some(alert_for_failure(policy, report.status)),
        status: None,
        policy_errors: policy,
        chain_status: report.status,
    }
    .into())
}
