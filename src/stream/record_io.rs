//! Record-level read and write paths.

use alloc::vec::Vec;

use tracing::{debug, trace};

use super::session::RenegotiationWait;
use super::{ReadSide, SslStream};
use crate::engine::{SecurityEngine, StatusCode};
use crate::error::{Error, Operation};
use crate::io::{CancellationToken, TransportRead, TransportWrite};
use crate::record::{try_get_frame_header, Protocol, MAX_RECORD_PAYLOAD, RECORD_HEADER_LEN};

/// Outcome of one encrypt attempt.
enum Sealed {
    /// This many plaintext bytes are in the output buffer.
    Chunk(usize),
    /// A renegotiation is running; retry once it settles.
    Wait(RenegotiationWait),
}

impl<R: TransportRead, W: TransportWrite, E: SecurityEngine> SslStream<R, W, E> {
    /// Buffer one complete frame and return its size, or 0 on a clean EOF
    /// at a record boundary.
    pub(super) async fn ensure_full_tls_frame(
        &self,
        rs: &mut ReadSide<R>,
        op: Operation,
        estimated: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        let header = loop {
            if let Some(header) = try_get_frame_header(rs.buffer.encrypted(), rs.framing)? {
                break header;
            }
            if rs.buffer.encrypted_length() == 0 {
                // zero-length probe; lets the transport report readiness first
                let _ = rs
                    .transport
                    .read(&mut [], cancel)
                    .await
                    .map_err(|e| e.during(op))?;
            }
            rs.buffer.ensure_available_space(estimated)?;
            let n = rs
                .transport
                .read(rs.buffer.available_mut(), cancel)
                .await
                .map_err(|e| e.during(op))?;
            if n == 0 {
                if rs.buffer.encrypted_length() == 0 {
                    return Ok(0);
                }
                return Err(Error::UnexpectedEof { op });
            }
            rs.buffer.commit(n);
        };
        rs.last_header = Some(header);

        let frame_size = header.frame_size();
        let buffered = rs.buffer.encrypted_length();
        if buffered < frame_size {
            let missing = frame_size - buffered;
            rs.buffer.ensure_available_space(missing)?;
            let n = rs
                .transport
                .read_at_least(rs.buffer.available_mut(), missing, false, cancel)
                .await
                .map_err(|e| e.during(op))?;
            rs.buffer.commit(n);
            if n < missing {
                return Err(Error::UnexpectedEof { op });
            }
        }
        trace!(content_type = ?header.content_type, frame_size, "frame buffered");
        Ok(frame_size)
    }

    /// Decrypt the frame at the front of the buffer in place.
    fn decrypt_data(&self, rs: &mut ReadSide<R>, frame_size: usize) -> Result<StatusCode, Error> {
        let mut session = self.lock_session();
        let result = session
            .engine()?
            .decrypt(&mut rs.buffer.encrypted_mut()[..frame_size]);
        rs.buffer.on_decrypted(result.offset, result.count, frame_size);

        match result.status.code {
            StatusCode::Ok | StatusCode::ContextExpired => Ok(result.status.code),
            StatusCode::Renegotiate => {
                let tls13 = session
                    .info
                    .as_ref()
                    .is_some_and(|i| i.protocol == Protocol::Tls13);
                let allowed = tls13
                    || session.is_renego
                    || session.options.as_ref().is_some_and(|o| o.allow_renegotiation);
                if !allowed {
                    return Err(Error::RenegotiationNotAllowed);
                }
                session.arm_waiter();
                Ok(StatusCode::Renegotiate)
            }
            _ => Err(Error::Decrypt(result.status)),
        }
    }

    pub(super) async fn read_records(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, Error> {
        let _read = self.nested_read.enter(Operation::Read)?;
        self.lock_session().check_authenticated()?;

        let mut rs = self.read_side.lock().await;
        let result = self.read_locked(&mut rs, buf, cancel).await;
        if let Err(error) = &result {
            if error.faults_session() {
                self.fault(error);
            }
        }
        self.settle_buffer(&mut rs);
        result
    }

    async fn read_locked(
        &self,
        rs: &mut ReadSide<R>,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        if rs.buffer.decrypted_length() > 0 {
            return Ok(rs.copy_decrypted(buf));
        }
        if buf.is_empty() {
            if rs.buffer.encrypted_length() == 0 && !rs.received_eof {
                rs.transport
                    .read(&mut [], cancel)
                    .await
                    .map_err(|e| e.during(Operation::Read))?;
            }
            return Ok(0);
        }
        if rs.received_eof {
            return Ok(0);
        }

        loop {
            let frame_size = self
                .ensure_full_tls_frame(rs, Operation::Read, self.config.read_size, cancel)
                .await?;
            if frame_size == 0 {
                rs.received_eof = true;
                return Ok(0);
            }
            let status = self.decrypt_data(rs, frame_size);
            rs.frame_consumed();

            match status? {
                StatusCode::Renegotiate => {
                    let data = rs.take_decrypted();
                    self.reauthenticate(rs, data, cancel).await?;
                }
                StatusCode::ContextExpired => {
                    debug!("peer closed the session");
                    rs.received_eof = true;
                    return Ok(0);
                }
                _ if rs.buffer.decrypted_length() == 0 => {}
                _ => {
                    let copied = rs.copy_decrypted(buf);
                    let copied = copied + self.copy_more(rs, &mut buf[copied..]);
                    if let Some(data) = rs.pending_reauth.take() {
                        // a failure has already faulted the session; the
                        // next call reports it
                        let _ = self.reauthenticate(rs, data, cancel).await;
                    }
                    return Ok(copied);
                }
            }
        }
    }

    /// Top up `buf` from application frames that are already buffered.
    fn copy_more(&self, rs: &mut ReadSide<R>, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() && rs.buffer.decrypted_length() == 0 {
            let Some(frame_size) = rs.next_application_frame() else {
                break;
            };
            let status = self.decrypt_data(rs, frame_size);
            rs.frame_consumed();
            match status {
                Ok(StatusCode::Renegotiate) => {
                    rs.pending_reauth = Some(rs.take_decrypted());
                    break;
                }
                Ok(StatusCode::ContextExpired) => {
                    rs.received_eof = true;
                    break;
                }
                Ok(_) => copied += rs.copy_decrypted(&mut buf[copied..]),
                Err(error) => {
                    // the bytes already copied are delivered; the next call
                    // reports the fault
                    if error.faults_session() {
                        self.fault(&error);
                    }
                    break;
                }
            }
        }
        copied
    }

    /// Peer-initiated handshake: answer with the decrypted handshake bytes.
    async fn reauthenticate(
        &self,
        rs: &mut ReadSide<R>,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        {
            let mut session = self.lock_session();
            session.is_renego = true;
            session.authenticating = true;
        }
        debug!(len = data.len(), "peer started a renegotiation");
        self.force_authentication(rs, false, Some(data), None, cancel)
            .await
    }

    // ---- write ----

    pub(super) async fn write_records(&self, data: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        self.lock_session().check_writable()?;
        if data.is_empty() {
            return Ok(());
        }
        let _write = self.nested_write.enter(Operation::Write)?;
        let result = self.write_locked(data, cancel).await;
        if let Err(error) = &result {
            if error.faults_session() {
                self.fault(error);
            }
        }
        result
    }

    async fn write_locked(&self, mut data: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        let mut out = self.pool.rent_scratch(RECORD_HEADER_LEN + MAX_RECORD_PAYLOAD);
        while !data.is_empty() {
            out.clear();
            let mut writer = self.writer.lock().await;
            match self.encrypt_data(data, &mut out)? {
                Sealed::Wait(wait) => {
                    drop(writer);
                    trace!("write waiting for renegotiation");
                    cancel
                        .guard(async {
                            let _ = wait.await;
                            Ok(())
                        })
                        .await?;
                }
                Sealed::Chunk(n) => {
                    writer
                        .write(&out, cancel)
                        .await
                        .map_err(|e| e.during(Operation::Write))?;
                    writer
                        .flush(cancel)
                        .await
                        .map_err(|e| e.during(Operation::Write))?;
                    data = &data[n..];
                }
            }
        }
        Ok(())
    }

    /// Encrypt the next chunk of `data` unless a renegotiation is pending.
    fn encrypt_data(&self, data: &[u8], out: &mut Vec<u8>) -> Result<Sealed, Error> {
        let mut session = self.lock_session();
        session.check_writable()?;
        if let Some(wait) = session.pending_waiter() {
            return Ok(Sealed::Wait(wait));
        }
        let chunk = data.len().min(session.max_data_size.max(1));
        let status = session.engine()?.encrypt(&data[..chunk], out);
        match status.code {
            StatusCode::Ok => Ok(Sealed::Chunk(chunk)),
            StatusCode::TryAgain => session
                .pending_waiter()
                .map(Sealed::Wait)
                .ok_or(Error::Encrypt(status)),
            _ => Err(Error::Encrypt(status)),
        }
    }

    // ---- shutdown ----

    pub(super) async fn send_shutdown(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let _write = self.nested_write.enter(Operation::Shutdown)?;
        let payload = {
            let mut guard = self.lock_session();
            let session = &mut *guard;
            session.check_writable()?;
            let status = session.engine()?.apply_shutdown();
            if !status.is_ok() {
                return Err(Error::Encrypt(status));
            }
            let mut payload = Vec::new();
            let status = super::handshake::generate_token(session, &[], &mut payload)?;
            if !status.is_ok() {
                return Err(Error::Encrypt(status));
            }
            payload
        };

        let mut writer = self.writer.lock().await;
        writer
            .write(&payload, cancel)
            .await
            .map_err(|e| e.during(Operation::Shutdown))?;
        writer
            .flush(cancel)
            .await
            .map_err(|e| e.during(Operation::Shutdown))?;
        drop(writer);

        self.lock_session().shutdown = true;
        debug!("close_notify sent");
        Ok(())
    }
}
