//! Encrypted stream over a duplex transport.
//!
//! `SslStream` owns the read half, the write half and one engine context.
//! The handshake driver (`handshake`) and the record I/O paths (`record_io`)
//! are written once against the transport traits; the blocking and
//! suspending front ends below only pick the executor.
//!
//! Locks, outermost first: the read side (held for a whole read or
//! handshake), the writer (held for one write + flush), the session
//! (never held across an await).

mod handshake;
mod record_io;
mod session;

pub use session::Phase;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::sync::{MutexGuard, PoisonError};

use futures::lock::Mutex;
use tracing::{debug, warn};

use crate::buf::BufferPool;
use crate::cert::Certificate;
use crate::config::{ClientOptions, ServerOptions, ServerOptionsSelector, StreamConfig};
use crate::credential::CredentialCache;
use crate::engine::{CipherSuite, SecurityEngine};
use crate::error::Error;
use crate::io::{Blocking, CancellationToken, TransportRead, TransportWrite};
use crate::record::alert::Alert;
use crate::record::buffer::FrameBuffer;
use crate::record::{try_get_frame_header, ContentType, FrameHeader, Framing, Protocol};
use session::{Nesting, Session};

/// Inbound half: transport, record buffer and what the last frame looked like.
struct ReadSide<R> {
    transport: R,
    buffer: FrameBuffer,
    framing: Framing,
    last_header: Option<FrameHeader>,
    last_alert: Option<Alert>,
    received_eof: bool,
    /// Post-handshake handshake bytes decrypted while topping up a read.
    pending_reauth: Option<Vec<u8>>,
}

impl<R> ReadSide<R> {
    fn new(transport: R, pool: Arc<BufferPool>) -> Self {
        Self {
            transport,
            buffer: FrameBuffer::new(pool),
            framing: Framing::Unknown,
            last_header: None,
            last_alert: None,
            received_eof: false,
            pending_reauth: None,
        }
    }

    /// Only the first record may use SSLv2 framing.
    fn frame_consumed(&mut self) {
        self.framing = Framing::Ssl3Plus;
    }

    fn copy_decrypted(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.buffer.decrypted_length());
        buf[..n].copy_from_slice(&self.buffer.decrypted()[..n]);
        self.buffer.discard(n);
        n
    }

    fn take_decrypted(&mut self) -> Vec<u8> {
        let data = self.buffer.decrypted().to_vec();
        self.buffer.discard(data.len());
        data
    }

    /// Size of the next frame if it is application data and fully buffered.
    fn next_application_frame(&mut self) -> Option<usize> {
        let header = try_get_frame_header(self.buffer.encrypted(), self.framing)
            .ok()
            .flatten()?;
        if header.content_type != ContentType::ApplicationData
            || header.frame_size() > self.buffer.encrypted_length()
        {
            return None;
        }
        self.last_header = Some(header);
        Some(header.frame_size())
    }
}

/// A TLS session over a read half `R` and a write half `W`, driven by the
/// security engine `E`.
///
/// One read, one write and one handshake may be in flight at a time; a
/// second concurrent call of the same kind fails with
/// [`Error::NestedCall`]. Reads and writes may overlap.
pub struct SslStream<R, W, E: SecurityEngine> {
    read_side: Mutex<ReadSide<R>>,
    writer: Mutex<W>,
    session: std::sync::Mutex<Session<E>>,
    nested_read: Nesting,
    nested_write: Nesting,
    nested_auth: Nesting,
    config: StreamConfig,
    pool: Arc<BufferPool>,
    credentials: Option<Arc<CredentialCache<E::Credential>>>,
}

impl<R, W, E: SecurityEngine> SslStream<R, W, E> {
    pub fn new(reader: R, writer: W, engine: E) -> Self {
        let pool = Arc::new(BufferPool::default());
        Self {
            read_side: Mutex::new(ReadSide::new(reader, pool.clone())),
            writer: Mutex::new(writer),
            session: std::sync::Mutex::new(Session::new(engine)),
            nested_read: Nesting::new(),
            nested_write: Nesting::new(),
            nested_auth: Nesting::new(),
            config: StreamConfig::default(),
            pool,
            credentials: None,
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Share engine credentials with other streams through `cache`.
    pub fn credential_cache(mut self, cache: Arc<CredentialCache<E::Credential>>) -> Self {
        self.credentials = Some(cache);
        self
    }

    /// Rent record and scratch buffers from `pool`.
    pub fn buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.read_side.get_mut().buffer = FrameBuffer::new(pool.clone());
        self.pool = pool;
        self
    }

    fn lock_session(&self) -> MutexGuard<'_, Session<E>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the record buffer back once drained, or drop it after disposal.
    fn settle_buffer(&self, rs: &mut ReadSide<R>) {
        if self.lock_session().disposed {
            rs.buffer.reset();
        } else {
            rs.buffer.return_buffer();
        }
    }

    /// Record a fault; the engine context is released with it.
    fn fault(&self, error: &Error) {
        let mut session = self.lock_session();
        if session.fault().is_none() && !session.disposed {
            warn!(%error, "session faulted");
        }
        session.set_fault(error.clone());
        session.context.release();
        session.credential = None;
        session.resolve_waiter();
    }

    // ---- properties ----

    pub fn phase(&self) -> Phase {
        self.lock_session().phase()
    }

    pub fn is_authenticated(&self) -> bool {
        let session = self.lock_session();
        session.handshake_completed && session.fault().is_none()
    }

    pub fn is_server(&self) -> bool {
        self.lock_session().is_server()
    }

    /// Both sides presented a certificate.
    pub fn is_mutually_authenticated(&self) -> bool {
        let session = self.lock_session();
        session.handshake_completed
            && session.local_certificate.is_some()
            && session.remote_certificate.is_some()
    }

    pub fn negotiated_protocol(&self) -> Option<Protocol> {
        self.lock_session().info.as_ref().map(|i| i.protocol)
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.lock_session().info.as_ref().map(|i| i.cipher_suite)
    }

    pub fn negotiated_application_protocol(&self) -> Option<Vec<u8>> {
        self.lock_session()
            .info
            .as_ref()
            .and_then(|i| i.application_protocol.clone())
    }

    pub fn local_certificate(&self) -> Option<Certificate> {
        self.lock_session().local_certificate.clone()
    }

    pub fn remote_certificate(&self) -> Option<Certificate> {
        self.lock_session()
            .remote_certificate
            .as_ref()
            .map(|r| r.certificate.clone())
    }

    /// SNI name: the target on a client, the requested name on a server.
    pub fn target_host_name(&self) -> Option<String> {
        self.lock_session()
            .options
            .as_ref()
            .and_then(|o| o.target_host.clone())
    }

    /// Largest plaintext carried by one record.
    pub fn max_data_size(&self) -> usize {
        self.lock_session().max_data_size
    }

    /// Tear the session down. Idempotent; also runs on drop.
    ///
    /// Operations in flight finish with [`Error::Disposed`] at their next
    /// check. The record buffer goes back to the pool now if no read or
    /// handshake holds it, otherwise when that operation exits.
    pub fn dispose(&self) {
        {
            let mut session = self.lock_session();
            if session.disposed {
                return;
            }
            session.disposed = true;
            session.set_fault(Error::Disposed);
            session.context.release();
            session.credential = None;
            session.resolve_waiter();
        }
        let read_idle = self.nested_read.dispose();
        let auth_idle = self.nested_auth.dispose();
        self.nested_write.dispose();
        if read_idle && auth_idle {
            if let Some(mut read_side) = self.read_side.try_lock() {
                read_side.buffer.reset();
            }
        }
        debug!("stream disposed");
    }
}

impl<R, W, E: SecurityEngine> Drop for SslStream<R, W, E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ---------------------------------------------------------------------------
// Operations with explicit cancellation
// ---------------------------------------------------------------------------

impl<R: TransportRead, W: TransportWrite, E: SecurityEngine> SslStream<R, W, E> {
    pub async fn authenticate_as_client_with_cancellation(
        &self,
        options: ClientOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.authenticate(options.into(), None, cancel).await
    }

    pub async fn authenticate_as_server_with_cancellation(
        &self,
        options: ServerOptions,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.authenticate(options.into(), None, cancel).await
    }

    /// Server handshake whose options are picked from the ClientHello.
    pub async fn authenticate_with_options_selector(
        &self,
        selector: ServerOptionsSelector,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.authenticate(ServerOptions::default().into(), Some(selector), cancel)
            .await
    }

    /// Read decrypted bytes; `Ok(0)` once the peer has closed.
    pub async fn read_with_cancellation(
        &self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        self.read_records(buf, cancel).await
    }

    /// Encrypt and send all of `data`.
    pub async fn write_with_cancellation(
        &self,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.write_records(data, cancel).await
    }

    /// Send close_notify. Reading stays possible.
    pub async fn shutdown_with_cancellation(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.send_shutdown(cancel).await
    }

    /// Start a renegotiation from our side.
    pub async fn renegotiate_with_cancellation(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.run_renegotiation(cancel).await
    }
}

// ---------------------------------------------------------------------------
// Suspending front end
// ---------------------------------------------------------------------------

#[cfg(feature = "tokio")]
mod suspending {
    use ::tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

    use super::*;
    use crate::io::Suspending;

    impl<T, E> SslStream<Suspending<ReadHalf<T>>, Suspending<WriteHalf<T>>, E>
    where
        T: AsyncRead + AsyncWrite,
        E: SecurityEngine,
    {
        /// Wrap a tokio duplex stream.
        pub fn from_tokio(stream: T, engine: E) -> Self {
            let (reader, writer) = ::tokio::io::split(stream);
            Self::new(Suspending(reader), Suspending(writer), engine)
        }
    }

    impl<R, W, E> SslStream<Suspending<R>, Suspending<W>, E>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        E: SecurityEngine,
    {
        pub async fn authenticate_as_client(&self, options: ClientOptions) -> Result<(), Error> {
            self.authenticate_as_client_with_cancellation(options, &CancellationToken::none())
                .await
        }

        pub async fn authenticate_as_server(&self, options: ServerOptions) -> Result<(), Error> {
            self.authenticate_as_server_with_cancellation(options, &CancellationToken::none())
                .await
        }

        pub async fn authenticate_as_server_with_selector(
            &self,
            selector: ServerOptionsSelector,
        ) -> Result<(), Error> {
            self.authenticate_with_options_selector(selector, &CancellationToken::none())
                .await
        }

        pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
            self.read_with_cancellation(buf, &CancellationToken::none()).await
        }

        pub async fn write(&self, data: &[u8]) -> Result<(), Error> {
            self.write_with_cancellation(data, &CancellationToken::none()).await
        }

        pub async fn shutdown(&self) -> Result<(), Error> {
            self.shutdown_with_cancellation(&CancellationToken::none()).await
        }

        pub async fn renegotiate(&self) -> Result<(), Error> {
            self.renegotiate_with_cancellation(&CancellationToken::none()).await
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking front end
// ---------------------------------------------------------------------------

impl<E: SecurityEngine> SslStream<Blocking<std::net::TcpStream>, Blocking<std::net::TcpStream>, E> {
    pub fn from_tcp(stream: std::net::TcpStream, engine: E) -> std::io::Result<Self> {
        let (reader, writer) = Blocking::split_tcp(stream)?;
        Ok(Self::new(reader, writer, engine))
    }
}

impl<R, W, E> SslStream<Blocking<R>, Blocking<W>, E>
where
    R: std::io::Read,
    W: std::io::Write,
    E: SecurityEngine,
{
    pub fn authenticate_as_client(&self, options: ClientOptions) -> Result<(), Error> {
        futures::executor::block_on(
            self.authenticate_as_client_with_cancellation(options, &CancellationToken::none()),
        )
    }

    pub fn authenticate_as_server(&self, options: ServerOptions) -> Result<(), Error> {
        futures::executor::block_on(
            self.authenticate_as_server_with_cancellation(options, &CancellationToken::none()),
        )
    }

    pub fn authenticate_as_server_with_selector(&self, selector: ServerOptionsSelector) -> Result<(), Error> {
        futures::executor::block_on(
            self.authenticate_with_options_selector(selector, &CancellationToken::none()),
        )
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        futures::executor::block_on(self.read_with_cancellation(buf, &CancellationToken::none()))
    }

    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        futures::executor::block_on(self.write_with_cancellation(data, &CancellationToken::none()))
    }

    pub fn shutdown(&self) -> Result<(), Error> {
        futures::executor::block_on(self.shutdown_with_cancellation(&CancellationToken::none()))
    }

    pub fn renegotiate(&self) -> Result<(), Error> {
        futures::executor::block_on(self.renegotiate_with_cancellation(&CancellationToken::none()))
    }
}
