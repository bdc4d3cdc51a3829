//! Shared fixtures: an in-memory blocking pipe and loopback stream pairs.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use milli_sslstream::engine::loopback::{LoopbackConfig, LoopbackEngine};
use milli_sslstream::{Blocking, Certificate, ClientOptions, Error, ServerOptions, SslStream};

// =========================================================================
// Blocking pipe
// =========================================================================

#[derive(Default)]
struct Channel {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Clone, Default)]
struct Shared(Arc<(Mutex<Channel>, Condvar)>);

/// Read end of a one-way pipe. Blocks until data arrives or the writer drops.
pub struct PipeReader {
    shared: Shared,
    /// Most bytes handed out per read.
    chunk: usize,
}

/// Write end of a one-way pipe. Dropping it signals end of stream.
pub struct PipeWriter(Shared);

pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Shared::default();
    let reader = PipeReader {
        shared: shared.clone(),
        chunk: usize::MAX,
    };
    (PipeWriter(shared), reader)
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (lock, ready) = &*self.shared.0;
        let mut ch = lock.lock().unwrap();
        while ch.data.is_empty() && !ch.closed {
            ch = ready.wait(ch).unwrap();
        }
        let n = buf.len().min(ch.data.len()).min(self.chunk);
        for (dst, src) in buf.iter_mut().zip(ch.data.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl PipeReader {
    /// Hand out one byte per read.
    pub fn trickle(mut self) -> Self {
        self.chunk = 1;
        self
    }
}

impl PipeWriter {
    pub fn close(&self) {
        let (lock, ready) = &*self.0 .0;
        lock.lock().unwrap().closed = true;
        ready.notify_all();
    }

    /// A second handle for pushing raw bytes past the stream that owns this
    /// writer.
    pub fn injector(&self) -> Injector {
        Injector(self.0.clone())
    }
}

pub struct Injector(Shared);

impl Injector {
    pub fn push(&self, bytes: &[u8]) {
        let (lock, ready) = &*self.0 .0;
        lock.lock().unwrap().data.extend(bytes);
        ready.notify_all();
    }

    pub fn close(&self) {
        let (lock, ready) = &*self.0 .0;
        lock.lock().unwrap().closed = true;
        ready.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, ready) = &*self.0 .0;
        let mut ch = lock.lock().unwrap();
        if ch.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        ch.data.extend(buf);
        ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Two pipes crossed: `(a_reader, a_writer), (b_reader, b_writer)`.
pub fn duplex() -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (a_to_b, b_from_a) = pipe();
    let (b_to_a, a_from_b) = pipe();
    ((a_from_b, a_to_b), (b_from_a, b_to_a))
}

// =========================================================================
// Certificates and options
// =========================================================================

pub fn server_cert() -> Certificate {
    Certificate::new(b"loopback server".to_vec(), vec!["localhost".to_string()])
}

pub fn client_cert() -> Certificate {
    Certificate::new(b"loopback client".to_vec(), vec!["client".to_string()])
}

/// Client options that trust the loopback server certificate.
pub fn client_options() -> ClientOptions {
    let mut options = ClientOptions::new("localhost");
    options.trust_anchors.push(server_cert());
    options
}

pub fn server_options() -> ServerOptions {
    ServerOptions::new(server_cert())
}

// =========================================================================
// Stream pairs
// =========================================================================

pub type PipeStream = SslStream<Blocking<PipeReader>, Blocking<PipeWriter>, LoopbackEngine>;

pub fn pipe_stream(reader: PipeReader, writer: PipeWriter, config: &LoopbackConfig) -> PipeStream {
    SslStream::new(Blocking(reader), Blocking(writer), LoopbackEngine::new(config.clone()))
}

/// Unauthenticated client and server streams over a fresh duplex pipe.
pub fn pair(config: &LoopbackConfig) -> (PipeStream, PipeStream) {
    let ((cr, cw), (sr, sw)) = duplex();
    (pipe_stream(cr, cw, config), pipe_stream(sr, sw, config))
}

/// Run both handshakes; the server side runs on its own thread.
pub fn handshake(
    client: PipeStream,
    server: PipeStream,
    client_options: ClientOptions,
    server_options: ServerOptions,
) -> (PipeStream, Result<(), Error>, PipeStream, Result<(), Error>) {
    let server_thread = thread::spawn(move || {
        let result = server.authenticate_as_server(server_options);
        (server, result)
    });
    let client_result = client.authenticate_as_client(client_options);
    let (server, server_result) = server_thread.join().unwrap();
    (client, client_result, server, server_result)
}

/// An authenticated pair with default options.
pub fn connected(config: LoopbackConfig) -> (PipeStream, PipeStream) {
    let (client, server) = pair(&config);
    let (client, cr, server, sr) = handshake(client, server, client_options(), server_options());
    cr.unwrap();
    sr.unwrap();
    (client, server)
}
