//! Adapter over `std::io` blocking readers and writers.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use super::{CancellationToken, TransportRead, TransportWrite};
use crate::error::Error;

/// Blocking transport. Its futures never return `Pending`, so stream calls
/// over it can be driven with `futures::executor::block_on`.
#[derive(Debug)]
pub struct Blocking<T>(pub T);

impl Blocking<TcpStream> {
    /// Read and write halves sharing one socket.
    pub fn split_tcp(stream: TcpStream) -> std::io::Result<(Self, Self)> {
        let reader = stream.try_clone()?;
        Ok((Blocking(reader), Blocking(stream)))
    }
}

impl<T: Read> TransportRead for Blocking<T> {
    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, Error> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.0.read(buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                result => return result.map_err(Error::from),
            }
        }
    }
}

impl<T: Write> TransportWrite for Blocking<T> {
    async fn write(&mut self, buf: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.0.write_all(buf).map_err(Error::from)
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.0.flush().map_err(Error::from)
    }
}
