//! Adapter over tokio `AsyncRead`/`AsyncWrite`.

use ::tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CancellationToken, TransportRead, TransportWrite};
use crate::error::Error;

/// Suspending transport: operations yield to the runtime and can be
/// cancelled while waiting.
#[derive(Debug)]
pub struct Suspending<T>(pub T);

impl<T: AsyncRead + Unpin> TransportRead for Suspending<T> {
    async fn read(&mut self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, Error> {
        cancel
            .guard(async { self.0.read(buf).await.map_err(Error::from) })
            .await
    }
}

impl<T: AsyncWrite + Unpin> TransportWrite for Suspending<T> {
    async fn write(&mut self, buf: &[u8], cancel: &CancellationToken) -> Result<(), Error> {
        cancel
            .guard(async { self.0.write_all(buf).await.map_err(Error::from) })
            .await
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        cancel
            .guard(async { self.0.flush().await.map_err(Error::from) })
            .await
    }
}
