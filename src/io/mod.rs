//! Transport adapters.
//!
//! The stream core is written once against [`TransportRead`] and
//! [`TransportWrite`]. [`Blocking`] wraps `std::io` types and completes every
//! future on first poll; [`Suspending`] wraps tokio I/O.

pub mod blocking;
#[cfg(feature = "tokio")]
pub mod tokio;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Poll, Waker};

use futures::future::{self, Either};
use futures::pin_mut;

use crate::error::Error;

pub use blocking::Blocking;
#[cfg(feature = "tokio")]
pub use self::tokio::Suspending;

/// Byte source for the record layer.
pub trait TransportRead {
    /// Read into `buf`; `Ok(0)` means end of stream (or an empty `buf`).
    fn read(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<usize, Error>>;

    /// Read until at least `min` bytes are in `buf`. Returns the total read,
    /// which is short only at end of stream when `eof_is_error` is false.
    fn read_at_least(
        &mut self,
        buf: &mut [u8],
        min: usize,
        eof_is_error: bool,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<usize, Error>> {
        async move {
            let mut total = 0;
            while total < min {
                let n = self.read(&mut buf[total..], cancel).await?;
                if n == 0 {
                    if eof_is_error {
                        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                    }
                    break;
                }
                total += n;
            }
            Ok(total)
        }
    }
}

/// Byte sink for the record layer.
pub trait TransportWrite {
    /// Write all of `buf`.
    fn write(&mut self, buf: &[u8], cancel: &CancellationToken) -> impl Future<Output = Result<(), Error>>;

    fn flush(&mut self, cancel: &CancellationToken) -> impl Future<Output = Result<(), Error>>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    wakers: std::sync::Mutex<Vec<Waker>>,
}

/// Cooperative cancellation for one or more stream operations.
///
/// Cancelling wakes every operation waiting under the token; they finish
/// with [`Error::Cancelled`]. Clones share state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    /// A token nobody cancels.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        let wakers = core::mem::take(&mut *self.lock_wakers());
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    fn lock_wakers(&self) -> std::sync::MutexGuard<'_, Vec<Waker>> {
        self.state.wakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves once the token is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        future::poll_fn(move |cx| {
            if self.is_cancelled() {
                return Poll::Ready(());
            }
            {
                let mut wakers = self.lock_wakers();
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
            }
            // cancel() may have run between the check and the registration
            if self.is_cancelled() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Run `fut` unless the token fires first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let cancelled = self.cancelled();
        pin_mut!(fut, cancelled);
        match future::select(fut, cancelled).await {
            Either::Left((result, _)) => result,
            Either::Right(((), _)) => Err(Error::Cancelled),
        }
    }
}

impl core::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn guard_passes_results_through() {
        let token = CancellationToken::none();
        let r = block_on(token.guard(async { Ok::<_, Error>(7) }));
        assert_eq!(r.unwrap(), 7);
    }

    #[test]
    fn cancelled_before_start() {
        let token = CancellationToken::none();
        token.cancel();
        let r = block_on(token.guard(async { Ok::<_, Error>(7) }));
        assert!(matches!(r, Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_wakes_pending_operation() {
        let token = CancellationToken::none();
        let fired = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            fired.cancel();
        });
        let r = block_on(token.guard(future::pending::<Result<(), Error>>()));
        assert!(matches!(r, Err(Error::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn read_at_least_stops_at_eof() {
        let mut src = Blocking(&b"abc"[..]);
        let mut buf = [0u8; 8];
        let token = CancellationToken::none();
        let n = block_on(src.read_at_least(&mut buf, 5, false, &token)).unwrap();
        assert_eq!(n, 3);
        let mut src = Blocking(&b"abc"[..]);
        let r = block_on(src.read_at_least(&mut buf, 5, true, &token));
        assert!(matches!(r, Err(Error::Io { .. })));
    }
}
