//! Per-stream session state guarded by the session lock.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::cert::Certificate;
use crate::config::AuthOptions;
use crate::engine::{ContextHandle, RemoteCertificate, SecurityEngine, SessionInfo};
use crate::error::{Error, Operation};

/// Coarse lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticating,
    Authenticated,
    ShutDown,
    Faulted,
}

/// Resolves once a renegotiation finishes.
pub(crate) type RenegotiationWait = Shared<oneshot::Receiver<()>>;

struct Waiter {
    done: oneshot::Sender<()>,
    wait: RenegotiationWait,
}

pub(crate) struct Session<E: SecurityEngine> {
    pub context: ContextHandle<E>,
    pub options: Option<AuthOptions>,
    pub credential: Option<Arc<E::Credential>>,
    pub info: Option<SessionInfo>,
    pub max_data_size: usize,
    pub local_certificate: Option<Certificate>,
    pub remote_certificate: Option<RemoteCertificate>,
    /// Set once the server asks for a client certificate mid-session.
    pub remote_certificate_required: bool,
    pub is_renego: bool,
    pub handshake_completed: bool,
    pub authenticating: bool,
    pub shutdown: bool,
    pub disposed: bool,
    fault: Option<Error>,
    waiter: Option<Waiter>,
}

impl<E: SecurityEngine> Session<E> {
    pub fn new(engine: E) -> Self {
        Self {
            context: ContextHandle::new(engine),
            options: None,
            credential: None,
            info: None,
            max_data_size: 0,
            local_certificate: None,
            remote_certificate: None,
            remote_certificate_required: false,
            is_renego: false,
            handshake_completed: false,
            authenticating: false,
            shutdown: false,
            disposed: false,
            fault: None,
            waiter: None,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.fault.is_some() {
            Phase::Faulted
        } else if self.shutdown {
            Phase::ShutDown
        } else if self.authenticating {
            Phase::Authenticating
        } else if self.handshake_completed {
            Phase::Authenticated
        } else {
            Phase::Unauthenticated
        }
    }

    /// Record a fault. The first one sticks.
    pub fn set_fault(&mut self, error: Error) {
        if self.fault.is_none() {
            self.fault = Some(error);
        }
    }

    pub fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    /// Fails with `Disposed` or the stored fault.
    pub fn check_usable(&self) -> Result<(), Error> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        match &self.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    pub fn check_authenticated(&self) -> Result<(), Error> {
        self.check_usable()?;
        if !self.handshake_completed {
            return Err(Error::NotAuthenticated);
        }
        Ok(())
    }

    pub fn check_writable(&self) -> Result<(), Error> {
        self.check_authenticated()?;
        if self.shutdown {
            return Err(Error::WriteAfterShutdown);
        }
        Ok(())
    }

    pub fn options(&self) -> Result<&AuthOptions, Error> {
        self.options.as_ref().ok_or(Error::InvalidState)
    }

    pub fn engine(&mut self) -> Result<&mut E, Error> {
        self.context.get_mut().ok_or(Error::Disposed)
    }

    pub fn is_server(&self) -> bool {
        self.options.as_ref().is_some_and(AuthOptions::is_server)
    }

    // ---- renegotiation waiter ----

    pub fn arm_waiter(&mut self) {
        if self.waiter.is_none() {
            let (done, wait) = oneshot::channel();
            self.waiter = Some(Waiter {
                done,
                wait: wait.shared(),
            });
        }
    }

    pub fn resolve_waiter(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.done.send(());
        }
    }

    pub fn pending_waiter(&self) -> Option<RenegotiationWait> {
        self.waiter.as_ref().map(|w| w.wait.clone())
    }
}

// ---------------------------------------------------------------------------
// Single-flight flags
// ---------------------------------------------------------------------------

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const DISPOSED: u8 = 2;

/// At most one operation of a kind in flight.
pub(crate) struct Nesting(AtomicU8);

impl Nesting {
    pub const fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    pub fn enter(&self, op: Operation) -> Result<NestingGuard<'_>, Error> {
        match self.0.compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(NestingGuard(&self.0)),
            Err(DISPOSED) => Err(Error::Disposed),
            Err(_) => Err(Error::NestedCall(op)),
        }
    }

    /// Force the terminal state. Returns whether the flag was idle.
    pub fn dispose(&self) -> bool {
        self.0.swap(DISPOSED, Ordering::AcqRel) == IDLE
    }

    pub fn is_idle(&self) -> bool {
        self.0.load(Ordering::Acquire) == IDLE
    }
}

pub(crate) struct NestingGuard<'a>(&'a AtomicU8);

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        // a dispose that raced us keeps the flag terminal
        let _ = self
            .0
            .compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }
}
