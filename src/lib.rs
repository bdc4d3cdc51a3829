#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

//! TLS record layer and handshake state machine over an arbitrary duplex
//! byte stream. Cryptography is delegated to a [`SecurityEngine`].

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod buf;
pub mod cert;
pub mod engine;
pub mod error;
pub mod record;

#[cfg(feature = "std")]
pub mod config;
#[cfg(feature = "std")]
pub mod credential;
#[cfg(feature = "std")]
pub mod io;
#[cfg(feature = "std")]
pub mod stream;

pub use buf::BufferPool;
pub use cert::{Certificate, ChainReport, ChainStatus, ChainVerifier, PolicyErrors};
pub use engine::{CipherSuite, EnabledProtocols, Role, SecurityEngine, SecurityStatus, StatusCode};
pub use error::{AuthFailure, AuthenticationError, Error, Operation};
pub use record::Protocol;

#[cfg(feature = "std")]
pub use config::{ClientHelloInfo, ClientOptions, ServerOptions, StreamConfig};
#[cfg(feature = "std")]
pub use credential::CredentialCache;
#[cfg(feature = "std")]
pub use io::{Blocking, CancellationToken, TransportRead, TransportWrite};
#[cfg(feature = "tokio")]
pub use io::Suspending;
#[cfg(feature = "std")]
pub use stream::{Phase, SslStream};
