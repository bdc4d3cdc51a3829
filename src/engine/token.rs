//! One handshake step's output.

use alloc::vec::Vec;

use super::{SecurityStatus, StatusCode};

/// Token produced by a handshake step: bytes to send plus the step status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolToken {
    pub status: SecurityStatus,
    pub payload: Vec<u8>,
}

impl ProtocolToken {
    pub fn new(status: SecurityStatus, payload: Vec<u8>) -> Self {
        Self { status, payload }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The handshake finished successfully.
    pub fn done(&self) -> bool {
        self.status.code == StatusCode::Ok
    }

    /// Neither success nor a request for another round trip.
    pub fn failed(&self) -> bool {
        !matches!(self.status.code, StatusCode::Ok | StatusCode::ContinueNeeded)
    }

    /// The failure status, unless the token is done.
    pub fn error(&self) -> Option<SecurityStatus> {
        (!self.done()).then_some(self.status)
    }
}
