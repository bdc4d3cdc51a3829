//! Process-wide credential cache.
//!
//! Streams with the same role, certificate and protocol set share one
//! engine credential. Entries no stream holds any more are swept every
//! `sweep_interval` insertions.

use alloc::sync::Arc;
use std::collections::HashMap;

use tracing::debug;

use crate::cert::Certificate;
use crate::engine::{EnabledProtocols, Role};

/// Insertions between sweeps of unreferenced entries.
pub const SWEEP_INTERVAL: usize = 32;

/// Identity of a cached credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub thumbprint: Option<[u8; 32]>,
    pub protocols: EnabledProtocols,
    pub role: Role,
    pub certificate_required: bool,
}

impl CredentialKey {
    pub fn new(role: Role, certificate: Option<&Certificate>, protocols: EnabledProtocols) -> Self {
        Self {
            thumbprint: certificate.map(Certificate::thumbprint),
            protocols,
            role,
            certificate_required: false,
        }
    }

    pub fn requiring_certificate(mut self, required: bool) -> Self {
        self.certificate_required = required;
        self
    }
}

struct Inner<C> {
    entries: HashMap<CredentialKey, Arc<C>>,
    inserts: usize,
}

pub struct CredentialCache<C> {
    inner: spin::Mutex<Inner<C>>,
    capacity: usize,
    sweep_interval: usize,
}

impl<C> CredentialCache<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                entries: HashMap::new(),
                inserts: 0,
            }),
            capacity,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, interval: usize) -> Self {
        self.sweep_interval = interval.max(1);
        self
    }

    pub fn get(&self, key: &CredentialKey) -> Option<Arc<C>> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Cached credential for `key`, acquiring one with `acquire` on a miss.
    ///
    /// `acquire` runs outside the lock. If two callers race, the first
    /// insertion wins and the other credential is dropped.
    pub fn get_or_try_insert<E>(
        &self,
        key: CredentialKey,
        acquire: impl FnOnce() -> Result<C, E>,
    ) -> Result<Arc<C>, E> {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let credential = acquire()?;
        Ok(self.insert(key, credential))
    }

    /// Insert unless present; returns the cached entry. A full cache hands
    /// back an uncached credential.
    pub fn insert(&self, key: CredentialKey, credential: C) -> Arc<C> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get(&key) {
            return existing.clone();
        }
        inner.inserts += 1;
        if inner.inserts % self.sweep_interval == 0 || inner.entries.len() >= self.capacity {
            let removed = Self::sweep_locked(&mut inner);
            if removed > 0 {
                debug!(removed, "swept unused credentials");
            }
        }
        let credential = Arc::new(credential);
        if inner.entries.len() < self.capacity {
            inner.entries.insert(key, credential.clone());
        }
        credential
    }

    /// Drop entries no stream holds. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        Self::sweep_locked(&mut self.inner.lock())
    }

    fn sweep_locked(inner: &mut Inner<C>) -> usize {
        let before = inner.entries.len();
        inner.entries.retain(|_, c| Arc::strong_count(c) > 1);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Default for CredentialCache<C> {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    fn key(n: u8) -> CredentialKey {
        CredentialKey {
            thumbprint: Some([n; 32]),
            protocols: EnabledProtocols::NONE,
            role: Role::Server,
            certificate_required: false,
        }
    }

    #[test]
    fn hits_share_one_credential() {
        let cache = CredentialCache::new(8);
        let a = cache.get_or_try_insert(key(1), || Ok::<_, ()>(1u32)).unwrap();
        let b = cache
            .get_or_try_insert(key(1), || -> Result<u32, ()> { panic!("acquired twice") })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn acquire_errors_are_not_cached() {
        let cache: CredentialCache<u32> = CredentialCache::new(8);
        assert_eq!(cache.get_or_try_insert(key(1), || Err("nope")), Err("nope"));
        assert!(cache.is_empty());
    }

    #[test]
    fn key_distinguishes_role_and_protocols() {
        let cert = Certificate::new(vec![1, 2, 3], vec![]);
        let server = CredentialKey::new(Role::Server, Some(&cert), EnabledProtocols::NONE);
        let client = CredentialKey::new(Role::Client, Some(&cert), EnabledProtocols::NONE);
        let tls13 = CredentialKey::new(Role::Server, Some(&cert), EnabledProtocols::TLS13);
        assert_ne!(server, client);
        assert_ne!(server, tls13);
        assert_ne!(server, server.requiring_certificate(true));
        assert_eq!(server.thumbprint, Some(cert.thumbprint()));
    }

    #[test]
    fn periodic_sweep_drops_unreferenced() {
        let cache = CredentialCache::new(64).with_sweep_interval(4);
        let held = cache.insert(key(0), 0u32);
        for n in 1..3 {
            drop(cache.insert(key(n), n as u32));
        }
        assert_eq!(cache.len(), 3);
        // fourth insertion triggers a sweep before inserting
        let _fresh = cache.insert(key(9), 9);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(0)).is_some());
        assert!(Arc::ptr_eq(&held, &cache.get(&key(0)).unwrap()));
    }

    #[test]
    fn full_cache_returns_uncached() {
        let cache = CredentialCache::new(1);
        let _a = cache.insert(key(1), 1u32);
        let b = cache.insert(key(2), 2u32);
        assert_eq!(*b, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(2)).is_none());

        drop(_a);
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }
}
