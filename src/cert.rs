//! Certificates, chain reports and the alert policy for rejected peers.
//!
//! Chain building and trust evaluation sit behind `ChainVerifier`. This
//! module turns a verifier's report into policy errors and picks the alert
//! sent to the peer when a certificate is rejected.

use alloc::string::String;
use alloc::vec::Vec;
use sha2::{Digest, Sha256};

use crate::record::alert::AlertDescription;

/// An encoded certificate plus the host names it covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    der: Vec<u8>,
    names: Vec<String>,
}

impl Certificate {
    pub fn new(der: Vec<u8>, names: Vec<String>) -> Self {
        Self { der, names }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// SHA-256 of the encoded certificate.
    pub fn thumbprint(&self) -> [u8; 32] {
        Sha256::digest(&self.der).into()
    }

    /// Match `host` against the covered names; `*.` covers exactly one label.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        self.names.iter().any(|name| {
            if let Some(suffix) = name.strip_prefix("*.") {
                match host.split_once('.') {
                    Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
                    None => false,
                }
            } else {
                name.eq_ignore_ascii_case(host)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Chain-building status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChainStatus(u32);

impl ChainStatus {
    pub const NO_ERROR: Self = Self(0);
    pub const NOT_TIME_VALID: Self = Self(1 << 0);
    pub const NOT_TIME_NESTED: Self = Self(1 << 1);
    pub const REVOKED: Self = Self(1 << 2);
    pub const NOT_SIGNATURE_VALID: Self = Self(1 << 3);
    pub const NOT_VALID_FOR_USAGE: Self = Self(1 << 4);
    pub const UNTRUSTED_ROOT: Self = Self(1 << 5);
    pub const REVOCATION_STATUS_UNKNOWN: Self = Self(1 << 6);
    pub const CYCLIC: Self = Self(1 << 7);
    pub const INVALID_EXTENSION: Self = Self(1 << 8);
    pub const INVALID_POLICY_CONSTRAINTS: Self = Self(1 << 9);
    pub const INVALID_BASIC_CONSTRAINTS: Self = Self(1 << 10);
    pub const INVALID_NAME_CONSTRAINTS: Self = Self(1 << 11);
    pub const PARTIAL_CHAIN: Self = Self(1 << 16);
    pub const CTL_NOT_TIME_VALID: Self = Self(1 << 17);
    pub const CTL_NOT_SIGNATURE_VALID: Self = Self(1 << 18);
    pub const CTL_NOT_VALID_FOR_USAGE: Self = Self(1 << 19);
    pub const OFFLINE_REVOCATION: Self = Self(1 << 24);
    pub const NO_ISSUANCE_CHAIN_POLICY: Self = Self(1 << 25);
    pub const EXPLICIT_DISTRUST: Self = Self(1 << 26);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl core::ops::BitOr for ChainStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ChainStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Why a remote certificate failed policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PolicyErrors(u8);

impl PolicyErrors {
    pub const NONE: Self = Self(0);
    pub const NOT_AVAILABLE: Self = Self(1 << 0);
    pub const NAME_MISMATCH: Self = Self(1 << 1);
    pub const CHAIN_ERRORS: Self = Self(1 << 2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for PolicyErrors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for PolicyErrors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Extended key usage the chain must allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    ServerAuth,
    ClientAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationMode {
    #[default]
    NoCheck,
    Online,
    Offline,
}

/// Inputs to one chain evaluation.
pub struct VerifyRequest<'a> {
    pub certificate: &'a Certificate,
    /// Intermediates supplied by the peer.
    pub chain: &'a [Certificate],
    pub usage: KeyUsage,
    pub revocation: RevocationMode,
    /// Caller-supplied trust anchors.
    pub trust_anchors: &'a [Certificate],
}

/// Result of one chain evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub status: ChainStatus,
    pub chain: Vec<Certificate>,
}

/// Builds and evaluates a certificate chain.
pub trait ChainVerifier: Send + Sync {
    fn verify(&self, request: &VerifyRequest<'_>) -> ChainReport;
}

impl<F> ChainVerifier for F
where
    F: Fn(&VerifyRequest<'_>) -> ChainReport + Send + Sync,
{
    fn verify(&self, request: &VerifyRequest<'_>) -> ChainReport {
        self(request)
    }
}

/// Trusts a chain that contains one of the anchors, byte for byte.
#[derive(Debug, Clone, Default)]
pub struct AnchorVerifier {
    anchors: Vec<Certificate>,
    revoked: Vec<[u8; 32]>,
}

impl AnchorVerifier {
    pub fn new(anchors: Vec<Certificate>) -> Self {
        Self {
            anchors,
            revoked: Vec::new(),
        }
    }

    /// Mark a certificate thumbprint as revoked.
    pub fn revoke(&mut self, thumbprint: [u8; 32]) {
        self.revoked.push(thumbprint);
    }
}

impl ChainVerifier for AnchorVerifier {
    fn verify(&self, request: &VerifyRequest<'_>) -> ChainReport {
        let mut chain = Vec::with_capacity(1 + request.chain.len());
        chain.push(request.certificate.clone());
        chain.extend(request.chain.iter().cloned());

        let mut status = ChainStatus::NO_ERROR;
        let trusted = chain.iter().any(|c| {
            request
                .trust_anchors
                .iter()
                .chain(self.anchors.iter())
                .any(|a| a.der() == c.der())
        });
        if !trusted {
            status |= ChainStatus::UNTRUSTED_ROOT;
        }
        if request.revocation != RevocationMode::NoCheck
            && chain.iter().any(|c| self.revoked.contains(&c.thumbprint()))
        {
            status |= ChainStatus::REVOKED;
        }
        ChainReport { status, chain }
    }
}

// ---------------------------------------------------------------------------
// Alert policy
// ---------------------------------------------------------------------------

/// Alert describing a chain failure.
pub fn alert_for_chain_status(status: ChainStatus) -> AlertDescription {
    const UNKNOWN_CA: ChainStatus = ChainStatus(
        ChainStatus::UNTRUSTED_ROOT.0 | ChainStatus::PARTIAL_CHAIN.0 | ChainStatus::CYCLIC.0,
    );
    const REVOKED: ChainStatus =
        ChainStatus(ChainStatus::REVOKED.0 | ChainStatus::OFFLINE_REVOCATION.0);
    const EXPIRED: ChainStatus = ChainStatus(
        ChainStatus::NOT_TIME_VALID.0
            | ChainStatus::NOT_TIME_NESTED.0
            | ChainStatus::CTL_NOT_TIME_VALID.0,
    );
    const BAD: ChainStatus = ChainStatus(
        ChainStatus::NOT_SIGNATURE_VALID.0
            | ChainStatus::CTL_NOT_SIGNATURE_VALID.0
            | ChainStatus::INVALID_EXTENSION.0
            | ChainStatus::INVALID_POLICY_CONSTRAINTS.0
            | ChainStatus::NO_ISSUANCE_CHAIN_POLICY.0
            | ChainStatus::NOT_VALID_FOR_USAGE.0,
    );

    if status.is_empty() {
        AlertDescription::BadCertificate
    } else if status.intersects(UNKNOWN_CA) {
        AlertDescription::UnknownCa
    } else if status.intersects(REVOKED) {
        AlertDescription::CertificateRevoked
    } else if status.intersects(EXPIRED) {
        AlertDescription::CertificateExpired
    } else if status.intersects(ChainStatus::CTL_NOT_VALID_FOR_USAGE) {
        AlertDescription::UnsupportedCertificate
    } else if status.intersects(BAD) {
        AlertDescription::BadCertificate
    } else {
        AlertDescription::CertificateUnknown
    }
}

/// Alert sent when the remote certificate is rejected.
pub fn alert_for_failure(policy: PolicyErrors, status: ChainStatus) -> AlertDescription {
    if policy == PolicyErrors::CHAIN_ERRORS {
        alert_for_chain_status(status)
    } else if policy == PolicyErrors::NAME_MISMATCH {
        AlertDescription::BadCertificate
    } else {
        AlertDescription::CertificateUnknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn cert(der: &[u8], names: &[&str]) -> Certificate {
        Certificate::new(der.to_vec(), names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn host_matching() {
        let c = cert(b"c", &["example.com", "*.api.example.com"]);
        assert!(c.matches_host("example.com"));
        assert!(c.matches_host("EXAMPLE.com."));
        assert!(c.matches_host("v1.api.example.com"));
        assert!(!c.matches_host("a.b.api.example.com"));
        assert!(!c.matches_host("api.example.com"));
        assert!(!c.matches_host("other.org"));
    }

    #[test]
    fn thumbprint_is_sha256() {
        let c = cert(b"abc", &[]);
        assert_eq!(
            c.thumbprint(),
            hex_literal::hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn chain_status_alerts() {
        assert_eq!(alert_for_chain_status(ChainStatus::UNTRUSTED_ROOT), AlertDescription::UnknownCa);
        assert_eq!(alert_for_chain_status(ChainStatus::PARTIAL_CHAIN), AlertDescription::UnknownCa);
        assert_eq!(alert_for_chain_status(ChainStatus::CYCLIC), AlertDescription::UnknownCa);
        assert_eq!(alert_for_chain_status(ChainStatus::REVOKED), AlertDescription::CertificateRevoked);
        assert_eq!(
            alert_for_chain_status(ChainStatus::OFFLINE_REVOCATION),
            AlertDescription::CertificateRevoked
        );
        assert_eq!(
            alert_for_chain_status(ChainStatus::NOT_TIME_VALID),
            AlertDescription::CertificateExpired
        );
        assert_eq!(
            alert_for_chain_status(ChainStatus::CTL_NOT_TIME_VALID),
            AlertDescription::CertificateExpired
        );
        assert_eq!(
            alert_for_chain_status(ChainStatus::CTL_NOT_VALID_FOR_USAGE),
            AlertDescription::UnsupportedCertificate
        );
        assert_eq!(
            alert_for_chain_status(ChainStatus::NOT_SIGNATURE_VALID),
            AlertDescription::BadCertificate
        );
        assert_eq!(
            alert_for_chain_status(ChainStatus::INVALID_POLICY_CONSTRAINTS),
            AlertDescription::BadCertificate
        );
        assert_eq!(
            alert_for_chain_status(ChainStatus::REVOCATION_STATUS_UNKNOWN),
            AlertDescription::CertificateUnknown
        );
        assert_eq!(alert_for_chain_status(ChainStatus::NO_ERROR), AlertDescription::BadCertificate);
    }

    #[test]
    fn policy_alerts() {
        let untrusted = ChainStatus::UNTRUSTED_ROOT;
        assert_eq!(
            alert_for_failure(PolicyErrors::CHAIN_ERRORS, untrusted),
            AlertDescription::UnknownCa
        );
        assert_eq!(
            alert_for_failure(PolicyErrors::CHAIN_ERRORS, ChainStatus::REVOKED),
            AlertDescription::CertificateRevoked
        );
        assert_eq!(
            alert_for_failure(PolicyErrors::CHAIN_ERRORS, ChainStatus::NOT_TIME_VALID),
            AlertDescription::CertificateExpired
        );
        assert_eq!(
            alert_for_failure(PolicyErrors::NAME_MISMATCH, ChainStatus::NO_ERROR),
            AlertDescription::BadCertificate
        );
        // combinations and a missing certificate fall back to certificate_unknown
        assert_eq!(
            alert_for_failure(PolicyErrors::NAME_MISMATCH | PolicyErrors::CHAIN_ERRORS, untrusted),
            AlertDescription::CertificateUnknown
        );
        assert_eq!(
            alert_for_failure(PolicyErrors::NOT_AVAILABLE, ChainStatus::NO_ERROR),
            AlertDescription::CertificateUnknown
        );
    }

    #[test]
    fn anchor_verifier_trusts_pinned_chain() {
        let root = cert(b"root", &[]);
        let leaf = cert(b"leaf", &["example.com"]);
        let verifier = AnchorVerifier::new(vec![root.clone()]);

        let report = verifier.verify(&VerifyRequest {
            certificate: &leaf,
            chain: core::slice::from_ref(&root),
            usage: KeyUsage::ServerAuth,
            revocation: RevocationMode::NoCheck,
            trust_anchors: &[],
        });
        assert!(report.status.is_empty());
        assert_eq!(report.chain.len(), 2);

        let report = verifier.verify(&VerifyRequest {
            certificate: &leaf,
            chain: &[],
            usage: KeyUsage::ServerAuth,
            revocation: RevocationMode::NoCheck,
            trust_anchors: &[],
        });
        assert!(report.status.contains(ChainStatus::UNTRUSTED_ROOT));
    }

    #[test]
    fn anchor_verifier_revocation_requires_checking() {
        let leaf = cert(b"leaf", &[]);
        let mut verifier = AnchorVerifier::new(vec![leaf.clone()]);
        verifier.revoke(leaf.thumbprint());

        let mut request = VerifyRequest {
            certificate: &leaf,
            chain: &[],
            usage: KeyUsage::ClientAuth,
            revocation: RevocationMode::NoCheck,
            trust_anchors: &[],
        };
        assert!(verifier.verify(&request).status.is_empty());
        request.revocation = RevocationMode::Online;
        assert_eq!(verifier.verify(&request).status, ChainStatus::REVOKED);
    }

    #[test]
    fn functions_are_verifiers() {
        fn expired(_: &VerifyRequest<'_>) -> ChainReport {
            ChainReport {
                status: ChainStatus::NOT_TIME_VALID,
                chain: Vec::new(),
            }
        }
        let leaf = cert(b"leaf", &[]);
        let report = expired.verify(&VerifyRequest {
            certificate: &leaf,
            chain: &[],
            usage: KeyUsage::ServerAuth,
            revocation: RevocationMode::NoCheck,
            trust_anchors: &[],
        });
        assert_eq!(report.status, ChainStatus::NOT_TIME_VALID);
    }
}
