//! Versions, salts, and the cursor algebra.
//!
//! All scalar protocol values are 63-bit non-negative integers carried in
//! `u64` fields; the top bit is never set. A *salted* version pairs a
//! monotone version with a random tag so that a peer can detect that the
//! history it synced against has been replaced (deleted and recreated, or
//! restored from a backup).
//!
//! A cursor bounds one direction of synchronization:
//!
//! - [`DownloadCursor`] - progress of server-to-client history scanning
//! - [`UploadCursor`] - progress of client-to-server changeset integration
//!
//! The consistency predicates here are pure; they are the ground truth that
//! session-level validation builds on.

use serde::{Deserialize, Serialize};

/// Monotone server- or client-side history version.
pub type Version = u64;

/// 63-bit random tag attached to a version to detect history divergence.
pub type Salt = u64;

/// Identifier of a client-side file as allocated by the server.
pub type FileIdent = u64;

/// Client-chosen identifier of one session on a connection.
pub type SessionIdent = u64;

/// Identifier of an outstanding file-ident allocation request.
pub type RequestIdent = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Largest value representable in 63 bits.
pub const MAX_PROTOCOL_INT: u64 = i64::MAX as u64;

/// Draw a fresh nonzero 63-bit salt.
pub fn random_salt<R: rand::Rng>(rng: &mut R) -> Salt {
    rng.gen_range(1..=MAX_PROTOCOL_INT)
}

/// A history version paired with the salt of the history it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedVersion {
    /// The monotone version.
    pub version: Version,
    /// Salt of the history instance that produced the version.
    pub salt: Salt,
}

impl SaltedVersion {
    pub const fn new(version: Version, salt: Salt) -> Self {
        Self { version, salt }
    }
}

/// A client file identifier paired with its allocation salt.
///
/// The salt proves that the client obtained the identifier from this
/// server file, not from an earlier incarnation of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedFileIdent {
    /// The allocated identifier.
    pub ident: FileIdent,
    /// Salt chosen at allocation time.
    pub salt: Salt,
}

impl SaltedFileIdent {
    pub const fn new(ident: FileIdent, salt: Salt) -> Self {
        Self { ident, salt }
    }
}

/// Progress of server-to-client downloading.
///
/// `server_version` is the position of the client's scan through the
/// server-side history; `last_integrated_client_version` is the latest
/// client-produced version that had been integrated into the server-side
/// history at that scan position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadCursor {
    pub server_version: Version,
    pub last_integrated_client_version: Version,
}

impl DownloadCursor {
    pub const fn new(server_version: Version, last_integrated_client_version: Version) -> Self {
        Self {
            server_version,
            last_integrated_client_version,
        }
    }

    /// A cursor is consistent unless it claims integration progress at
    /// version zero: `version == 0` forces the counterpart to zero.
    pub const fn is_consistent(&self) -> bool {
        self.server_version > 0 || self.last_integrated_client_version == 0
    }

    /// Mutual consistency: neither cursor contradicts the other's
    /// monotonicity. Symmetric in its arguments.
    pub const fn is_consistent_with(&self, other: &Self) -> bool {
        mutually_consistent(
            self.server_version,
            self.last_integrated_client_version,
            other.server_version,
            other.last_integrated_client_version,
        )
    }
}

/// Progress of client-to-server uploading.
///
/// `client_version` is the latest client-produced version the server has
/// seen; `last_integrated_server_version` is the latest server version that
/// had been integrated into the client-side history when the client
/// produced that version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    pub client_version: Version,
    pub last_integrated_server_version: Version,
}

impl UploadCursor {
    pub const fn new(client_version: Version, last_integrated_server_version: Version) -> Self {
        Self {
            client_version,
            last_integrated_server_version,
        }
    }

    /// See [`DownloadCursor::is_consistent`].
    pub const fn is_consistent(&self) -> bool {
        self.client_version > 0 || self.last_integrated_server_version == 0
    }

    /// See [`DownloadCursor::is_consistent_with`].
    pub const fn is_consistent_with(&self, other: &Self) -> bool {
        mutually_consistent(
            self.client_version,
            self.last_integrated_server_version,
            other.client_version,
            other.last_integrated_server_version,
        )
    }

    /// Raise this cursor to `other` where `other` is ahead, field-wise.
    ///
    /// Used when merging progress reported through different paths (blocked
    /// queue vs. in-flight work unit vs. persistent history).
    pub fn raise_to(&mut self, other: &Self) {
        self.client_version = self.client_version.max(other.client_version);
        self.last_integrated_server_version = self
            .last_integrated_server_version
            .max(other.last_integrated_server_version);
    }
}

/// Shared mutual-consistency predicate over `(version, counterpart)` pairs.
///
/// With `a.version <= b.version`, mutual consistency requires
/// `a.counterpart <= b.counterpart`. Checking both orderings makes the
/// predicate symmetric; equal versions therefore require equal counterparts.
const fn mutually_consistent(a_ver: u64, a_cp: u64, b_ver: u64, b_cp: u64) -> bool {
    if a_ver <= b_ver && a_cp > b_cp {
        return false;
    }
    if b_ver <= a_ver && b_cp > a_cp {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_cursor_is_consistent() {
        assert!(DownloadCursor::default().is_consistent());
        assert!(UploadCursor::default().is_consistent());
    }

    #[test]
    fn integration_progress_at_version_zero_is_inconsistent() {
        assert!(!DownloadCursor::new(0, 5).is_consistent());
        assert!(!UploadCursor::new(0, 5).is_consistent());
        assert!(UploadCursor::new(5, 0).is_consistent());
    }

    #[test]
    fn equal_versions_require_equal_counterparts() {
        let a = UploadCursor::new(4, 2);
        let b = UploadCursor::new(4, 3);
        assert!(!a.is_consistent_with(&b));
        assert!(a.is_consistent_with(&a));
    }

    #[test]
    fn raise_to_is_fieldwise_max() {
        let mut a = UploadCursor::new(3, 7);
        a.raise_to(&UploadCursor::new(5, 2));
        assert_eq!(a, UploadCursor::new(5, 7));
    }

    fn arb_version() -> impl Strategy<Value = Version> {
        0u64..1024
    }

    proptest! {
        #[test]
        fn consistency_matches_definition(v in arb_version(), c in arb_version()) {
            let cursor = UploadCursor::new(v, c);
            prop_assert_eq!(cursor.is_consistent(), v > 0 || c == 0);
        }

        #[test]
        fn mutual_consistency_matches_definition(
            av in arb_version(), ac in arb_version(),
            bv in arb_version(), bc in arb_version(),
        ) {
            let a = DownloadCursor::new(av, ac);
            let b = DownloadCursor::new(bv, bc);
            let expected = if av <= bv { ac <= bc } else { bc <= ac };
            // When versions are equal the rule applies in both directions.
            let expected = if av == bv { ac == bc } else { expected };
            prop_assert_eq!(a.is_consistent_with(&b), expected);
        }

        #[test]
        fn mutual_consistency_is_symmetric(
            av in arb_version(), ac in arb_version(),
            bv in arb_version(), bc in arb_version(),
        ) {
            let a = UploadCursor::new(av, ac);
            let b = UploadCursor::new(bv, bc);
            prop_assert_eq!(a.is_consistent_with(&b), b.is_consistent_with(&a));
        }

        #[test]
        fn random_salt_is_nonzero_63_bit(seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let salt = random_salt(&mut rng);
            prop_assert!(salt >= 1);
            prop_assert!(salt <= MAX_PROTOCOL_INT);
        }
    }
}
