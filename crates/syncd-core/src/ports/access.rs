//! Access-control port.
//!
//! Token verification and authorization are external concerns; the core
//! only needs `verify` and `can`. [`AllowAll`] is the permissive default
//! used by tests and unauthenticated deployments.

use thiserror::Error;

use crate::paths::VirtualPath;

/// Identity extracted from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable user identity string.
    pub identity: String,
    /// True when the principal may use the admin surface.
    pub is_admin: bool,
}

/// Operation classes subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    /// Bind a session to a realm (implies download).
    Bind,
    /// Upload changesets to a realm.
    Upload,
    /// Use the admin HTTP surface.
    Admin,
}

/// Token rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("token signature or structure is invalid")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
}

/// Verifies tokens and authorizes operations.
pub trait AccessControl: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<Principal, AccessError>;

    fn can(&self, principal: &Principal, op: AccessOp, path: Option<&VirtualPath>) -> bool;
}

/// Grants everything to everyone. Tokens are accepted verbatim as the
/// identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn verify_token(&self, token: &str) -> Result<Principal, AccessError> {
        Ok(Principal {
            identity: token.to_owned(),
            is_admin: true,
        })
    }

    fn can(&self, _principal: &Principal, _op: AccessOp, _path: Option<&VirtualPath>) -> bool {
        true
    }
}
