//! Credential cache and authority client.
//!
//! Transfers and downloads need per-principal access credentials for the
//! remote store. These are issued by an external authority and cached in
//! process memory for a fixed TTL.

pub mod authority;
pub mod cache;
pub mod record;

pub use authority::{AuthorityError, CredentialAuthority, HttpAuthority};
pub use cache::{CredentialCache, DEFAULT_TTL};
pub use record::{CredentialsRecord, PrincipalId, ProofKind, SessionCredentials};
