//! Session store used when no session protocol client is available.

use async_trait::async_trait;

use super::{RemoteSession, SessionStore};
use crate::credentials::CredentialsRecord;
use crate::{Result, TelestoreError};

/// Refuses every connection.
///
/// Transfers above the fast API's size limit fail with a remote store
/// error instead of being stored somewhere the fast API cannot reach.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSessionStore;

#[async_trait]
impl SessionStore for UnconfiguredSessionStore {
    async fn connect(&self, _credentials: &CredentialsRecord) -> Result<Box<dyn RemoteSession>> {
        Err(TelestoreError::RemoteStore(
            "session API not configured".to_string(),
        ))
    }
}
