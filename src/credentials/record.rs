//! Credentials issued by the authority for one principal.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::{Result, TelestoreError};

/// Which kind of proof is presented to the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProofKind {
    /// A user bearer token (uploads).
    Session,
    /// A short-lived signed download token.
    DownloadToken,
}

/// Cache key for one principal.
///
/// Derived from the auth proof as a SHA-256 digest so raw tokens never sit
/// in map keys or logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Derive the principal id for an auth proof.
    pub fn from_proof(auth_proof: &str) -> Self {
        Self(format!("{:x}", Sha256::digest(auth_proof.as_bytes())))
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Access credentials for the remote store.
///
/// Field aliases match the names the backend uses on the wire.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsRecord {
    /// Serialized session for the session-authenticated API.
    #[serde(default, alias = "telegram_session")]
    pub remote_session_token: Option<String>,
    /// Numeric API identifier.
    #[serde(default, alias = "telegram_api_id", deserialize_with = "de_opt_i64")]
    pub api_id: Option<i64>,
    /// API hash paired with `api_id`.
    #[serde(default, alias = "telegram_api_hash")]
    pub api_hash: Option<String>,
    /// Destination channel holding the stored objects.
    #[serde(alias = "channel_id", deserialize_with = "de_i64")]
    pub destination_channel_id: i64,
    /// Token for the fast API.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Backend user the credentials belong to.
    #[serde(default, deserialize_with = "de_opt_string")]
    pub user_id: Option<String>,
    /// When the cached copy stops being fresh (set by the cache).
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Borrowed view of the fields the session API needs.
#[derive(Debug, Clone, Copy)]
pub struct SessionCredentials<'a> {
    /// Serialized session string.
    pub session: &'a str,
    /// API identifier.
    pub api_id: i64,
    /// API hash.
    pub api_hash: &'a str,
    /// Destination channel.
    pub channel_id: i64,
}

impl CredentialsRecord {
    /// Fields needed by the session API, or a credential error naming what is missing.
    pub fn session_credentials(&self) -> Result<SessionCredentials<'_>> {
        let session = self.remote_session_token.as_deref().filter(|s| !s.is_empty());
        let api_hash = self.api_hash.as_deref().filter(|s| !s.is_empty());

        let mut missing = Vec::new();
        if session.is_none() {
            missing.push("remote_session_token");
        }
        if self.api_id.is_none() {
            missing.push("api_id");
        }
        if api_hash.is_none() {
            missing.push("api_hash");
        }

        match (session, self.api_id, api_hash) {
            (Some(session), Some(api_id), Some(api_hash)) => Ok(SessionCredentials {
                session,
                api_id,
                api_hash,
                channel_id: self.destination_channel_id,
            }),
            _ => Err(TelestoreError::Credential(format!(
                "missing required credentials: {}",
                missing.join(", ")
            ))),
        }
    }

    /// Token for the fast API, or a credential error.
    pub fn bot_token(&self) -> Result<&str> {
        self.bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TelestoreError::Credential("bot token not configured".to_string()))
    }
}

impl fmt::Debug for CredentialsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsRecord")
            .field(
                "remote_session_token",
                &self.remote_session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("api_id", &self.api_id)
            .field("api_hash", &self.api_hash.as_ref().map(|_| "<redacted>"))
            .field("destination_channel_id", &self.destination_channel_id)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(i64),
    Str(String),
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    match NumOrString::deserialize(d)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
    match Option::<NumOrString>::deserialize(d)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(NumOrString::Str(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

fn de_opt_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<NumOrString>::deserialize(d)? {
        None => None,
        Some(NumOrString::Num(n)) => Some(n.to_string()),
        Some(NumOrString::Str(s)) => Some(s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_backend_payload() {
        let json = r#"{
            "bot_token": "123:abc",
            "channel_id": "-1001234567890",
            "telegram_session": "1BVtsOK...",
            "telegram_api_id": "94575",
            "telegram_api_hash": "a3406de8d171bb422bb6ddf3bbd800e2",
            "user_id": "c0ffee",
            "backend_url": "https://ignored.example.com"
        }"#;

        let record: CredentialsRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.destination_channel_id, -1001234567890);
        assert_eq!(record.api_id, Some(94575));
        assert_eq!(record.bot_token().unwrap(), "123:abc");
        assert_eq!(record.user_id.as_deref(), Some("c0ffee"));

        let session = record.session_credentials().unwrap();
        assert_eq!(session.channel_id, -1001234567890);
        assert_eq!(session.api_hash, "a3406de8d171bb422bb6ddf3bbd800e2");
    }

    #[test]
    fn test_deserialize_numeric_ids() {
        let json = r#"{"channel_id": -10042, "telegram_api_id": 7, "user_id": 99}"#;
        let record: CredentialsRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.destination_channel_id, -10042);
        assert_eq!(record.api_id, Some(7));
        assert_eq!(record.user_id.as_deref(), Some("99"));
    }

    #[test]
    fn test_missing_session_fields_are_named() {
        let json = r#"{"channel_id": "1", "telegram_api_id": null, "telegram_api_hash": ""}"#;
        let record: CredentialsRecord = serde_json::from_str(json).unwrap();

        let err = record.session_credentials().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("remote_session_token"));
        assert!(msg.contains("api_id"));
        assert!(msg.contains("api_hash"));
        assert!(record.bot_token().is_err());
    }

    #[test]
    fn test_principal_id_is_stable_digest() {
        let a = PrincipalId::from_proof("token-a");
        let b = PrincipalId::from_proof("token-a");
        let c = PrincipalId::from_proof("token-b");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert!(!a.as_str().contains("token"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let json = r#"{"channel_id": "1", "bot_token": "secret-bot", "telegram_session": "secret-session"}"#;
        let record: CredentialsRecord = serde_json::from_str(json).unwrap();

        let debug = format!("{:?}", record);
        assert!(!debug.contains("secret-bot"));
        assert!(!debug.contains("secret-session"));
    }
}
