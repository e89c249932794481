use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CodecError;

const STORAGE_KEY_PREFIX: &str = "locks/";
const STORAGE_KEY_SUFFIX: &str = ".lock";

/// Fencing token identifying one successful acquisition. A fresh token is
/// minted for every attempt, so a superseded holder can never pass an owner
/// check against its successor's record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Mints a new random (v4) token.
    #[must_use]
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for OwnerToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for OwnerToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The persisted claim on a resource: who owns it and until when.
///
/// Expiry is kept at millisecond precision, which is what every backend
/// persists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    resource_key: String,
    owner_token: OwnerToken,
    expires_at_ms: u64,
}

impl LeaseRecord {
    /// Creates a record. `expires_at` is truncated to whole milliseconds.
    #[must_use]
    pub fn new(
        resource_key: impl Into<String>,
        owner_token: OwnerToken,
        expires_at: SystemTime,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            owner_token,
            expires_at_ms: system_time_to_millis(expires_at),
        }
    }

    /// Creates a record from an expiry already expressed in epoch milliseconds.
    #[must_use]
    pub fn from_parts(
        resource_key: impl Into<String>,
        owner_token: OwnerToken,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            owner_token,
            expires_at_ms,
        }
    }

    /// Derives the storage key holding the record for `resource_key`.
    #[must_use]
    pub fn storage_key(resource_key: &str) -> String {
        format!("{STORAGE_KEY_PREFIX}{resource_key}{STORAGE_KEY_SUFFIX}")
    }

    /// The protected resource.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// The token of the acquisition that owns this record.
    #[must_use]
    pub const fn owner_token(&self) -> &OwnerToken {
        &self.owner_token
    }

    /// Absolute expiry.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.expires_at_ms)
    }

    /// Absolute expiry in milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    /// Whether the lease ran out before `now`. A record expiring exactly at
    /// `now` is still valid.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at_ms < system_time_to_millis(now)
    }

    /// Returns a copy with a new expiry.
    #[must_use]
    pub fn with_expiry(&self, expires_at: SystemTime) -> Self {
        Self {
            expires_at_ms: system_time_to_millis(expires_at),
            ..self.clone()
        }
    }

    /// Encodes the record for byte-oriented backends.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes bytes written by [`LeaseRecord::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a lease record.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Milliseconds since the UNIX epoch, clamped to zero for earlier times.
#[must_use]
pub fn system_time_to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_storage_key_is_namespaced() {
        assert_eq!(
            LeaseRecord::storage_key("example.com"),
            "locks/example.com.lock"
        );
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(OwnerToken::mint(), OwnerToken::mint());
    }

    #[test]
    fn test_token_display_parses_back() {
        let token = OwnerToken::mint();
        let parsed: OwnerToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
        assert!("not-a-token".parse::<OwnerToken>().is_err());
    }

    #[test]
    fn test_expiry_truncated_to_millis() {
        let expires_at = UNIX_EPOCH + Duration::from_nanos(1_500_999_999);
        let record = LeaseRecord::new("k", OwnerToken::mint(), expires_at);

        assert_eq!(record.expires_at_ms(), 1_500);
        assert_eq!(record.expires_at(), UNIX_EPOCH + Duration::from_millis(1_500));
    }

    #[test]
    fn test_expiry_boundary() {
        let record = LeaseRecord::from_parts("k", OwnerToken::mint(), 10_000);

        assert!(!record.is_expired_at(UNIX_EPOCH + Duration::from_millis(9_999)));
        assert!(!record.is_expired_at(UNIX_EPOCH + Duration::from_millis(10_000)));
        // Sub-millisecond progress past the expiry does not count.
        assert!(!record.is_expired_at(UNIX_EPOCH + Duration::from_micros(10_000_900)));
        assert!(record.is_expired_at(UNIX_EPOCH + Duration::from_millis(10_001)));
    }

    #[test]
    fn test_encoding_layout() {
        let token = OwnerToken::mint();
        let record = LeaseRecord::from_parts("example.com", token, 42);
        let encoded = record.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(json["resource_key"], "example.com");
        assert_eq!(json["owner_token"], token.to_string());
        assert_eq!(json["expires_at_ms"], 42);
        assert_eq!(LeaseRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_matches!(LeaseRecord::decode(b"certificate bytes"), Err(_));
        assert_matches!(
            LeaseRecord::decode(br#"{"resource_key":"k","owner_token":"nope","expires_at_ms":1}"#),
            Err(_)
        );
    }

    #[test]
    fn test_pre_epoch_clamps_to_zero() {
        let before_epoch = UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(system_time_to_millis(before_epoch), 0);
    }
}
