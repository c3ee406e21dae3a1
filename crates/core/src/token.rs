//! Access token issuance.
//!
//! Every connection attempt gets a freshly minted [`Credential`]: an HS256 JWT
//! authorizing one participant identity to join one room with an explicit
//! set of capabilities. Credentials are never cached or refreshed.

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Default lifetime of an issued credential.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Errors raised while minting a credential. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("signing secret is missing or empty")]
    MissingSecret,
    #[error("invalid token request: {0}")]
    InvalidRequest(String),
    #[error("failed to sign token: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

/// A single permission granted to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    RoomJoin,
    RoomList,
    RoomRecord,
    RoomAdmin,
    RoomCreate,
    CanPublish,
    CanSubscribe,
    CanPublishData,
    CanUpdateOwnMetadata,
}

impl Capability {
    /// The capability set an agent participant requests by default.
    pub fn agent_defaults() -> BTreeSet<Capability> {
        BTreeSet::from([
            Capability::RoomJoin,
            Capability::RoomList,
            Capability::CanPublish,
            Capability::CanSubscribe,
            Capability::CanPublishData,
            Capability::CanUpdateOwnMetadata,
        ])
    }
}

/// The `video` grant block carried inside the JWT.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrants {
    pub room: String,
    pub room_join: bool,
    pub room_list: bool,
    pub room_record: bool,
    pub room_admin: bool,
    pub room_create: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
    pub can_update_own_metadata: bool,
}

impl RoomGrants {
    fn new(room: &str, capabilities: &BTreeSet<Capability>) -> Self {
        let has = |c: Capability| capabilities.contains(&c);
        Self {
            room: room.to_string(),
            room_join: has(Capability::RoomJoin),
            room_list: has(Capability::RoomList),
            room_record: has(Capability::RoomRecord),
            room_admin: has(Capability::RoomAdmin),
            room_create: has(Capability::RoomCreate),
            can_publish: has(Capability::CanPublish),
            can_subscribe: has(Capability::CanSubscribe),
            can_publish_data: has(Capability::CanPublishData),
            can_update_own_metadata: has(Capability::CanUpdateOwnMetadata),
        }
    }
}

/// JWT claims for a room access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub video: RoomGrants,
}

/// A signed, time-bounded authorization to join a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub issuer_id: String,
    pub subject_identity: String,
    pub display_name: Option<String>,
    pub room_name: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub grants: BTreeSet<Capability>,
    /// The encoded JWT presented to the server.
    pub token: String,
}

impl Credential {
    pub fn ttl(&self) -> TimeDelta {
        self.expires_at - self.issued_at
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.expires_at
    }
}

/// Mints credentials signed with a shared API secret.
pub struct TokenIssuer {
    api_key: String,
    api_secret: SecretString,
    display_name: Option<String>,
}

impl TokenIssuer {
    pub fn new(api_key: impl Into<String>, api_secret: SecretString) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret,
            display_name: None,
        }
    }

    /// Sets the human readable name embedded in every issued token.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Issues a credential for `identity` to join `room` for `ttl`.
    pub fn issue(
        &self,
        room: &str,
        identity: &str,
        capabilities: &BTreeSet<Capability>,
        ttl: Duration,
    ) -> Result<Credential, SigningError> {
        let secret = self.api_secret.expose_secret();
        if secret.trim().is_empty() {
            return Err(SigningError::MissingSecret);
        }
        if room.trim().is_empty() {
            return Err(SigningError::InvalidRequest("room name is empty".into()));
        }
        if identity.trim().is_empty() {
            return Err(SigningError::InvalidRequest(
                "participant identity is empty".into(),
            ));
        }
        if ttl.is_zero() {
            return Err(SigningError::InvalidRequest("ttl must be positive".into()));
        }
        let ttl_delta = TimeDelta::from_std(ttl)
            .map_err(|e| SigningError::InvalidRequest(format!("ttl out of range: {e}")))?;

        let issued_at = Utc::now();
        let expires_at = issued_at.checked_add_signed(ttl_delta).ok_or_else(|| {
            SigningError::InvalidRequest("ttl puts expiry past the supported range".into())
        })?;

        let claims = AccessClaims {
            iss: self.api_key.clone(),
            sub: identity.to_string(),
            name: self.display_name.clone(),
            iat: issued_at.timestamp(),
            nbf: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            video: RoomGrants::new(room, capabilities),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )?;

        tracing::debug!(room, identity, %expires_at, "Issued access token");

        Ok(Credential {
            issuer_id: self.api_key.clone(),
            subject_identity: identity.to_string(),
            display_name: self.display_name.clone(),
            room_name: room.to_string(),
            issued_at,
            expires_at,
            grants: capabilities.clone(),
            token,
        })
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("api_key", &self.api_key)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}
