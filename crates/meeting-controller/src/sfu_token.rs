//! SFU Token Service (§4.6).
//!
//! Mints short-lived, signed tokens that the external Selective Forwarding
//! Unit uses to admit a participant's media connection and decide what it
//! is allowed to do. We do not operate the SFU and never see its media
//! plane; we only vouch for a participant's grants.
//!
//! Signing follows the same HKDF-then-HMAC shape used for session binding
//! tokens: a meeting-specific signing key is derived from a long-lived
//! master secret via `HKDF-SHA256(master_secret, salt=meeting_id,
//! info="sfu-token")`, so that compromise of one meeting's token material
//! does not expose any other meeting's key. The claims envelope itself is
//! a standard JWT (HS256) so existing SFU client libraries can parse it
//! without custom tooling.

use crate::domain::ParticipantRole;
use common::secret::{ExposeSecret, SecretBox};
use jsonwebtoken::{encode, EncodingKey, Header};
use ring::hkdf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HKDF_INFO: &[u8] = b"sfu-token";

/// Grants carried in an SFU token, derived from the participant's role at
/// mint time (§4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SfuGrants {
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
    pub can_update_own_metadata: bool,
    pub room_admin: bool,
    pub room_create: bool,
}

impl SfuGrants {
    /// Derive grants from a participant's meeting role.
    #[must_use]
    pub fn for_role(role: ParticipantRole) -> Self {
        let elevated = matches!(role, ParticipantRole::Host | ParticipantRole::CoHost);
        SfuGrants {
            can_publish: role != ParticipantRole::Viewer,
            can_subscribe: true,
            can_publish_data: true,
            can_update_own_metadata: true,
            room_admin: elevated,
            room_create: elevated,
        }
    }
}

/// Claims embedded in an SFU access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuTokenClaims {
    /// The room the token grants access to (the meeting id).
    pub room_name: String,
    /// Participant identity as known to the SFU (the user id, or a
    /// generated identity for guests).
    pub identity: String,
    /// Display name shown to other participants.
    pub name: String,
    /// The meeting role at mint time, for SFU-side auditing.
    pub meeting_role: String,
    /// Grants computed from `meeting_role`.
    pub grants: SfuGrants,
    /// Expiration (Unix epoch seconds).
    pub exp: i64,
    /// Issued-at (Unix epoch seconds).
    pub iat: i64,
}

/// Errors minting an SFU token.
#[derive(Debug, Error)]
pub enum SfuTokenError {
    #[error("failed to encode token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
}

/// Mints SFU access tokens for participants.
///
/// Holds the long-lived master secret in memory only as a `SecretBox`;
/// the derived per-meeting signing key is recomputed for each mint and
/// never persisted.
pub struct SfuTokenService {
    master_secret: SecretBox<Vec<u8>>,
    ttl_seconds: i64,
}

impl SfuTokenService {
    /// Create a new token service.
    ///
    /// # Panics
    ///
    /// Panics if `master_secret` is shorter than 32 bytes.
    #[must_use]
    pub fn new(master_secret: SecretBox<Vec<u8>>, ttl_seconds: u64) -> Self {
        assert!(
            master_secret.expose_secret().len() >= 32,
            "SFU master secret must be at least 32 bytes"
        );
        Self {
            master_secret,
            #[allow(clippy::cast_possible_wrap)]
            ttl_seconds: ttl_seconds as i64,
        }
    }

    /// Mint a signed token for a participant joining `meeting_id`'s media room.
    ///
    /// # Errors
    ///
    /// Returns `SfuTokenError` if JWT encoding fails.
    pub fn mint(
        &self,
        meeting_id: &str,
        identity: &str,
        display_name: &str,
        role: ParticipantRole,
    ) -> Result<String, SfuTokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = SfuTokenClaims {
            room_name: meeting_id.to_string(),
            identity: identity.to_string(),
            name: display_name.to_string(),
            meeting_role: role.as_str().to_string(),
            grants: SfuGrants::for_role(role),
            exp: now + self.ttl_seconds,
            iat: now,
        };

        let key = self.derive_meeting_key(meeting_id);
        let encoding_key = EncodingKey::from_secret(&key);
        Ok(encode(&Header::default(), &claims, &encoding_key)?)
    }

    /// Derive a meeting-specific signing key via HKDF-SHA256.
    fn derive_meeting_key(&self, meeting_id: &str) -> Vec<u8> {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, meeting_id.as_bytes());
        let prk = salt.extract(self.master_secret.expose_secret());
        let okm = prk
            .expand(&[HKDF_INFO], HkdfLen(32))
            .expect("HKDF expand with fixed 32-byte length should not fail");
        let mut out = vec![0u8; 32];
        okm.fill(&mut out)
            .expect("HKDF fill with matching output buffer should not fail");
        out
    }
}

/// Adapter so `ring::hkdf` accepts a plain byte length for `expand`.
#[derive(Clone, Copy)]
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}
