//! Identity Resolver (§4, component 1).
//!
//! Validates a bearer credential into a [`Principal`]. Called by the
//! gateway at socket acceptance and by every mutation that needs to know
//! who the caller is.

use crate::errors::ControlPlaneError;
use common::jwt::{extract_kid, JwtValidationError, PrincipalClaims, DEFAULT_CLOCK_SKEW};
use common::types::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

/// The system-wide role carried in a bearer credential, independent of a
/// participant's per-meeting role (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemRole {
    Admin,
    Tutor,
    Member,
}

impl FromStr for SystemRole {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(SystemRole::Admin),
            "tutor" => Ok(SystemRole::Tutor),
            "member" => Ok(SystemRole::Member),
            other => Err(ControlPlaneError::AuthInvalid(format!(
                "unrecognized system role: {other}"
            ))),
        }
    }
}

/// The resolved identity of an authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: UserId,
    pub display_name: String,
    pub system_role: SystemRole,
}

/// Validates bearer credentials issued by the external Identity Provider.
///
/// The IdentityProvider is an external collaborator (§6); this resolver
/// only verifies signatures against keys it has been given and decodes
/// claims — it does not issue credentials itself.
pub struct IdentityResolver {
    /// Decoding keys by `kid`, refreshed out-of-band (e.g. from a JWKS
    /// endpoint) by the process embedding this resolver.
    keys: HashMap<String, DecodingKey>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(keys: HashMap<String, DecodingKey>) -> Self {
        Self { keys }
    }

    /// Replace the current key set (e.g. after a JWKS refresh).
    pub fn set_keys(&mut self, keys: HashMap<String, DecodingKey>) {
        self.keys = keys;
    }

    /// Validate a bearer token and resolve it to a [`Principal`].
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneError::AuthInvalid` for any malformed, unsigned,
    /// expired, or unrecognized-role token, and `ControlPlaneError::Internal`
    /// only if no keys are loaded at all (a startup/config problem, not a
    /// credential problem).
    pub fn verify_bearer(&self, token: &str) -> Result<Principal, ControlPlaneError> {
        if self.keys.is_empty() {
            return Err(ControlPlaneError::Internal(
                "identity resolver has no signing keys loaded".to_string(),
            ));
        }

        let kid = extract_kid(token).map_err(map_jwt_error)?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| ControlPlaneError::AuthInvalid("unknown signing key".to_string()))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        let data = decode::<PrincipalClaims>(token, key, &validation).map_err(|e| {
            debug!(target: "mc.identity", error = %e, "bearer token rejected");
            ControlPlaneError::AuthInvalid("the access token is invalid or expired".to_string())
        })?;

        common::jwt::validate_iat(data.claims.iat, DEFAULT_CLOCK_SKEW).map_err(map_jwt_error)?;

        let user_id = UserId(
            uuid::Uuid::parse_str(&data.claims.sub)
                .map_err(|_| ControlPlaneError::AuthInvalid("malformed subject".to_string()))?,
        );

        Ok(Principal {
            user_id,
            display_name: data.claims.display_name,
            system_role: data.claims.system_role.parse()?,
        })
    }
}

fn map_jwt_error(err: JwtValidationError) -> ControlPlaneError {
    ControlPlaneError::AuthInvalid(err.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::jwt::PrincipalClaims;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use ring::signature::Ed25519KeyPair;

    fn token_for(claims: &PrincipalClaims, kid: &str) -> (String, DecodingKey) {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(kid.to_string());
        let encoding_key = EncodingKey::from_ed_der(pkcs8.as_ref());
        let token = encode(&header, claims, &encoding_key).unwrap();

        let decoding_key = DecodingKey::from_ed_der(key_pair.public_key().as_ref());
        (token, decoding_key)
    }

    #[test]
    fn verify_bearer_resolves_a_valid_token() {
        let now = chrono::Utc::now().timestamp();
        let claims = PrincipalClaims {
            sub: uuid::Uuid::new_v4().to_string(),
            display_name: "Ada Lovelace".to_string(),
            system_role: "tutor".to_string(),
            exp: now + 3600,
            iat: now,
        };
        let (token, decoding_key) = token_for(&claims, "key-1");

        let mut keys = HashMap::new();
        keys.insert("key-1".to_string(), decoding_key);
        let resolver = IdentityResolver::new(keys);

        let principal = resolver.verify_bearer(&token).expect("should validate");
        assert_eq!(principal.display_name, "Ada Lovelace");
        assert_eq!(principal.system_role, SystemRole::Tutor);
    }

    #[test]
    fn verify_bearer_rejects_unknown_kid() {
        let now = chrono::Utc::now().timestamp();
        let claims = PrincipalClaims {
            sub: uuid::Uuid::new_v4().to_string(),
            display_name: "Ada".to_string(),
            system_role: "member".to_string(),
            exp: now + 3600,
            iat: now,
        };
        let (token, _decoding_key) = token_for(&claims, "key-unknown");

        let resolver = IdentityResolver::new(HashMap::new());
        let err = resolver.verify_bearer(&token);
        assert!(err.is_err());
    }

    #[test]
    fn verify_bearer_rejects_expired_token() {
        let now = chrono::Utc::now().timestamp();
        let claims = PrincipalClaims {
            sub: uuid::Uuid::new_v4().to_string(),
            display_name: "Ada".to_string(),
            system_role: "member".to_string(),
            exp: now - 10,
            iat: now - 3600,
        };
        let (token, decoding_key) = token_for(&claims, "key-1");

        let mut keys = HashMap::new();
        keys.insert("key-1".to_string(), decoding_key);
        let resolver = IdentityResolver::new(keys);

        let result = resolver.verify_bearer(&token);
        assert!(matches!(result, Err(ControlPlaneError::AuthInvalid(_))));
    }

    #[test]
    fn system_role_parsing_rejects_unknown_values() {
        let result: Result<SystemRole, _> = "superuser".parse();
        assert!(result.is_err());
    }
}
