use crate::auth::keystore::KeyLookup;
use crate::auth::policy::{Namespace, PolicyEvaluator, RULE_AUTHENTICATE};
use crate::types::{AppError, Claims, Result};
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Tolerance applied to `exp` and `iat` when no skew is configured.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 30;

/// The single signing algorithm tokens are issued and accepted with.
const ALGORITHM: Algorithm = Algorithm::RS256;

/// Input to the authentication rule.
#[derive(Serialize)]
struct AuthenticationInput<'a> {
    #[serde(rename = "ISS")]
    iss: &'a str,
    #[serde(rename = "Now")]
    now: i64,
    #[serde(rename = "Skew")]
    skew: i64,
    #[serde(rename = "Claims")]
    claims: &'a Claims,
}

/// Input to the authorization rules.
#[derive(Serialize)]
struct AuthorizationInput<'a> {
    #[serde(rename = "Roles")]
    roles: &'a [String],
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "UserID")]
    user_id: String,
}

/// Token engine: signs and verifies RS256 tokens and consults the policy
/// evaluator for acceptance and authorization decisions.
///
/// Holds no mutable state; share it behind an `Arc`.
pub struct AuthService {
    keys: Arc<dyn KeyLookup>,
    policy: PolicyEvaluator,
    issuer: String,
    clock_skew: i64,
}

impl AuthService {
    /// Creates a token engine over the given key source using the embedded
    /// rule sets.
    ///
    /// # Arguments
    /// * `keys` - Resolves a kid to PEM key material
    /// * `issuer` - Issuer stamped on, and required of, every token
    pub fn new(keys: Arc<dyn KeyLookup>, issuer: impl Into<String>) -> Result<Self> {
        Ok(Self::with_policy(keys, issuer, PolicyEvaluator::new()?))
    }

    /// Creates a token engine with a caller-supplied policy evaluator.
    pub fn with_policy(
        keys: Arc<dyn KeyLookup>,
        issuer: impl Into<String>,
        policy: PolicyEvaluator,
    ) -> Self {
        Self {
            keys,
            policy,
            issuer: issuer.into(),
            clock_skew: DEFAULT_CLOCK_SKEW_SECS,
        }
    }

    /// Overrides the clock skew tolerated on `exp` and `iat`.
    pub fn with_clock_skew(mut self, secs: i64) -> Self {
        self.clock_skew = secs.max(0);
        self
    }

    /// Issuer stamped on minted tokens.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Builds claims issued by this engine for `subject`.
    pub fn new_claims(&self, subject: Uuid, roles: Vec<String>, ttl_secs: i64) -> Claims {
        Claims::new(&self.issuer, subject, roles, ttl_secs)
    }

    /// Signs `claims` with the private key registered under `kid`.
    pub fn generate_token(&self, kid: &str, claims: &Claims) -> Result<String> {
        claims.validate()?;

        let pem = self.keys.private_key(kid)?;
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AppError::Internal(format!("parsing private pem [{}]: {}", kid, e)))?;

        let mut header = Header::new(ALGORITHM);
        header.kid = Some(kid.to_string());

        encode(&header, claims, &key)
            .map_err(|e| AppError::Internal(format!("signing token: {}", e)))
    }

    /// Validates a `Bearer <token>` header and returns the token's claims.
    ///
    /// The header is decoded first, unverified, to learn the kid. The
    /// signature is then checked with that kid's public key and the claims
    /// must pass the authentication rule. Every failure is `Unauthenticated`.
    pub fn authenticate(&self, bearer: &str) -> Result<Claims> {
        let token = parse_bearer(bearer)?;

        let header = decode_header(token)
            .map_err(|e| AppError::Unauthenticated(format!("error parsing token: {}", e)))?;

        let kid = header
            .kid
            .ok_or_else(|| AppError::Unauthenticated("kid missing from header".to_string()))?;

        let pem = self
            .keys
            .public_key(&kid)
            .map_err(|e| AppError::Unauthenticated(format!("failed to fetch public key: {}", e)))?;

        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AppError::Unauthenticated(format!("parsing public pem [{}]: {}", kid, e)))?;

        // Expiry and issuer acceptance belong to the authentication rule.
        let mut validation = Validation::new(ALGORITHM);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss"]);

        let claims = decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Unauthenticated(format!("verifying token: {}", e)))?;

        let input = AuthenticationInput {
            iss: &self.issuer,
            now: Utc::now().timestamp(),
            skew: self.clock_skew,
            claims: &claims,
        };

        self.policy
            .evaluate(Namespace::Authentication, RULE_AUTHENTICATE, &input)
            .map_err(|e| AppError::Unauthenticated(format!("authentication failed: {}", e)))?;

        debug!(kid = %kid, sub = %claims.sub, "token authenticated");
        Ok(claims)
    }

    /// Decides whether `claims` may act on `user_id` under `rule`.
    ///
    /// Denial is reported as `Unauthenticated`, the same as a bad credential.
    pub fn authorize(&self, claims: &Claims, user_id: Uuid, rule: &str) -> Result<()> {
        let input = AuthorizationInput {
            roles: &claims.roles,
            subject: &claims.sub,
            user_id: user_id.to_string(),
        };

        self.policy
            .evaluate(Namespace::Authorization, rule, &input)
            .map_err(|_| {
                AppError::Unauthenticated(format!(
                    "authorize: you are not authorized for that action, claims[{:?}] rule[{}]",
                    claims.roles, rule
                ))
            })
    }
}

/// Extracts the token from a header of exactly the form `Bearer <token>`.
fn parse_bearer(header: &str) -> Result<&str> {
    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(AppError::Unauthenticated(
            "expected authorization header format: Bearer <token>".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keystore::{KeyRecord, KeyStore};
    use crate::auth::policy::{RULE_ADMIN_ONLY, RULE_ADMIN_OR_SUBJECT};

    const KID: &str = "54bb2165-71e1-41a6-af3e-7da4a0e1e2c1";
    const PEM: &str = include_str!("../../tests/fixtures/keys/54bb2165-71e1-41a6-af3e-7da4a0e1e2c1.pem");
    const ROGUE_PEM: &str = include_str!("../../tests/fixtures/rogue.pem");
    const ISSUER: &str = "service project";

    fn create_test_service() -> AuthService {
        let mut ks = KeyStore::new();
        ks.insert(KeyRecord::from_pem(KID, PEM).unwrap());
        AuthService::new(Arc::new(ks), ISSUER).unwrap()
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    #[test]
    fn test_token_round_trip() {
        let service = create_test_service();
        let claims = service.new_claims(Uuid::new_v4(), vec!["ADMIN".into()], 3600);

        let token = service.generate_token(KID, &claims).expect("should sign");
        let parsed = service.authenticate(&bearer(&token)).expect("should verify");

        assert_eq!(parsed, claims);
    }

    #[test]
    fn test_token_carries_kid_and_algorithm() {
        let service = create_test_service();
        let claims = service.new_claims(Uuid::new_v4(), vec![], 60);

        let token = service.generate_token(KID, &claims).unwrap();
        let header = decode_header(&token).unwrap();

        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some(KID));
    }

    #[test]
    fn test_generate_with_unknown_kid() {
        let service = create_test_service();
        let claims = service.new_claims(Uuid::new_v4(), vec![], 60);

        let result = service.generate_token("unknown", &claims);
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_generate_rejects_invalid_claims() {
        let service = create_test_service();
        let mut claims = service.new_claims(Uuid::new_v4(), vec![], 60);
        claims.exp = claims.iat - 1;

        assert!(matches!(
            service.generate_token(KID, &claims),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_generate_with_verification_only_kid() {
        let public = KeyRecord::from_pem(KID, PEM).unwrap().public_pem;
        let mut ks = KeyStore::new();
        ks.insert(KeyRecord::from_pem("public-only", &public).unwrap());
        let service = AuthService::new(Arc::new(ks), ISSUER).unwrap();

        let claims = service.new_claims(Uuid::new_v4(), vec![], 60);
        assert!(service.generate_token("public-only", &claims).is_err());
    }

    #[test]
    fn test_header_shapes_are_rejected() {
        let service = create_test_service();
        let claims = service.new_claims(Uuid::new_v4(), vec![], 60);
        let token = service.generate_token(KID, &claims).unwrap();

        for header in [
            token.clone(),
            format!("bearer {}", token),
            format!("Bearer  {}", token),
            format!("Bearer {} extra", token),
            format!("Basic {}", token),
            "Bearer ".to_string(),
            String::new(),
        ] {
            assert!(
                matches!(service.authenticate(&header), Err(AppError::Unauthenticated(_))),
                "header should be rejected: {:?}",
                header
            );
        }
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let service = create_test_service();
        let mut claims = service.new_claims(Uuid::new_v4(), vec!["USER".into()], 60);
        claims.iat -= 7200;
        claims.exp = claims.iat + 60;

        let token = service.generate_token(KID, &claims).unwrap();
        assert!(matches!(
            service.authenticate(&bearer(&token)),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_wrong_issuer_is_rejected() {
        let service = create_test_service();
        let claims = Claims::new("someone else", Uuid::new_v4(), vec![], 60);

        let token = service.generate_token(KID, &claims).unwrap();
        assert!(matches!(
            service.authenticate(&bearer(&token)),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_mis_keyed_token_is_rejected() {
        // Signed by a key nobody registered, but claiming a registered kid.
        let mut rogue = KeyStore::new();
        rogue.insert(KeyRecord::from_pem(KID, ROGUE_PEM).unwrap());
        let forger = AuthService::new(Arc::new(rogue), ISSUER).unwrap();

        let claims = forger.new_claims(Uuid::new_v4(), vec!["ADMIN".into()], 3600);
        let forged = forger.generate_token(KID, &claims).unwrap();

        let service = create_test_service();
        assert!(matches!(
            service.authenticate(&bearer(&forged)),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_unknown_kid_in_token_is_rejected() {
        let mut other = KeyStore::new();
        other.insert(KeyRecord::from_pem("other-kid", PEM).unwrap());
        let issuer = AuthService::new(Arc::new(other), ISSUER).unwrap();

        let claims = issuer.new_claims(Uuid::new_v4(), vec![], 60);
        let token = issuer.generate_token("other-kid", &claims).unwrap();

        let service = create_test_service();
        assert!(matches!(
            service.authenticate(&bearer(&token)),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let service = create_test_service();
        let claims = service.new_claims(Uuid::new_v4(), vec!["USER".into()], 60);
        let token = service.generate_token(KID, &claims).unwrap();

        let admin = service.new_claims(Uuid::new_v4(), vec!["ADMIN".into()], 60);
        let forged_payload = {
            use base64::Engine as _;
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(serde_json::to_vec(&admin).unwrap())
        };
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged_payload;

        assert!(service.authenticate(&bearer(&parts.join("."))).is_err());
    }

    #[test]
    fn test_authorize_admin_only() {
        let service = create_test_service();
        let admin = service.new_claims(Uuid::new_v4(), vec!["ADMIN".into()], 60);
        let user = service.new_claims(Uuid::new_v4(), vec!["USER".into()], 60);

        assert!(service.authorize(&admin, Uuid::new_v4(), RULE_ADMIN_ONLY).is_ok());
        assert!(matches!(
            service.authorize(&user, Uuid::new_v4(), RULE_ADMIN_ONLY),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_authorize_admin_or_subject() {
        let service = create_test_service();
        let id = Uuid::new_v4();
        let user = service.new_claims(id, vec!["USER".into()], 60);

        assert!(service.authorize(&user, id, RULE_ADMIN_OR_SUBJECT).is_ok());
        assert!(service.authorize(&user, Uuid::new_v4(), RULE_ADMIN_OR_SUBJECT).is_err());
    }

    #[test]
    fn test_authorize_unknown_rule_fails_closed() {
        let service = create_test_service();
        let admin = service.new_claims(Uuid::new_v4(), vec!["ADMIN".into()], 60);

        assert!(matches!(
            service.authorize(&admin, Uuid::new_v4(), "admin-only"),
            Err(AppError::Unauthenticated(_))
        ));
    }
}
