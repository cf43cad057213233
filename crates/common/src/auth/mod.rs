//! Authentication
//!
//! Provides:
//! - Bearer token verification against a JWKS endpoint or a shared secret
//! - A development-only bypass that cannot exist outside `development`
//! - Identity establishment: external subject → tenant-scoped user
//! - Service key hashing

mod jwks;

pub use jwks::JwksCache;

use crate::config::{AuthConfig, RuntimeEnv};
use crate::db::models::{Tenant, User};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Claims extracted from a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    /// Identity provider subject
    pub subject: String,

    pub email: Option<String>,

    /// External group claims
    pub groups: Vec<String>,

    /// Tenant the token was issued for, by id or subdomain
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

enum KeySource {
    Secret(DecodingKey),
    Jwks(JwksCache),
}

/// Verifies bearer tokens: signature, expiry, optional issuer and audience
pub struct JwtVerifier {
    keys: KeySource,
    issuer: Option<String>,
    audience: Option<String>,
    groups_claim: String,
    tenant_claim: String,
    leeway_secs: u64,
}

impl JwtVerifier {
    /// Build from configuration; a JWKS URL takes precedence over a secret
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let keys = match (&config.jwks_url, &config.jwt_secret) {
            (Some(url), _) => KeySource::Jwks(JwksCache::new(
                url.clone(),
                Duration::from_secs(config.jwks_refresh_secs),
                Duration::from_secs(config.jwks_timeout_secs),
            )?),
            (None, Some(secret)) if !secret.is_empty() => {
                KeySource::Secret(DecodingKey::from_secret(secret.as_bytes()))
            }
            _ => {
                return Err(AppError::Configuration {
                    message: "auth.jwks_url or auth.jwt_secret must be set".to_string(),
                })
            }
        };

        Ok(Self {
            keys,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            groups_claim: config.groups_claim.clone(),
            tenant_claim: config.tenant_claim.clone(),
            leeway_secs: config.leeway_secs,
        })
    }

    /// Verify a raw token
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let header = decode_header(token).map_err(|_| AppError::MalformedToken)?;

        let key = match &self.keys {
            KeySource::Secret(key) => {
                if !matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                    return Err(AppError::unauthenticated("unsupported token algorithm"));
                }
                key.clone()
            }
            KeySource::Jwks(cache) => {
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| AppError::unauthenticated("token has no key id"))?;
                cache.key_for(kid, header.alg).await?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let claims = decode::<RawClaims>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::unauthenticated("token expired"),
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => AppError::MalformedToken,
                _ => AppError::unauthenticated("token verification failed"),
            })?
            .claims;

        Ok(VerifiedToken {
            subject: claims.sub,
            email: claims.email,
            groups: string_list(claims.extra.get(&self.groups_claim)),
            tenant: claims
                .extra
                .get(&self.tenant_claim)
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Accepts either a list of strings or a single string
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    }
}

#[derive(Debug, Serialize)]
struct IssuedClaims<'a> {
    sub: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    groups: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant: Option<&'a str>,
    iat: i64,
    exp: i64,
}

/// Mints HMAC tokens for local development and tests
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token valid for `ttl_secs` (negative for an already expired one)
    pub fn issue(
        &self,
        subject: &str,
        email: Option<&str>,
        groups: &[String],
        tenant: Option<&str>,
        ttl_secs: i64,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = IssuedClaims {
            sub: subject,
            email,
            groups,
            tenant,
            iat: now,
            exp: now + ttl_secs,
        };

        encode(&Header::default(), &claims, &self.key).map_err(|e| AppError::Internal {
            message: format!("Failed to generate token: {}", e),
        })
    }
}

/// Proof that verification may be skipped.
///
/// The only constructor checks the runtime environment.
#[derive(Debug)]
pub struct DevBypass {
    _private: (),
}

impl DevBypass {
    pub const SUBJECT: &'static str = "dev-bypass";

    pub fn from_env(env: RuntimeEnv, config: &AuthConfig) -> Option<Self> {
        if env == RuntimeEnv::Development && config.dev_bypass {
            Some(Self { _private: () })
        } else {
            None
        }
    }

    fn identity(&self) -> VerifiedToken {
        VerifiedToken {
            subject: Self::SUBJECT.to_string(),
            email: Some("dev@localhost".to_string()),
            groups: vec![crate::rbac::SYSTEM_ADMIN_GROUP.to_string()],
            tenant: None,
        }
    }
}

/// Credential verification strategy, fixed at startup
pub enum CredentialVerifier {
    Jwt(JwtVerifier),
    DevBypass(DevBypass),
}

impl CredentialVerifier {
    pub fn from_config(config: &AuthConfig, env: RuntimeEnv) -> Result<Self> {
        if let Some(bypass) = DevBypass::from_env(env, config) {
            warn!("Authentication bypass enabled for development");
            return Ok(CredentialVerifier::DevBypass(bypass));
        }
        if config.dev_bypass {
            warn!(env = env.as_str(), "auth.dev_bypass ignored outside development");
        }
        Ok(CredentialVerifier::Jwt(JwtVerifier::from_config(config)?))
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        match self {
            CredentialVerifier::Jwt(verifier) => verifier.verify(token).await,
            CredentialVerifier::DevBypass(bypass) => Ok(bypass.identity()),
        }
    }
}

/// Lookup and creation of tenant-scoped users
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_subject(&self, tenant_id: Uuid, subject: &str) -> Result<Option<User>>;

    async fn provision(&self, tenant_id: Uuid, subject: &str, email: &str) -> Result<User>;
}

/// Authenticated caller within a tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
    pub groups: Vec<String>,
}

/// Verifies credentials and maps them to tenant users
#[derive(Clone)]
pub struct AuthenticationGate {
    verifier: Arc<CredentialVerifier>,
    users: Arc<dyn UserDirectory>,
    jit_provisioning: bool,
}

impl AuthenticationGate {
    pub fn new(verifier: Arc<CredentialVerifier>, users: Arc<dyn UserDirectory>, jit_provisioning: bool) -> Self {
        Self {
            verifier,
            users,
            jit_provisioning,
        }
    }

    /// Verify the `Authorization: Bearer` credential of a request
    pub async fn verify_bearer(&self, headers: &HeaderMap) -> Result<VerifiedToken> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer);

        match (token, self.verifier.as_ref()) {
            (Some(token), verifier) => verifier.verify(token).await,
            (None, CredentialVerifier::DevBypass(bypass)) => Ok(bypass.identity()),
            (None, CredentialVerifier::Jwt(_)) => {
                Err(AppError::unauthenticated("missing bearer token"))
            }
        }
    }

    /// Verify a raw token (realtime handshake)
    pub async fn verify_token(&self, token: &str) -> Result<VerifiedToken> {
        if token.trim().is_empty() {
            return Err(AppError::unauthenticated("missing token"));
        }
        self.verifier.verify(token).await
    }

    /// Map a verified subject to a user of `tenant`
    pub async fn establish(&self, token: &VerifiedToken, tenant: &Tenant) -> Result<Identity> {
        let claim_matches = token.tenant.as_deref().map(|claimed| {
            claimed == tenant.id.to_string() || claimed.eq_ignore_ascii_case(&tenant.subdomain)
        });

        if claim_matches == Some(false) {
            warn!(tenant_id = %tenant.id, "Token was issued for a different tenant");
            return Err(AppError::unauthorized("token was issued for a different tenant"));
        }

        let user = match self.users.find_by_subject(tenant.id, &token.subject).await? {
            Some(user) => user,
            None if self.jit_provisioning && claim_matches == Some(true) => {
                let email = token.email.as_deref().unwrap_or_default();
                let user = self.users.provision(tenant.id, &token.subject, email).await?;
                info!(tenant_id = %tenant.id, user_id = %user.id, "Provisioned user on first sign-in");
                user
            }
            None => {
                debug!(tenant_id = %tenant.id, "No user for subject in tenant");
                return Err(AppError::unauthorized("no account in this tenant"));
            }
        };

        Ok(Identity {
            user_id: user.id,
            email: user.email,
            groups: token.groups.clone(),
        })
    }
}

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate an API key against a stored hash
pub fn validate_api_key(api_key: &str, stored_hash: &str) -> bool {
    hash_api_key(api_key).eq_ignore_ascii_case(stored_hash.trim())
}

/// Extract the token from an Authorization header value
pub fn extract_bearer(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TenantStatus;
    use crate::db::MemoryRegistry;
    use axum::http::HeaderValue;
    use tokio_test::{assert_err, assert_ok};

    const SECRET: &str = "test_secret";

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: Some(SECRET.to_string()),
            ..AuthConfig::default()
        }
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::from_config(&config()).unwrap()
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hash_api_key() {
        let key = "svc_test_12345";
        let hash = hash_api_key(key);
        assert!(validate_api_key(key, &hash));
        assert!(!validate_api_key("wrong_key", &hash));
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc.def"), Some("abc.def"));
        assert_eq!(extract_bearer("Bearer "), None);
        assert_eq!(extract_bearer("abc.def"), None);
        assert_eq!(extract_bearer("Basic abc"), None);
    }

    #[tokio::test]
    async fn test_token_roundtrip() {
        let issuer = TokenIssuer::new(SECRET);
        let token = issuer
            .issue("sub-1", Some("a@b.test"), &groups(&["nurses"]), Some("acme"), 600)
            .unwrap();

        let verified = verifier().verify(&token).await.unwrap();
        assert_eq!(verified.subject, "sub-1");
        assert_eq!(verified.email.as_deref(), Some("a@b.test"));
        assert_eq!(verified.groups, groups(&["nurses"]));
        assert_eq!(verified.tenant.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_expired_and_forged_tokens_are_unauthenticated() {
        let expired = TokenIssuer::new(SECRET)
            .issue("sub-1", None, &[], None, -3600)
            .unwrap();
        assert!(matches!(
            verifier().verify(&expired).await,
            Err(AppError::Unauthenticated { .. })
        ));

        let forged = TokenIssuer::new("other_secret")
            .issue("sub-1", None, &[], None, 600)
            .unwrap();
        assert!(matches!(
            verifier().verify(&forged).await,
            Err(AppError::Unauthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_structurally_malformed_token() {
        assert!(matches!(
            verifier().verify("not-a-token").await,
            Err(AppError::MalformedToken)
        ));
    }

    #[test]
    fn test_missing_key_material_is_a_config_error() {
        assert!(matches!(
            JwtVerifier::from_config(&AuthConfig::default()),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn test_dev_bypass_only_in_development() {
        let mut config = config();
        config.dev_bypass = true;

        assert!(DevBypass::from_env(RuntimeEnv::Development, &config).is_some());
        assert!(DevBypass::from_env(RuntimeEnv::Staging, &config).is_none());
        assert!(DevBypass::from_env(RuntimeEnv::Production, &config).is_none());

        let verifier = CredentialVerifier::from_config(&config, RuntimeEnv::Production).unwrap();
        assert!(matches!(verifier, CredentialVerifier::Jwt(_)));

        config.dev_bypass = false;
        assert!(DevBypass::from_env(RuntimeEnv::Development, &config).is_none());
    }

    #[tokio::test]
    async fn test_missing_header_is_unauthenticated() {
        let gate = AuthenticationGate::new(
            Arc::new(CredentialVerifier::Jwt(verifier())),
            Arc::new(MemoryRegistry::new()),
            false,
        );

        let err = gate.verify_bearer(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated { .. }));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let err = gate.verify_bearer(&headers).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated { .. }));
    }

    #[tokio::test]
    async fn test_establish_identity() {
        let registry = Arc::new(MemoryRegistry::new());
        let acme = registry.add_tenant("Acme", "acme", "tenant_42", TenantStatus::Active);
        let user = registry.add_user(acme.id, "sub-1", "nurse@acme.test");

        let gate = AuthenticationGate::new(
            Arc::new(CredentialVerifier::Jwt(verifier())),
            registry.clone(),
            false,
        );

        let token = VerifiedToken {
            subject: "sub-1".to_string(),
            email: None,
            groups: groups(&["nurses"]),
            tenant: None,
        };
        let identity = gate.establish(&token, &acme).await.unwrap();
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.groups, groups(&["nurses"]));

        let stranger = VerifiedToken {
            subject: "sub-2".to_string(),
            ..token.clone()
        };
        assert!(matches!(
            gate.establish(&stranger, &acme).await,
            Err(AppError::Unauthorized { .. })
        ));
    }

    #[tokio::test]
    async fn test_tenant_claim_must_match() {
        let registry = Arc::new(MemoryRegistry::new());
        let acme = registry.add_tenant("Acme", "acme", "tenant_42", TenantStatus::Active);
        registry.add_user(acme.id, "sub-1", "nurse@acme.test");
        let gate = AuthenticationGate::new(
            Arc::new(CredentialVerifier::Jwt(verifier())),
            registry,
            true,
        );

        let token = VerifiedToken {
            subject: "sub-1".to_string(),
            email: None,
            groups: Vec::new(),
            tenant: Some("globex".to_string()),
        };
        assert!(matches!(
            gate.establish(&token, &acme).await,
            Err(AppError::Unauthorized { .. })
        ));

        let by_id = VerifiedToken {
            tenant: Some(acme.id.to_string()),
            ..token
        };
        assert_ok!(gate.establish(&by_id, &acme).await);
    }

    #[tokio::test]
    async fn test_jit_provisioning_requires_matching_claim() {
        let registry = Arc::new(MemoryRegistry::new());
        let acme = registry.add_tenant("Acme", "acme", "tenant_42", TenantStatus::Active);
        let gate = AuthenticationGate::new(
            Arc::new(CredentialVerifier::Jwt(verifier())),
            registry.clone(),
            true,
        );

        let unclaimed = VerifiedToken {
            subject: "new-sub".to_string(),
            email: Some("new@acme.test".to_string()),
            groups: Vec::new(),
            tenant: None,
        };
        assert_err!(gate.establish(&unclaimed, &acme).await);
        assert_eq!(registry.user_count(acme.id), 0);

        let claimed = VerifiedToken {
            tenant: Some("ACME".to_string()),
            ..unclaimed
        };
        let identity = gate.establish(&claimed, &acme).await.unwrap();
        assert_eq!(identity.email, "new@acme.test");
        assert_eq!(registry.user_count(acme.id), 1);
    }
}
