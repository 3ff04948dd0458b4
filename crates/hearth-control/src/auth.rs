use std::collections::BTreeSet;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ACCESS_COOKIE_NAME: &str = "access";
pub const ADMIN_CAPABILITY: &str = "ROLE_ADMIN";
pub const COMMAND_CAPABILITY_PREFIX: &str = "COMMAND_";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing access token")]
    MissingToken,
    #[error("invalid access token")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub exp: u64,
    pub iat: u64,
    pub iss: String,
    pub aud: String,
}

/// Who is behind a connection and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    principal: String,
    token: String,
    capabilities: BTreeSet<String>,
}

impl AuthContext {
    pub fn new(
        principal: impl Into<String>,
        token: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            principal: principal.into(),
            token: token.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_admin(&self) -> bool {
        self.has_capability(ADMIN_CAPABILITY)
    }
}

/// Parses access tokens and answers whether one has expired. Issuance lives
/// elsewhere.
pub trait TokenService: Send + Sync {
    fn parse(&self, token: &str) -> Result<TokenClaims, AuthError>;

    /// Unparseable tokens count as expired.
    fn is_expired(&self, token: &str) -> bool;

    fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let claims = self.parse(token)?;
        Ok(AuthContext::new(claims.sub, token, claims.capabilities))
    }
}

fn now_unix() -> u64 {
    time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

/// HS256 JWTs with a fixed issuer and audience.
#[derive(Clone)]
pub struct JwtTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl std::fmt::Debug for JwtTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenService")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl JwtTokenService {
    pub fn new(secret: &[u8], issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    fn validation(&self, check_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;
        validation.validate_exp = check_exp;
        validation
    }

    pub fn issue(
        &self,
        principal: &str,
        capabilities: &[&str],
        ttl: time::Duration,
    ) -> anyhow::Result<String> {
        let now = time::OffsetDateTime::now_utc();
        let claims = TokenClaims {
            sub: principal.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            exp: (now + ttl).unix_timestamp().max(0) as u64,
            iat: now.unix_timestamp().max(0) as u64,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

impl TokenService for JwtTokenService {
    fn parse(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &self.validation(true))?;
        Ok(data.claims)
    }

    fn is_expired(&self, token: &str) -> bool {
        match jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &self.validation(false)) {
            Ok(data) => data.claims.exp < now_unix(),
            Err(_) => true,
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Bearer header first, then the `?token=` query (browsers cannot set headers
/// on WebSocket upgrades), then the access cookie.
pub fn request_token(headers: &HeaderMap, jar: &CookieJar, query_token: Option<&str>) -> Option<String> {
    bearer_token(headers)
        .or_else(|| {
            query_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        })
        .or_else(|| jar.get(ACCESS_COOKIE_NAME).map(|c| c.value().to_string()))
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderValue, header};
    use axum_extra::extract::cookie::Cookie;

    use super::*;

    fn service() -> JwtTokenService {
        JwtTokenService::new(b"test-secret", "hearth", "hearth-web")
    }

    #[test]
    fn issued_token_parses_with_capabilities() {
        let svc = service();
        let token = svc
            .issue("alice", &["COMMAND_say", ADMIN_CAPABILITY], time::Duration::minutes(5))
            .unwrap();

        let ctx = svc.authenticate(&token).unwrap();
        assert_eq!(ctx.principal(), "alice");
        assert_eq!(ctx.token(), token);
        assert!(ctx.has_capability("COMMAND_say"));
        assert!(ctx.is_admin());
        assert!(!svc.is_expired(&token));
    }

    #[test]
    fn expired_token_is_rejected_and_reported() {
        let svc = service();
        let token = svc.issue("bob", &[], time::Duration::seconds(-30)).unwrap();
        assert!(matches!(svc.parse(&token), Err(AuthError::Invalid(_))));
        assert!(svc.is_expired(&token));
    }

    #[test]
    fn foreign_or_garbage_tokens_count_as_expired() {
        let other = JwtTokenService::new(b"other-secret", "hearth", "hearth-web");
        let token = other.issue("mallory", &[ADMIN_CAPABILITY], time::Duration::minutes(5)).unwrap();

        let svc = service();
        assert!(svc.parse(&token).is_err());
        assert!(svc.is_expired(&token));
        assert!(svc.is_expired("not-a-jwt"));
    }

    #[test]
    fn audience_is_enforced() {
        let web = service();
        let cli = JwtTokenService::new(b"test-secret", "hearth", "hearth-cli");
        let token = cli.issue("carol", &[], time::Duration::minutes(5)).unwrap();
        assert!(web.parse(&token).is_err());
    }

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static(" Bearer abc.def "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn request_token_prefers_header_then_query_then_cookie() {
        let jar = CookieJar::new().add(Cookie::new(ACCESS_COOKIE_NAME, "from-cookie"));
        let mut headers = HeaderMap::new();

        assert_eq!(request_token(&headers, &jar, None).as_deref(), Some("from-cookie"));
        assert_eq!(
            request_token(&headers, &jar, Some("from-query")).as_deref(),
            Some("from-query")
        );
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(
            request_token(&headers, &jar, Some("from-query")).as_deref(),
            Some("from-header")
        );
        assert_eq!(request_token(&HeaderMap::new(), &CookieJar::new(), Some(" ")), None);
    }
}
