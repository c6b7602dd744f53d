use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// JWT claims structure. Issued by the external auth service; this server
/// only verifies.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: Option<String>,
    /// Backward-compat: user_id.
    pub user_id: Option<String>,
    /// Token ID, checked against the revocation blacklist.
    pub jti: Option<String>,
    /// Expiration time (Unix timestamp).
    pub exp: Option<u64>,
}

/// Identity carried by a verified token (workspace not yet attached).
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    pub user_id: String,
    pub jti: Option<String>,
}

/// Verify a JWT access token (HS256).
pub fn verify_token(token: &str, secret: &str) -> Result<TokenIdentity, ApiError> {
    let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    // Allow some clock drift.
    validation.leeway = 60;

    let key = DecodingKey::from_secret(secret.as_bytes());
    let token_data = decode::<Claims>(token, &key, &validation)
        .map_err(|e| ApiError::Unauthorized(format!("token validation failed: {e}")))?;

    let claims = token_data.claims;
    let user_id = claims
        .sub
        .or(claims.user_id)
        .ok_or_else(|| ApiError::Unauthorized("token carries no subject".into()))?;

    Ok(TokenIdentity {
        user_id,
        jti: claims.jti,
    })
}

/// Extract the bearer token from an Authorization header value or an SSE
/// `?token=` query parameter.
pub fn bearer_token<'a>(
    auth_header: Option<&'a str>,
    query_token: Option<&'a str>,
) -> Result<&'a str, ApiError> {
    if let Some(header) = auth_header {
        return header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("invalid Authorization header format".into()));
    }
    query_token.ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600
    }

    #[test]
    fn test_verify_valid_token() {
        let claims = Claims {
            sub: Some("user1".to_string()),
            user_id: None,
            jti: Some("tok1".to_string()),
            exp: Some(future_exp()),
        };
        let token = make_token(&claims, "secret");
        let identity = verify_token(&token, "secret").unwrap();
        assert_eq!(identity.user_id, "user1");
        assert_eq!(identity.jti.as_deref(), Some("tok1"));
    }

    #[test]
    fn test_verify_invalid_secret() {
        let claims = Claims {
            sub: Some("user1".to_string()),
            user_id: None,
            jti: None,
            exp: Some(future_exp()),
        };
        let token = make_token(&claims, "secret");
        assert!(verify_token(&token, "wrong-secret").is_err());
    }

    #[test]
    fn test_verify_user_id_fallback() {
        let claims = Claims {
            sub: None,
            user_id: Some("user2".to_string()),
            jti: None,
            exp: Some(future_exp()),
        };
        let token = make_token(&claims, "secret");
        let identity = verify_token(&token, "secret").unwrap();
        assert_eq!(identity.user_id, "user2");
    }

    #[test]
    fn test_verify_expired_token() {
        let claims = Claims {
            sub: Some("user1".to_string()),
            user_id: None,
            jti: None,
            exp: Some(1_000_000),
        };
        let token = make_token(&claims, "secret");
        assert!(verify_token(&token, "secret").is_err());
    }

    #[test]
    fn test_bearer_token_from_header() {
        let token = bearer_token(Some("Bearer abc"), None).unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn test_bearer_token_from_query() {
        let token = bearer_token(None, Some("xyz")).unwrap();
        assert_eq!(token, "xyz");
    }

    #[test]
    fn test_bearer_token_bad_scheme() {
        assert!(bearer_token(Some("Basic abc"), None).is_err());
        assert!(bearer_token(None, None).is_err());
    }
}
