//! HMAC-signed auth tokens.
//!
//! A token is `base64url(claims JSON) + "." + hex(HMAC-SHA256(secret, claims part))`.
//! Servers and clients sharing `TP_DCC_RPC_SECRET` can issue and verify
//! tokens without any further coordination.
//!
//! # Example
//!
//! ```
//! use dccrpc_common::security::TokenAuthority;
//!
//! let authority = TokenAuthority::new("shared-secret");
//! let token = authority.issue("pipeline-tool", chrono::Duration::hours(1)).unwrap();
//! let claims = authority.verify(&token).unwrap();
//! assert_eq!(claims.sub, "pipeline-tool");
//! ```

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::protocol::error::{Result, RpcError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Who the token was issued to.
    pub sub: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenAuthority {
    secret: Vec<u8>,
}

impl TokenAuthority {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Reads the secret from `TP_DCC_RPC_SECRET`. Unset or empty means no authority.
    pub fn from_env() -> Option<Self> {
        std::env::var(super::ENV_SECRET)
            .ok()
            .filter(|s| !s.is_empty())
            .map(Self::new)
    }

    pub fn issue(&self, subject: &str, ttl: chrono::Duration) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: subject.to_string(),
            iat: now,
            exp: now + ttl.num_seconds(),
        };
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signature = hex::encode(self.mac()?.chain_update(encoded.as_bytes()).finalize().into_bytes());
        Ok(format!("{}.{}", encoded, signature))
    }

    /// Checks the signature and expiry of a token and returns its claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| RpcError::PermissionDenied("Malformed auth token".to_string()))?;

        let signature = hex::decode(signature)
            .map_err(|_| RpcError::PermissionDenied("Malformed auth token signature".to_string()))?;

        self.mac()?
            .chain_update(encoded.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| RpcError::PermissionDenied("Invalid auth token".to_string()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| RpcError::PermissionDenied("Malformed auth token payload".to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&payload)
            .map_err(|_| RpcError::PermissionDenied("Malformed auth token claims".to_string()))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(RpcError::PermissionDenied("Auth token expired".to_string()));
        }

        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|e| RpcError::Config(format!("Invalid token secret: {}", e)))
    }
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenAuthority(*****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let authority = TokenAuthority::new("secret");
        let token = authority.issue("tester", chrono::Duration::minutes(5)).unwrap();
        let claims = authority.verify(&token).unwrap();
        assert_eq!(claims.sub, "tester");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = TokenAuthority::new("one").issue("tester", chrono::Duration::minutes(5)).unwrap();
        let err = TokenAuthority::new("two").verify(&token).unwrap_err();
        assert!(matches!(err, RpcError::PermissionDenied(_)));
    }

    #[test]
    fn test_tampered_claims_are_rejected() {
        let authority = TokenAuthority::new("secret");
        let token = authority.issue("tester", chrono::Duration::minutes(5)).unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let forged_claims = TokenClaims {
            sub: "admin".into(),
            iat: 0,
            exp: i64::MAX,
        };
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap()),
            signature
        );
        assert!(authority.verify(&forged).is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let authority = TokenAuthority::new("secret");
        let token = authority.issue("tester", chrono::Duration::seconds(-1)).unwrap();
        let err = authority.verify(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_garbage_tokens() {
        let authority = TokenAuthority::new("secret");
        assert!(authority.verify("").is_err());
        assert!(authority.verify("no-dot").is_err());
        assert!(authority.verify("abc.not-hex").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let authority = TokenAuthority::new("super-secret");
        assert!(!format!("{:?}", authority).contains("super-secret"));
    }
}
