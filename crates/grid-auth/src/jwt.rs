//! JWT (JSON Web Token) handling

use chrono::{Duration, Utc};
use http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bearer::bearer_token;

/// JWT claims for peer authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridClaims {
    /// Subject (host issuing the token)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience (host the token is meant for)
    pub aud: String,
}

impl GridClaims {
    pub fn new(subject: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Missing bearer token")]
    MissingToken,
}

/// JWT validator
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates signature and expiration. Audience and issuer are only
    /// checked once set with [`with_audience`](Self::with_audience) and
    /// [`with_issuer`](Self::with_issuer).
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<GridClaims, AuthError> {
        let token_data = decode::<GridClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::InvalidAudience => {
                    AuthError::InvalidToken("audience mismatch".to_string())
                }
                ErrorKind::InvalidIssuer => AuthError::InvalidToken("issuer mismatch".to_string()),
                ErrorKind::InvalidSignature => {
                    AuthError::InvalidToken("bad signature".to_string())
                }
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        if token_data.claims.is_expired() {
            return Err(AuthError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &GridClaims) -> Result<String, AuthError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

/// Issues and checks the tokens peers present to each other.
///
/// All nodes of a cluster share the secret; a token is only accepted by the
/// host named as its audience.
#[derive(Clone)]
pub struct PeerAuthenticator {
    secret: Vec<u8>,
    issuer: String,
    validity: Duration,
}

impl std::fmt::Debug for PeerAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerAuthenticator")
            .field("issuer", &self.issuer)
            .field("validity", &self.validity)
            .finish()
    }
}

impl PeerAuthenticator {
    pub const DEFAULT_ISSUER: &'static str = "grid";

    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            issuer: Self::DEFAULT_ISSUER.to_string(),
            validity: Duration::minutes(15),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Token presented by `subject` when dialing `audience`
    pub fn token_for(&self, subject: &str, audience: &str) -> Result<String, AuthError> {
        let claims = GridClaims::new(
            subject.to_string(),
            self.issuer.clone(),
            audience.to_string(),
            self.validity,
        );
        JwtValidator::encode(&self.secret, &claims)
    }

    /// Check the bearer token of an upgrade request addressed to `local`
    pub fn validate_request(
        &self,
        headers: &HeaderMap,
        local: &str,
    ) -> Result<GridClaims, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        let claims = JwtValidator::new(&self.secret)
            .with_audience(local)
            .with_issuer(&self.issuer)
            .validate(token)?;
        debug!("Authenticated peer {} for {}", claims.sub, claims.aud);
        Ok(claims)
    }
}
