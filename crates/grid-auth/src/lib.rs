//! Authentication for grid peers
//!
//! Every outbound link carries a short-lived token scoped to the host it dials
//! (the audience). The accepting side checks signature, expiry and that the
//! audience is itself.

pub mod bearer;
pub mod jwt;

pub use bearer::{bearer_token, AUTHORIZATION_SCHEME};
pub use jwt::{AuthError, GridClaims, JwtValidator, PeerAuthenticator};

// Re-export useful types
pub use jsonwebtoken::Algorithm;
