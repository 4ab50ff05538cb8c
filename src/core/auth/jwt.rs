//! Access-token codec
//!
//! Signs and verifies the versioned claim set with HS256. The algorithm is
//! fixed; tokens whose header names any other algorithm are rejected. Expiry
//! is not evaluated here: a correctly signed but expired token decodes
//! successfully and the caller decides what "now" means.

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};

use crate::core::db::models::{IdentityId, Role};

/// Current claim schema version
pub const CLAIMS_VERSION: u32 = 1;

/// The only signing algorithm accepted
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Token could not be parsed")]
    Malformed,

    #[error("Token signature does not match")]
    InvalidSignature,

    #[error("Token claims do not match the expected schema")]
    MalformedClaims,

    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

/// Identity snapshot embedded in the claim set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimedIdentity {
    pub id: IdentityId,
    pub email: String,
    pub role: Role,
}

/// Versioned access-token claim set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessClaims {
    /// Schema version
    pub ver: u32,
    /// Subject (identity id)
    pub sub: IdentityId,
    pub role: Role,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub iss: String,
    /// Unique token id
    pub jti: String,
    pub user: ClaimedIdentity,
}

impl AccessClaims {
    /// Schema checks a valid signature does not imply
    fn check_schema(&self, issuer: &str) -> Result<(), CodecError> {
        if self.ver != CLAIMS_VERSION
            || self.iss != issuer
            || self.exp <= self.iat
            || self.user.id != self.sub
            || self.user.role != self.role
            || self.user.email.trim().is_empty()
            || self.jti.is_empty()
        {
            return Err(CodecError::MalformedClaims);
        }
        Ok(())
    }
}

/// Stateless HS256 encoder/decoder
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl TokenCodec {
    /// Create a codec from the shared secret
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        // Expiry and issuer are checked outside jsonwebtoken
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Serialize and sign a claim set
    pub fn encode(&self, claims: &AccessClaims) -> Result<String, CodecError> {
        encode(&Header::new(SIGNING_ALGORITHM), claims, &self.encoding_key)
            .map_err(|e| CodecError::Encoding(e.to_string()))
    }

    /// Verify the signature and return the claims, expired or not
    pub fn decode(&self, token: &str) -> Result<AccessClaims, CodecError> {
        // A header that does not parse means the token is not a JWT at all
        decode_header(token).map_err(|_| CodecError::Malformed)?;

        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    CodecError::InvalidSignature
                }
                ErrorKind::Json(_)
                | ErrorKind::MissingRequiredClaim(_)
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience
                | ErrorKind::InvalidSubject => CodecError::MalformedClaims,
                _ => CodecError::Malformed,
            })?;

        data.claims.check_schema(&self.issuer)?;
        Ok(data.claims)
    }
}
