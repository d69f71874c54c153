use std::path::Path;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;

use crate::auth::middleware::Claims;
use crate::auth::Role;

/// Access tokens minted by `issue_access_token` live for one hour.
const ACCESS_TOKEN_TTL_SECS: i64 = 3600;

/// Load or generate the shared HS256 secret (256-bit random).
/// Stored as raw bytes in data_dir/jwt_secret so the auth service can read the same file.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT verification key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT verification key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an access token for an identity.
///
/// The running service never calls this; the external auth collaborator signs with the
/// same secret. Kept here so both sides agree on the claim layout.
pub fn issue_access_token(
    secret: &[u8],
    user_id: &str,
    role: Role,
    name: Option<&str>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        name: name.map(str::to_string),
        iat: now,
        exp: now + ACCESS_TOKEN_TTL_SECS,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate an access token and return its claims.
pub fn validate_access_token(
    secret: &[u8],
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(token_data.claims)
}
