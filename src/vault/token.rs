/// Opaque remote bearer token
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Bearer credential for the remote system.
///
/// The secret never leaves this type except onto an outgoing request; `Debug`
/// is redacted and logs use `fingerprint()`.
#[derive(Clone)]
pub struct RemoteToken {
    secret: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ExpClaim {
    exp: Option<i64>,
}

impl RemoteToken {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// Build a freshly issued token, reading expiry from its JWT `exp` claim when present
    pub fn issued(secret: impl Into<String>, issued_at: DateTime<Utc>, fallback_lifetime: Duration) -> Self {
        let secret = secret.into();
        let expires_at = jwt_expiry(&secret).unwrap_or(issued_at + fallback_lifetime);
        Self { secret, expires_at }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token is still usable
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }

    /// Whether the token outlives `margin` from now
    pub fn is_valid_for(&self, margin: Duration) -> bool {
        self.expires_at > Utc::now() + margin
    }

    /// Attach as `Authorization: Bearer`
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.secret)
    }

    /// Short SHA-256 fingerprint for log correlation
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.secret.as_bytes());
        hex::encode(&digest[..6])
    }

    pub(crate) fn expose(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for RemoteToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteToken")
            .field("secret", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Read `exp` from a JWT without verifying its signature; we are not its audience
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let header = decode_header(token).ok()?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation.algorithms = vec![header.alg, Algorithm::HS256];

    let data = decode::<ExpClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    data.claims
        .exp
        .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0))
}
