use anyhow::{bail, ensure, Context};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

const MIN_SECRET_LEN: usize = 32;

/// Claims of an easel access token. `sub` is the account email.
#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Identity carried by a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub email: String,
}

/// Issues and checks HS256 access tokens for the REST API and `/ws`.
#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str, ttl_secs: i64) -> anyhow::Result<Self> {
        ensure!(
            secret.len() >= MIN_SECRET_LEN,
            "jwt secret must be at least {MIN_SECRET_LEN} characters long"
        );
        ensure!(ttl_secs > 0, "token ttl must be positive, got {ttl_secs}");
        let ttl = Duration::try_seconds(ttl_secs).context("token ttl is out of range")?;

        // Expiry is exact: a token is invalid from its `exp` second onwards.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        })
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl.num_seconds()
    }

    pub fn issue_user_token(&self, email: &str) -> anyhow::Result<String> {
        self.issue_user_token_at(email, Utc::now())
    }

    fn issue_user_token_at(&self, email: &str, issued_at: DateTime<Utc>) -> anyhow::Result<String> {
        let expires_at =
            issued_at.checked_add_signed(self.ttl).context("token expiry is out of range")?;
        let claims = AccessClaims {
            sub: email.to_owned(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to sign access token")
    }

    pub fn validate_user_token(&self, token: &str) -> anyhow::Result<TokenIdentity> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .context("access token rejected")?;

        match data.claims.sub.trim() {
            "" => bail!("access token subject is empty"),
            email => Ok(TokenIdentity { email: email.to_owned() }),
        }
    }
}
