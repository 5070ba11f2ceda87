//! OAuth client-credentials token cache shared by UPS and FedEx clients

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::CarrierError;

/// Safety margin subtracted from the advertised token lifetime
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Cached bearer token with single-refresh semantics.
///
/// `bearer` serves from cache while the token is live; `force_refresh`
/// discards the cache and fetches once (the per-request 401/403 retry).
pub(crate) struct OAuthTokenManager {
    token_url: String,
    client_id: String,
    client_secret: String,
    /// UPS wants Basic auth on the token endpoint; FedEx wants form fields
    use_basic_auth: bool,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "expires_in_flexible")]
    expires_in: i64,
}

/// Some carriers send `expires_in` as a JSON string, others as a number
fn expires_in_flexible<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom("expires_in out of range")),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| D::Error::custom("expires_in not numeric")),
        serde_json::Value::Null => Ok(0),
        _ => Err(D::Error::custom("unexpected expires_in type")),
    }
}

impl OAuthTokenManager {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        use_basic_auth: bool,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            use_basic_auth,
            token: RwLock::new(None),
        }
    }

    /// Current bearer token, fetching a fresh one when absent or expired
    pub async fn bearer(&self, http: &reqwest::Client) -> Result<String, CarrierError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.access_token.clone());
            }
        }
        self.force_refresh(http).await
    }

    /// Discard the cached token and fetch a new one
    pub async fn force_refresh(&self, http: &reqwest::Client) -> Result<String, CarrierError> {
        let mut guard = self.token.write().await;

        let fresh = self.fetch(http).await?;
        let token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    async fn fetch(&self, http: &reqwest::Client) -> Result<CachedToken, CarrierError> {
        debug!(url = %self.token_url, "Fetching OAuth token");

        let mut request = http.post(&self.token_url);
        let request = if self.use_basic_auth {
            request = request.basic_auth(&self.client_id, Some(&self.client_secret));
            request.form(&[("grant_type", "client_credentials")])
        } else {
            request.form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CarrierError::auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::parse_failure(format!("token response: {e}")))?;

        let lifetime = (parsed.expires_in - EXPIRY_MARGIN_SECS).max(0);
        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + TimeDelta::seconds(lifetime),
        })
    }
}
