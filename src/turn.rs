//! TURN credential client.
//!
//! A single outbound HTTP POST to the Cloudflare Calls TURN REST endpoint,
//! bearer-authenticated, with `{"ttl": ttl}` as the body. The response's
//! `iceServers` payload is forwarded to the client verbatim — this crate
//! does not interpret it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TurnSettings;
use crate::error::TurnError;

/// ICE server credentials minted for one WebRTC session, echoed back from
/// the provider as-is.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IceServers {
    #[serde(rename = "iceServers")]
    pub ice_servers: serde_json::Value,
}

/// Client for the configured TURN credential provider.
///
/// No caching: every call mints fresh, short-lived credentials, per
/// spec.md §4.4 ("No caching: each call mints fresh credentials").
#[derive(Clone)]
pub struct TurnClient {
    settings: TurnSettings,
}

impl TurnClient {
    #[must_use]
    pub fn new(settings: TurnSettings) -> Self {
        Self { settings }
    }

    /// Mints fresh ICE server credentials with the given TTL.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::NotConfigured`] if no key id/API token is set,
    /// [`TurnError::Http`] if the provider responds with a non-success
    /// status, and [`TurnError::Network`] on a transport-level failure.
    pub async fn generate_credentials(
        &self,
        ttl: Duration,
    ) -> Result<IceServers, TurnError> {
        let key_id = self
            .settings
            .key_id
            .as_deref()
            .ok_or(TurnError::NotConfigured)?;
        let api_token = self
            .settings
            .api_token
            .as_deref()
            .ok_or(TurnError::NotConfigured)?;

        let url = format!(
            "{}/{}/credentials/generate-ice-servers",
            self.settings.base_url, key_id
        );

        let client = awc::Client::new();
        let mut response = client
            .post(&url)
            .insert_header(("Authorization", format!("Bearer {}", api_token)))
            .insert_header(("Content-Type", "application/json"))
            .send_json(&serde_json::json!({ "ttl": ttl.as_secs() }))
            .await
            .map_err(|e| TurnError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TurnError::Http(response.status().as_u16()));
        }

        response
            .json::<IceServers>()
            .await
            .map_err(|e| TurnError::Network(e.to_string()))
    }

    /// The configured default TTL, used when a caller doesn't override it.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.default_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn not_configured_without_credentials() {
        let client = TurnClient::new(TurnSettings {
            key_id: None,
            api_token: None,
            base_url: "https://example.invalid".to_owned(),
            default_ttl_seconds: 3600,
        });
        let err = client
            .generate_credentials(Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::NotConfigured));
    }
}
