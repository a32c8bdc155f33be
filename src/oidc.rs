//! OpenID Connect relying party for the institutional sign-in.
//!
//! Discovery runs once at startup; after that the client can build the
//! authorize redirect and exchange authorization codes for verified
//! userinfo claims.

use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::OidcConfig;

const HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum OidcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Provider rejected the code exchange: {0}")]
    Exchange(String),
    #[error("Discovery returned an invalid {0} endpoint")]
    BadEndpoint(&'static str),
}

/// Relying-party client, ready once [`OidcClient::discover`] returns.
pub struct OidcClient {
    client: Client,
    config: OidcConfig,
    redirect_uri: String,
    authorization_endpoint: Url,
    token_endpoint: String,
    userinfo_endpoint: String,
}

impl OidcClient {
    /// Fetch the provider's discovery document and build a ready client.
    /// `redirect_uri` is the callback URL registered with the provider.
    pub async fn discover(config: OidcConfig, redirect_uri: String) -> Result<Self, OidcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        let url = format!(
            "{}/.well-known/openid-configuration",
            config.issuer.trim_end_matches('/')
        );
        let document: DiscoveryDocument = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::info!(issuer = %config.issuer, "OIDC discovery complete");

        Self::assemble(config, redirect_uri, client, document)
    }

    fn assemble(
        config: OidcConfig,
        redirect_uri: String,
        client: Client,
        document: DiscoveryDocument,
    ) -> Result<Self, OidcError> {
        let authorization_endpoint = document
            .authorization_endpoint
            .parse::<Url>()
            .map_err(|_| OidcError::BadEndpoint("authorization"))?;

        Ok(Self {
            client,
            config,
            redirect_uri,
            authorization_endpoint,
            token_endpoint: document.token_endpoint,
            userinfo_endpoint: document.userinfo_endpoint,
        })
    }

    /// Provider URL to send the browser to. `state` must come back
    /// unchanged on the callback.
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = self.authorization_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", "openid email profile")
            .append_pair("state", state);
        url.to_string()
    }

    /// Trade an authorization code for the user's claims: token endpoint
    /// first, then userinfo with the fresh access token.
    pub async fn exchange(&self, code: &str) -> Result<Claims, OidcError> {
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OidcError::Exchange(detail));
        }
        let token: TokenResponse = response.json().await?;

        let claims: Claims = self
            .client
            .get(&self.userinfo_endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(claims)
    }
}

/// Userinfo claims the gate cares about. Providers that omit
/// `email_verified` are treated as unverified.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
}

// Wire types.

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[cfg(test)]
impl OidcClient {
    /// Client with fixed endpoints and no discovery round-trip.
    pub(crate) fn stub() -> Self {
        Self::assemble(
            OidcConfig {
                client_id: "janus-client".to_string(),
                client_secret: "shhh".to_string(),
                issuer: "https://accounts.example.com".to_string(),
            },
            "https://gate.example.edu/authorize".to_string(),
            Client::new(),
            DiscoveryDocument {
                authorization_endpoint: "https://accounts.example.com/o/authorize".to_string(),
                token_endpoint: "https://accounts.example.com/o/token".to_string(),
                userinfo_endpoint: "https://accounts.example.com/o/userinfo".to_string(),
            },
        )
        .expect("stub endpoints are valid")
    }
}
