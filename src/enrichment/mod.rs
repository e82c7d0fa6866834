//! Profile enrichment service.
//!
//! The LinkedIn OAuth exchange runs on a small backend of its own: the
//! client posts the authorization code it got from the redirect and gets
//! back the member's basic profile.


use crate::config::FireConfig;
use crate::core::parse_error_response;
use async_trait::async_trait;
use reqwest::{header, Client};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("HTTP Request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
}

/// Basic profile returned for an authorization code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkedinProfile {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub profile_pic: String,
}

#[derive(Serialize)]
struct CodeExchangeRequest<'a> {
    code: &'a str,
}

#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn exchange_authorization_code(&self, code: &str) -> Result<LinkedinProfile, EnrichmentError>;
}

#[derive(Clone)]
pub struct LinkedinService {
    client: ClientWithMiddleware,
    base_url: String,
}

impl LinkedinService {
    pub fn new(config: &FireConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self::new_with_client(client, config.enrichment_url.clone())
    }

    pub fn new_with_client(client: ClientWithMiddleware, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl EnrichmentService for LinkedinService {
    async fn exchange_authorization_code(&self, code: &str) -> Result<LinkedinProfile, EnrichmentError> {
        let url = url::Url::parse(&self.base_url)?;

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&CodeExchangeRequest { code })?)
            .send()
            .await?;

        if !response.status().is_success() {
            let failure = parse_error_response(response, "Authorization code exchange failed").await;
            return Err(EnrichmentError::ApiError(failure.display_message()));
        }

        Ok(response.json().await?)
    }
}
