//! Identity provider port and the Identity Toolkit REST client behind it.
//!
//! Sign-in state lives in a [`SharedSession`]; the same session feeds the
//! Firestore middleware, so documents are read and written as the signed-in
//! user.

pub mod models;
pub mod session;


use crate::config::FireConfig;
use crate::core::{parse_error_response, ApiFailure};
use crate::persist::StateStorage;
use async_trait::async_trait;
use models::{
    IdpCredential, Identity, LookupRequest, LookupResponse, PasswordRequest, SignInWithIdpRequest,
    TokenResponse, UpdateAccountRequest, UpdateAccountResponse,
};
use reqwest::{header, Client};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde::Serialize;
use session::{expiry_from, Session, SharedSession, TokenRefresher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

pub const GOOGLE_PROVIDER_ID: &str = "google.com";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP Request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("The email address is already in use by another account")]
    EmailAlreadyInUse,
    #[error("Weak password: {0}")]
    WeakPassword(String),
    #[error("The sign-in popup was closed before completing")]
    PopupClosed,
    #[error("No popup handler is configured for provider sign-in")]
    PopupUnavailable,
    #[error("User not found")]
    UserNotFound,
    #[error("The session has expired, sign in again")]
    TokenExpired,
    #[error("No user is signed in")]
    NoSession,
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
}

impl AuthError {
    /// Maps Identity Toolkit error codes onto the variants above.
    ///
    /// The code is the first token of the message, e.g.
    /// `WEAK_PASSWORD : Password should be at least 6 characters`.
    pub(crate) fn from_failure(failure: ApiFailure) -> Self {
        let code = failure
            .message
            .split(|c: char| c == ' ' || c == ':')
            .next()
            .unwrap_or_default();

        match code {
            "INVALID_PASSWORD" | "EMAIL_NOT_FOUND" | "INVALID_LOGIN_CREDENTIALS" | "INVALID_EMAIL"
            | "USER_DISABLED" | "INVALID_IDP_RESPONSE" => AuthError::InvalidCredential(code.to_string()),
            "EMAIL_EXISTS" => AuthError::EmailAlreadyInUse,
            "WEAK_PASSWORD" => AuthError::WeakPassword(failure.message),
            "USER_NOT_FOUND" => AuthError::UserNotFound,
            "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "INVALID_ID_TOKEN" => AuthError::TokenExpired,
            _ => AuthError::ApiError(failure.display_message()),
        }
    }
}

/// Runs the provider's sign-in UI and hands back its credential.
///
/// Implemented by the host shell (browser window, webview, device flow).
/// Return [`AuthError::PopupClosed`] when the user dismisses it.
#[async_trait]
pub trait PopupHandler: Send + Sync {
    async fn open(&self, provider_id: &str) -> Result<IdpCredential, AuthError>;
}

/// Identity operations the auth store depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_popup(&self, provider_id: &str) -> Result<Identity, AuthError>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    async fn register(&self, email: &str, password: &str) -> Result<Identity, AuthError>;

    async fn update_profile(&self, identity: &Identity, display_name: &str) -> Result<Identity, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Identity-change notifications. The receiver starts with the current
    /// identity; dropping it unsubscribes.
    fn watch_identity(&self) -> watch::Receiver<Option<Identity>>;
}

/// Identity Toolkit client authenticating end users with the web API key.
#[derive(Clone)]
pub struct FirebaseAuth {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
    session: SharedSession,
    popup: Option<Arc<dyn PopupHandler>>,
}

impl FirebaseAuth {
    /// Creates a new `FirebaseAuth` instance.
    ///
    /// This is typically called via `FireApp::auth()`.
    pub fn new(config: &FireConfig, session: SharedSession) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self::new_with_client(
            client,
            config.identity_toolkit_url.clone(),
            config.api_key.clone(),
            session,
        )
    }

    pub fn new_with_client(
        client: ClientWithMiddleware,
        base_url: String,
        api_key: String,
        session: SharedSession,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            session,
            popup: None,
        }
    }

    /// Builds a session that refreshes tokens against `secure_token_url`,
    /// restored from and saved to `storage`.
    pub fn session_for(config: &FireConfig, storage: Arc<dyn StateStorage>) -> SharedSession {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let refresher = TokenRefresher::new(client, config.secure_token_url.clone(), config.api_key.clone());
        SharedSession::persistent(refresher, storage)
    }

    pub fn with_popup_handler(mut self, handler: Arc<dyn PopupHandler>) -> Self {
        self.popup = Some(handler);
        self
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    fn endpoint(&self, method: &str) -> Result<Url, AuthError> {
        Ok(Url::parse_with_params(
            &format!("{}/accounts:{}", self.base_url, method),
            &[("key", self.api_key.as_str())],
        )?)
    }

    async fn post<Req: Serialize, Res: DeserializeOwned>(
        &self,
        method: &str,
        request: &Req,
        default_msg: &str,
    ) -> Result<Res, AuthError> {
        let response = self
            .client
            .post(self.endpoint(method)?)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(request)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::from_failure(
                parse_error_response(response, default_msg).await,
            ));
        }

        Ok(response.json().await?)
    }

    async fn start_session(&self, tokens: TokenResponse, identity: Identity) -> Identity {
        let session = Session::new(identity.clone(), tokens.id_token, tokens.refresh_token, &tokens.expires_in);
        self.session.set(session).await;
        identity
    }

    async fn lookup(&self, id_token: &str) -> Result<Identity, AuthError> {
        let result: LookupResponse = self
            .post("lookup", &LookupRequest { id_token }, "Account lookup failed")
            .await?;

        result
            .users
            .and_then(|mut users| users.pop())
            .map(Identity::from)
            .ok_or(AuthError::UserNotFound)
    }

    /// Exchanges a provider credential for a Firebase session.
    pub async fn sign_in_with_idp(&self, credential: &IdpCredential) -> Result<Identity, AuthError> {
        let request = SignInWithIdpRequest {
            post_body: credential.post_body(),
            request_uri: credential.request_uri.clone(),
            return_secure_token: true,
            return_idp_credential: true,
        };

        let tokens: TokenResponse = self
            .post("signInWithIdp", &request, "Provider sign-in failed")
            .await?;
        let identity = tokens.identity();
        Ok(self.start_session(tokens, identity).await)
    }
}

#[async_trait]
impl IdentityProvider for FirebaseAuth {
    async fn sign_in_with_popup(&self, provider_id: &str) -> Result<Identity, AuthError> {
        let handler = self.popup.as_ref().ok_or(AuthError::PopupUnavailable)?;
        let credential = handler.open(provider_id).await?;
        self.sign_in_with_idp(&credential).await
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let request = PasswordRequest {
            email,
            password,
            return_secure_token: true,
        };

        let tokens: TokenResponse = self
            .post("signInWithPassword", &request, "Sign in failed")
            .await?;

        // The password endpoint omits the photo URL; lookup returns the full profile.
        let identity = self.lookup(&tokens.id_token).await?;
        Ok(self.start_session(tokens, identity).await)
    }

    async fn register(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let request = PasswordRequest {
            email,
            password,
            return_secure_token: true,
        };

        let tokens: TokenResponse = self.post("signUp", &request, "Sign up failed").await?;
        let identity = tokens.identity();
        Ok(self.start_session(tokens, identity).await)
    }

    async fn update_profile(&self, identity: &Identity, display_name: &str) -> Result<Identity, AuthError> {
        let id_token = self.session.id_token().await?.ok_or(AuthError::NoSession)?;

        let request = UpdateAccountRequest {
            id_token: &id_token,
            display_name: Some(display_name),
            return_secure_token: true,
        };

        let result: UpdateAccountResponse = self
            .post("update", &request, "Update profile failed")
            .await?;

        let updated = Identity {
            uid: result.local_id,
            display_name: result.display_name,
            email: result.email.or_else(|| identity.email.clone()),
            photo_url: result.photo_url.or_else(|| identity.photo_url.clone()),
        };

        match (result.id_token, result.refresh_token) {
            (Some(id_token), Some(refresh_token)) => {
                let expires_in = result.expires_in.unwrap_or_default();
                self.session
                    .set(Session {
                        identity: updated.clone(),
                        id_token,
                        refresh_token,
                        expires_at: expiry_from(&expires_in, chrono::Utc::now()),
                    })
                    .await;
            }
            _ => self.session.update_identity(updated.clone()).await,
        }

        Ok(updated)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.session.clear().await;
        Ok(())
    }

    fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.session.watch()
    }
}
