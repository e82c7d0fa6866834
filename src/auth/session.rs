//! Signed-in session state shared between the auth client and the
//! Firestore middleware.

use super::models::{Identity, RefreshTokenResponse};
use super::AuthError;
use crate::core::parse_error_response;
use crate::persist::{PersistError, StateStorage};
use chrono::{DateTime, Duration, Utc};
use reqwest::header;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use url::Url;

/// Tokens are refreshed this long before the provider would reject them.
const EXPIRY_SKEW_SECS: i64 = 60;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Storage key of the persisted session.
pub const SESSION_KEY: &str = "session";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub identity: Identity,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity, id_token: String, refresh_token: String, expires_in: &str) -> Self {
        Self {
            identity,
            id_token,
            refresh_token,
            expires_at: expiry_from(expires_in, Utc::now()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECS) >= self.expires_at
    }
}

/// `expiresIn` arrives as a decimal string of seconds.
pub(crate) fn expiry_from(expires_in: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = expires_in.trim().parse::<i64>().unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    now + Duration::seconds(secs)
}

/// Exchanges refresh tokens for fresh ID tokens via the Secure Token API.
#[derive(Clone)]
pub struct TokenRefresher {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
}

impl TokenRefresher {
    pub fn new(client: ClientWithMiddleware, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshTokenResponse, AuthError> {
        let url = Url::parse_with_params(
            &format!("{}/token", self.base_url),
            &[("key", self.api_key.as_str())],
        )?;

        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .finish();

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::from_failure(
                parse_error_response(response, "Token refresh failed").await,
            ));
        }

        Ok(response.json().await?)
    }
}

/// The current session plus an identity-change channel.
///
/// Every clone observes the same session; setting or clearing it notifies
/// all receivers handed out by [`SharedSession::watch`]. A persistent
/// session also writes itself to storage on every change, tokens included,
/// so a restart picks up where the last run signed in.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<RwLock<Option<Session>>>,
    identity: Arc<watch::Sender<Option<Identity>>>,
    refresher: TokenRefresher,
    storage: Option<Arc<dyn StateStorage>>,
}

impl SharedSession {
    pub fn new(refresher: TokenRefresher) -> Self {
        Self::build(refresher, None, None)
    }

    /// Restores the session saved in `storage`, if any, and keeps it saved.
    pub fn persistent(refresher: TokenRefresher, storage: Arc<dyn StateStorage>) -> Self {
        let restored = match storage.load(SESSION_KEY) {
            Ok(Some(value)) => serde_json::from_value::<Session>(value)
                .map_err(|e| tracing::warn!(error = %e, "discarding unreadable session"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load session");
                None
            }
        };

        if let Some(session) = &restored {
            tracing::debug!(uid = %session.identity.uid, "session restored");
        }
        Self::build(refresher, restored, Some(storage))
    }

    fn build(refresher: TokenRefresher, session: Option<Session>, storage: Option<Arc<dyn StateStorage>>) -> Self {
        let (identity, _) = watch::channel(session.as_ref().map(|s| s.identity.clone()));
        Self {
            inner: Arc::new(RwLock::new(session)),
            identity: Arc::new(identity),
            refresher,
            storage,
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, session: Session) {
        let identity = session.identity.clone();
        let mut guard = self.inner.write().await;
        self.save(Some(&session));
        *guard = Some(session);
        self.identity.send_replace(Some(identity));
    }

    /// Replaces the profile fields of the signed-in identity, keeping its tokens.
    pub async fn update_identity(&self, identity: Identity) {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.as_mut() {
            session.identity = identity.clone();
            self.save(Some(&*session));
            self.identity.send_replace(Some(identity));
        }
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.write().await;
        self.save(None);
        *guard = None;
        self.identity.send_replace(None);
    }

    pub fn watch(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }

    /// Returns a valid ID token, refreshing it first when it is about to expire.
    pub async fn id_token(&self) -> Result<Option<String>, AuthError> {
        {
            let guard = self.inner.read().await;
            match guard.as_ref() {
                None => return Ok(None),
                Some(session) if !session.is_expired(Utc::now()) => {
                    return Ok(Some(session.id_token.clone()))
                }
                Some(_) => {}
            }
        }

        let mut guard = self.inner.write().await;
        let Some(session) = guard.as_mut() else {
            return Ok(None);
        };

        // Another caller may have refreshed while we waited for the write lock.
        if session.is_expired(Utc::now()) {
            tracing::debug!(uid = %session.identity.uid, "refreshing expired ID token");
            let refreshed = self.refresher.refresh(&session.refresh_token).await?;
            session.id_token = refreshed.id_token;
            session.refresh_token = refreshed.refresh_token;
            session.expires_at = expiry_from(&refreshed.expires_in, Utc::now());
            self.save(Some(&*session));
        }

        Ok(Some(session.id_token.clone()))
    }

    fn save(&self, session: Option<&Session>) {
        let Some(storage) = &self.storage else {
            return;
        };

        let result = match session {
            Some(session) => serde_json::to_value(session)
                .map_err(PersistError::from)
                .and_then(|value| storage.save(SESSION_KEY, &value)),
            None => storage.remove(SESSION_KEY),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist session");
        }
    }
}
