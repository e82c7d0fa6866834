//! Cloud Firestore module.
//!
//! [`DocumentStore`] is the port the data store talks to: point reads and
//! writes addressed by collection name and key, ordered and limited queries,
//! and subscriptions that deliver the full result set on every change.
//! [`FirebaseFirestore`] implements it over the Firestore REST API, acting as
//! the signed-in end user.
//!
//! # Real-time Updates
//!
//! `subscribe` opens a `documents:listen` stream for the query's target. The
//! stream is only used as a change signal: whenever the server reports a
//! consistent point after document changes, the query is re-run and the
//! fresh result set is pushed to the subscriber. The stream is re-opened
//! with the last resume token whenever the server closes it.

pub mod listen;
pub mod models;
pub mod query;
pub mod reference;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use self::listen::Subscription;
pub use self::models::Direction;
pub use self::query::Query;
pub use self::reference::WriteData;
pub use self::snapshot::{DocumentSnapshot, QuerySnapshot};

use self::listen::{ChangeTracker, SnapshotEvent};
use self::query::ExecutableQuery;
use self::reference::{CollectionReference, DocumentReference};
use crate::auth::session::SharedSession;
use crate::config::FireConfig;
use crate::core::middleware::SessionMiddleware;
use crate::core::ApiFailure;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryDecision, RetryPolicy, RetryTransientMiddleware};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;

const FIRESTORE_V1_API: &str =
    "https://firestore.googleapis.com/v1/projects/{project_id}/databases/(default)/documents";

const SUBSCRIPTION_BUFFER: usize = 16;

/// Consecutive reconnects without a delivered snapshot before a subscription gives up.
const LISTEN_MAX_RETRIES: u32 = 5;

/// Errors that can occur during Firestore operations.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Wrapper for `reqwest::Error`; covers network failures.
    #[error("HTTP Request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    /// Wrapper for `reqwest_middleware::Error`.
    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),
    /// Security rules rejected the read or write.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// The document (or, for updates, its precondition) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The request carried no valid ID token.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
    /// Other errors returned by the Firestore API.
    #[error("API error: {0}")]
    ApiError(String),
    /// Wrapper for `serde_json::Error`.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
    /// The subscription's listener has stopped.
    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl DocumentError {
    pub(crate) fn from_failure(failure: ApiFailure) -> Self {
        if failure.is("PERMISSION_DENIED", 403) {
            DocumentError::PermissionDenied(failure.message)
        } else if failure.is("NOT_FOUND", 404) {
            DocumentError::NotFound(failure.message)
        } else if failure.is("UNAUTHENTICATED", 401) {
            DocumentError::Unauthenticated(failure.message)
        } else {
            DocumentError::ApiError(failure.display_message())
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DocumentError::RequestError(_) | DocumentError::MiddlewareError(_) | DocumentError::ApiError(_)
        )
    }
}

/// Document operations the data store depends on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads `<collection>/<key>`; `None` when it does not exist.
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<DocumentSnapshot>, DocumentError>;

    /// Creates or overwrites `<collection>/<key>`.
    async fn set_document(&self, collection: &str, key: &str, data: &WriteData) -> Result<(), DocumentError>;

    /// Overwrites the given fields of `<collection>/<key>`; fails with
    /// [`DocumentError::NotFound`] when the document is missing.
    async fn update_document(&self, collection: &str, key: &str, data: &WriteData) -> Result<(), DocumentError>;

    /// Appends a document under a fresh key and returns the key.
    async fn add_document(&self, collection: &str, data: &WriteData) -> Result<String, DocumentError>;

    async fn run_query(&self, query: &Query) -> Result<QuerySnapshot, DocumentError>;

    /// Number of documents the query matches, ignoring its limit.
    async fn count(&self, query: &Query) -> Result<u64, DocumentError>;

    /// Opens a standing subscription delivering the full result set on every change.
    async fn subscribe(&self, query: &Query) -> Result<Subscription, DocumentError>;
}

/// Client for interacting with Cloud Firestore.
#[derive(Clone)]
pub struct FirebaseFirestore {
    client: ClientWithMiddleware,
    base_url: String,
}

impl FirebaseFirestore {
    /// Creates a new `FirebaseFirestore` instance acting as the session's user.
    ///
    /// This is typically called via `FireApp::firestore()`.
    pub fn new(config: &FireConfig, session: SharedSession) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(SessionMiddleware::new(session))
            .build();

        let base_url = config
            .firestore_url
            .clone()
            .unwrap_or_else(|| FIRESTORE_V1_API.replace("{project_id}", &config.project_id));

        Self { client, base_url }
    }

    /// Creates a new `FirebaseFirestore` instance with a custom client and base URL
    /// (useful for testing and the emulator).
    pub fn new_with_client(client: ClientWithMiddleware, base_url: String) -> Self {
        Self { client, base_url }
    }

    /// Gets a `CollectionReference` instance that refers to the collection at the specified path.
    ///
    /// # Arguments
    ///
    /// * `collection_id` - The ID of the collection (e.g., "users").
    pub fn collection(&self, collection_id: &str) -> CollectionReference<'_> {
        CollectionReference {
            client: &self.client,
            base_url: &self.base_url,
            path: collection_id.to_string(),
        }
    }

    /// Gets a `DocumentReference` instance that refers to the document at the specified path.
    ///
    /// # Arguments
    ///
    /// * `document_path` - The slash-separated path to the document (e.g., "users/user1").
    pub fn doc(&self, document_path: &str) -> DocumentReference<'_> {
        DocumentReference {
            client: &self.client,
            base_url: &self.base_url,
            path: document_path.to_string(),
        }
    }

    /// Attaches a query definition to this client.
    pub fn query(&self, query: Query) -> ExecutableQuery<'_> {
        ExecutableQuery::new(&self.client, &self.base_url, query)
    }

    /// Feeds `tx` until the subscriber goes away or the listen target fails
    /// for good. Closed or broken streams are re-opened from the last resume
    /// token, backing off while they keep failing without delivering.
    async fn pump(self, query: Query, tx: mpsc::Sender<SnapshotEvent>) {
        let backoff = ExponentialBackoff::builder().build_with_max_retries(LISTEN_MAX_RETRIES);
        let mut tracker = ChangeTracker::new();
        let mut failures = 0u32;

        loop {
            let err = match self.follow(&query, &mut tracker, &mut failures, &tx).await {
                StreamEnd::Detached => return,
                StreamEnd::Closed => {
                    tracing::debug!(collection = %query.collection_id(), "listen stream closed by server");
                    DocumentError::ApiError("Listen stream closed by server".into())
                }
                StreamEnd::Failed(err) if err.is_transient() => {
                    tracing::warn!(collection = %query.collection_id(), error = %err, "listen stream failed");
                    err
                }
                StreamEnd::Failed(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };

            let RetryDecision::Retry { execute_after } = backoff.should_retry(SystemTime::now(), failures) else {
                let _ = tx.send(Err(err)).await;
                return;
            };
            failures += 1;

            let delay = execute_after.duration_since(SystemTime::now()).unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tx.closed() => return,
            }
            tracing::debug!(collection = %query.collection_id(), attempt = failures, "re-opening listen stream");
        }
    }

    async fn follow(
        &self,
        query: &Query,
        tracker: &mut ChangeTracker,
        failures: &mut u32,
        tx: &mpsc::Sender<SnapshotEvent>,
    ) -> StreamEnd {
        let mut stream = match self.query(query.clone()).listen(tracker.resume_token()).await {
            Ok(stream) => stream,
            Err(err) => return StreamEnd::Failed(err),
        };
        tracker.reconnected();

        while let Some(event) = stream.next().await {
            match event.and_then(|response| tracker.observe(&response)) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => return StreamEnd::Failed(err),
            }

            let snapshot = match self.query(query.clone()).get().await {
                Ok(snapshot) => snapshot,
                Err(err) => return StreamEnd::Failed(err),
            };
            if tx.send(Ok(snapshot)).await.is_err() {
                return StreamEnd::Detached;
            }
            *failures = 0;
        }

        StreamEnd::Closed
    }
}

/// How one listen stream ended.
enum StreamEnd {
    /// The subscriber dropped its handle.
    Detached,
    Closed,
    Failed(DocumentError),
}

#[async_trait]
impl DocumentStore for FirebaseFirestore {
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<DocumentSnapshot>, DocumentError> {
        self.collection(collection).doc(key).get().await
    }

    async fn set_document(&self, collection: &str, key: &str, data: &WriteData) -> Result<(), DocumentError> {
        self.collection(collection).doc(key).set(data).await
    }

    async fn update_document(&self, collection: &str, key: &str, data: &WriteData) -> Result<(), DocumentError> {
        self.collection(collection).doc(key).update(data).await
    }

    async fn add_document(&self, collection: &str, data: &WriteData) -> Result<String, DocumentError> {
        self.collection(collection).add(data).await
    }

    async fn run_query(&self, query: &Query) -> Result<QuerySnapshot, DocumentError> {
        self.query(query.clone()).get().await
    }

    async fn count(&self, query: &Query) -> Result<u64, DocumentError> {
        self.query(query.clone()).count().await
    }

    async fn subscribe(&self, query: &Query) -> Result<Subscription, DocumentError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(self.clone().pump(query.clone(), tx));
        Ok(Subscription::with_task(rx, task))
    }
}
