//! Client-side application state over Firebase Authentication and Cloud
//! Firestore.
//!
//! [`FireApp`] builds the REST clients from a [`FireConfig`] and wires them
//! into the two stores: the auth store, holding the signed-in identity, and
//! the data store, caching profiles, businesses, messages and ideas.

pub mod auth;
pub mod config;
pub mod core;
pub mod enrichment;
pub mod error;
pub mod firestore;
pub mod guard;
pub mod loading;
pub mod persist;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::FireConfig;
pub use error::StoreError;

use auth::session::SharedSession;
use auth::{FirebaseAuth, PopupHandler};
use enrichment::LinkedinService;
use firestore::FirebaseFirestore;
use loading::Loading;
use persist::{JsonFileStorage, MemoryStorage, StateStorage};
use std::sync::Arc;
use store::{Alert, AuthStore, FireStore};

pub struct FireApp {
    config: FireConfig,
    storage: Arc<dyn StateStorage>,
    session: SharedSession,
    popup: Option<Arc<dyn PopupHandler>>,
}

impl FireApp {
    /// Restores whatever session and store state the last run persisted.
    pub fn new(config: FireConfig) -> Self {
        let storage: Arc<dyn StateStorage> = match &config.persist_dir {
            Some(dir) => Arc::new(JsonFileStorage::new(dir.clone())),
            None => Arc::new(MemoryStorage::new()),
        };
        let session = FirebaseAuth::session_for(&config, storage.clone());
        Self {
            config,
            storage,
            session,
            popup: None,
        }
    }

    /// Enables provider sign-in through `handler`.
    pub fn with_popup_handler(mut self, handler: Arc<dyn PopupHandler>) -> Self {
        self.popup = Some(handler);
        self
    }

    pub fn config(&self) -> &FireConfig {
        &self.config
    }

    pub fn auth(&self) -> FirebaseAuth {
        let auth = FirebaseAuth::new(&self.config, self.session.clone());
        match &self.popup {
            Some(handler) => auth.with_popup_handler(handler.clone()),
            None => auth,
        }
    }

    /// A Firestore client acting as whoever is signed in through [`FireApp::auth`].
    pub fn firestore(&self) -> FirebaseFirestore {
        FirebaseFirestore::new(&self.config, self.session.clone())
    }

    pub fn enrichment(&self) -> LinkedinService {
        LinkedinService::new(&self.config)
    }

    /// File-backed when `persist_dir` is configured, in-memory otherwise.
    pub fn storage(&self) -> Arc<dyn StateStorage> {
        self.storage.clone()
    }

    /// Builds both stores around one loading indicator and one storage.
    pub fn stores(&self, alert: Arc<dyn Alert>) -> Stores {
        let loading = Loading::new();
        let storage = self.storage();

        let fire = Arc::new(FireStore::new(
            Arc::new(self.firestore()),
            Arc::new(self.enrichment()),
            loading.clone(),
            storage.clone(),
        ));
        let auth = AuthStore::new(Arc::new(self.auth()), fire.clone(), alert, storage);

        Stores { loading, fire, auth }
    }
}

/// The application's state context.
pub struct Stores {
    pub loading: Loading,
    pub fire: Arc<FireStore>,
    pub auth: AuthStore,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAlert;

    #[tokio::test]
    async fn test_stores_share_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FireConfig::new("key", "demo", "http://localhost/linkedin");
        config.persist_dir = Some(dir.path().to_path_buf());

        let app = FireApp::new(config);
        let stores = app.stores(Arc::new(RecordingAlert::default()));
        assert!(!stores.auth.logged());
        assert!(!stores.loading.is_loading());

        stores.fire.reset_state();
        assert!(dir.path().join("fire.json").exists());
    }

    #[tokio::test]
    async fn test_restart_keeps_signed_in_session() {
        use crate::auth::models::Identity;
        use crate::auth::session::Session;
        use crate::auth::IdentityProvider;

        let dir = tempfile::tempdir().unwrap();
        let mut config = FireConfig::new("key", "demo", "http://localhost/linkedin");
        config.persist_dir = Some(dir.path().to_path_buf());

        let app = FireApp::new(config.clone());
        assert!(app.auth().watch_identity().borrow().is_none());
        app.session
            .set(Session::new(
                Identity {
                    uid: "u1".into(),
                    ..Identity::default()
                },
                "id-token-u1".into(),
                "refresh-u1".into(),
                "3600",
            ))
            .await;
        assert!(dir.path().join("session.json").exists());

        let restarted = FireApp::new(config);
        let identity = restarted.auth().watch_identity().borrow().clone();
        assert_eq!(identity.map(|i| i.uid).as_deref(), Some("u1"));
        assert_eq!(restarted.session.id_token().await.unwrap().as_deref(), Some("id-token-u1"));
    }
}
