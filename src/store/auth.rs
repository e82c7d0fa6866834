use super::fire::FireStore;
use crate::auth::models::Identity;
use crate::auth::{AuthError, IdentityProvider, GOOGLE_PROVIDER_ID};
use crate::error::StoreError;
use crate::persist::{PersistedState, StateStorage};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub const AUTH_STATE_KEY: &str = "auth";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthState {
    pub user: Option<Identity>,
}

/// Shows a blocking, user-facing error message.
pub trait Alert: Send + Sync {
    fn alert(&self, message: &str);
}

/// Auth state plus the `logged` flag derived from it.
struct AuthCell {
    state: PersistedState<AuthState>,
    logged: watch::Sender<bool>,
}

impl AuthCell {
    fn set_user(&self, user: Option<Identity>) {
        let logged = user.is_some();
        self.state.commit(|s| s.user = user);
        self.logged.send_if_modified(|current| {
            let changed = *current != logged;
            *current = logged;
            changed
        });
    }
}

/// The auth store.
///
/// Holds the signed-in identity and mirrors it into the data store.
/// Sign-in failures are shown through the [`Alert`] and leave the state
/// untouched.
pub struct AuthStore {
    provider: Arc<dyn IdentityProvider>,
    fire: Arc<FireStore>,
    alert: Arc<dyn Alert>,
    cell: Arc<AuthCell>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AuthStore {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        fire: Arc<FireStore>,
        alert: Arc<dyn Alert>,
        storage: Arc<dyn StateStorage>,
    ) -> Self {
        let state = PersistedState::<AuthState>::restore(storage, AUTH_STATE_KEY);
        let (logged, _) = watch::channel(state.read(|s| s.user.is_some()));

        Self {
            provider,
            fire,
            alert,
            cell: Arc::new(AuthCell { state, logged }),
            watcher: Mutex::new(None),
        }
    }

    /// Starts following identity changes and waits for the first one.
    ///
    /// Resolves on the first notification of either kind, so a session
    /// restored at startup does not keep `init` waiting for a sign-out.
    ///
    /// Every notification sets or clears the user here and in the data
    /// store; a sign-in also refreshes the member count. Calling `init`
    /// again replaces the previous watcher.
    pub async fn init(&self) {
        let mut changes = self.provider.watch_identity();
        let cell = self.cell.clone();
        let fire = self.fire.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                let identity = changes.borrow_and_update().clone();
                match identity {
                    Some(identity) => {
                        tracing::info!(uid = %identity.uid, "signed in");
                        cell.set_user(Some(identity.clone()));
                        fire.set_user(Some(identity));
                        if let Err(e) = fire.get_count().await {
                            tracing::warn!(error = %e, "failed to refresh member count");
                        }
                    }
                    None => {
                        tracing::info!("signed out");
                        cell.set_user(None);
                        fire.set_user(None);
                    }
                }

                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }

                if changes.changed().await.is_err() {
                    break;
                }
            }
        });

        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        let _ = ready_rx.await;
    }

    /// Creates an account, names it and writes its initial profile.
    pub async fn register(&self, display_name: &str, email: &str, password: &str) -> Option<Identity> {
        tracing::debug!(email, "registering");
        let created = match self.provider.register(email, password).await {
            Ok(identity) => identity,
            Err(e) => return self.surface(e),
        };

        let identity = match self.provider.update_profile(&created, display_name).await {
            Ok(identity) => identity,
            Err(e) => return self.surface(e),
        };

        self.cell.set_user(Some(identity.clone()));
        self.fire.set_user(Some(identity.clone()));
        if let Err(e) = self.fire.register_user(&identity).await {
            tracing::warn!(uid = %identity.uid, error = %e, "failed to create profile");
        }
        Some(identity)
    }

    pub async fn login(&self, email: &str, password: &str) -> Option<Identity> {
        tracing::debug!(email, "signing in");
        match self.provider.sign_in_with_password(email, password).await {
            Ok(identity) => Some(self.signed_in(identity)),
            Err(e) => self.surface(e),
        }
    }

    /// Signs in through the Google popup.
    pub async fn login_with_popup(&self) -> Option<Identity> {
        match self.provider.sign_in_with_popup(GOOGLE_PROVIDER_ID).await {
            Ok(identity) => Some(self.signed_in(identity)),
            Err(e) => self.surface(e),
        }
    }

    /// Signs out and clears both stores.
    pub async fn logout(&self) -> Result<(), StoreError> {
        self.provider.sign_out().await?;
        self.cell.set_user(None);
        self.fire.reset_state();
        Ok(())
    }

    pub fn user(&self) -> Option<Identity> {
        self.cell.state.read(|s| s.user.clone())
    }

    pub fn logged(&self) -> bool {
        *self.cell.logged.borrow()
    }

    /// Receiver notified whenever `logged` flips.
    pub fn watch_logged(&self) -> watch::Receiver<bool> {
        self.cell.logged.subscribe()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.cell.state.subscribe()
    }

    fn signed_in(&self, identity: Identity) -> Identity {
        self.cell.set_user(Some(identity.clone()));
        self.fire.set_user(Some(identity.clone()));
        identity
    }

    fn surface(&self, error: AuthError) -> Option<Identity> {
        tracing::warn!(error = %error, "authentication failed");
        self.alert.alert(&error.to_string());
        None
    }
}

impl Drop for AuthStore {
    fn drop(&mut self) {
        let watcher = self
            .watcher
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = watcher {
            task.abort();
        }
    }
}
