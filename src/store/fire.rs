use super::records::{
    BusinessRecord, Idea, IdeaEntry, Message, ProfileRecord, BUSINESSES, CREATED_AT, DISPLAY_NAME,
    FEED_LIMIT, IDEAS, MESSAGES, USERS,
};
use crate::auth::models::Identity;
use crate::enrichment::EnrichmentService;
use crate::error::StoreError;
use crate::firestore::{
    Direction, DocumentError, DocumentStore, Query, QuerySnapshot, Subscription, WriteData,
};
use crate::loading::Loading;
use crate::persist::{PersistedState, StateStorage};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const FIRE_STATE_KEY: &str = "fire";

/// Everything the data store caches for the current session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FireState {
    /// The identity the auth store last observed.
    pub user: Option<Identity>,
    pub linkedin_user: Option<ProfileRecord>,
    pub linkedin_users: Vec<ProfileRecord>,
    pub business: Option<BusinessRecord>,
    pub businesses: Vec<BusinessRecord>,
    /// Oldest first.
    pub messages: Vec<Message>,
    /// Newest first.
    pub ideas: Vec<IdeaEntry>,
    pub member_count: Option<u64>,
}

/// The data store.
///
/// Profiles and businesses are keyed by the current user's uid. Messages
/// and ideas are fed by standing subscriptions that replace the cached
/// sequence on every snapshot; those listeners run until the store is
/// dropped or the same feed is requested again.
pub struct FireStore {
    documents: Arc<dyn DocumentStore>,
    enrichment: Arc<dyn EnrichmentService>,
    loading: Loading,
    state: Arc<PersistedState<FireState>>,
    listeners: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl FireStore {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        enrichment: Arc<dyn EnrichmentService>,
        loading: Loading,
        storage: Arc<dyn StateStorage>,
    ) -> Self {
        Self {
            documents,
            enrichment,
            loading,
            state: Arc::new(PersistedState::restore(storage, FIRE_STATE_KEY)),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> FireState {
        self.state.snapshot()
    }

    /// Receiver notified after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<FireState> {
        self.state.subscribe()
    }

    pub fn user(&self) -> Option<Identity> {
        self.state.read(|s| s.user.clone())
    }

    pub fn linkedin_user(&self) -> Option<ProfileRecord> {
        self.state.read(|s| s.linkedin_user.clone())
    }

    pub fn linkedin_users(&self) -> Vec<ProfileRecord> {
        self.state.read(|s| s.linkedin_users.clone())
    }

    pub fn business(&self) -> Option<BusinessRecord> {
        self.state.read(|s| s.business.clone())
    }

    pub fn businesses(&self) -> Vec<BusinessRecord> {
        self.state.read(|s| s.businesses.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.read(|s| s.messages.clone())
    }

    pub fn ideas(&self) -> Vec<IdeaEntry> {
        self.state.read(|s| s.ideas.clone())
    }

    pub fn member_count(&self) -> Option<u64> {
        self.state.read(|s| s.member_count)
    }

    /// Whether a profile record is cached for the current user.
    pub fn has_profile(&self) -> bool {
        self.state.read(|s| s.linkedin_user.is_some())
    }

    pub fn set_user(&self, user: Option<Identity>) {
        self.state.commit(|s| s.user = user);
    }

    /// Drops every cached field. Running feed listeners are left alone.
    pub fn reset_state(&self) {
        tracing::debug!("resetting data store");
        self.state.replace(FireState::default());
    }

    fn current_user(&self) -> Result<Identity, StoreError> {
        self.user().ok_or(StoreError::NotSignedIn)
    }

    /// Exchanges a LinkedIn authorization code for the member's profile and
    /// stores it as the current user's profile.
    pub async fn set_linkedin(&self, code: &str) -> Result<(), StoreError> {
        let user = self.current_user()?;
        let _loading = self.loading.scope();

        let profile = self.enrichment.exchange_authorization_code(code).await?;
        let record = ProfileRecord::from(profile);
        write_stamped(&*self.documents, USERS, &user.uid, &record, WriteMode::Set).await?;

        tracing::info!(uid = %user.uid, "linkedin profile stored");
        self.state.commit(|s| s.linkedin_user = Some(stamped_now(record)));
        Ok(())
    }

    /// Writes the initial profile for a freshly registered identity.
    pub async fn register_user(&self, identity: &Identity) -> Result<(), StoreError> {
        let record = ProfileRecord::for_identity(identity);
        write_stamped(&*self.documents, USERS, &identity.uid, &record, WriteMode::Set).await?;

        tracing::info!(uid = %identity.uid, "profile created");
        self.state.commit(|s| s.linkedin_user = Some(stamped_now(record)));
        Ok(())
    }

    pub async fn update_linkedin(&self, record: ProfileRecord) -> Result<(), StoreError> {
        let user = self.current_user()?;
        let _loading = self.loading.scope();

        write_stamped(&*self.documents, USERS, &user.uid, &record, WriteMode::Update).await?;
        self.state.commit(|s| s.linkedin_user = Some(record));
        Ok(())
    }

    /// Loads the current user's profile, creating an empty one if absent.
    pub async fn get_linkedin(&self) -> Result<(), StoreError> {
        let user = self.current_user()?;
        let _loading = self.loading.scope();

        let record: ProfileRecord = fetch_or_create(&*self.documents, USERS, &user.uid).await?;
        self.state.commit(|s| s.linkedin_user = Some(record));
        Ok(())
    }

    pub async fn get_all_linkedin_users(&self) -> Result<(), StoreError> {
        let _loading = self.loading.scope();

        let query = Query::new(USERS).order_by(CREATED_AT, Direction::Descending);
        let snapshot = self.documents.run_query(&query).await?;
        let users: Vec<ProfileRecord> = decode_all(&snapshot)?;

        tracing::debug!(count = users.len(), "fetched profiles");
        self.state.commit(|s| s.linkedin_users = users);
        Ok(())
    }

    pub async fn update_business(&self, record: BusinessRecord) -> Result<(), StoreError> {
        let user = self.current_user()?;
        let _loading = self.loading.scope();

        write_stamped(&*self.documents, BUSINESSES, &user.uid, &record, WriteMode::Update).await?;
        self.state.commit(|s| s.business = Some(record));
        Ok(())
    }

    /// Loads the current user's business, creating an empty one if absent.
    /// Does nothing while nobody is signed in.
    pub async fn get_business(&self) -> Result<(), StoreError> {
        let Some(user) = self.user() else {
            return Ok(());
        };
        let _loading = self.loading.scope();

        let record: BusinessRecord = fetch_or_create(&*self.documents, BUSINESSES, &user.uid).await?;
        self.state.commit(|s| s.business = Some(record));
        Ok(())
    }

    pub async fn get_all_businesses(&self) -> Result<(), StoreError> {
        let _loading = self.loading.scope();

        let query = Query::new(BUSINESSES).order_by(DISPLAY_NAME, Direction::Descending);
        let snapshot = self.documents.run_query(&query).await?;
        let businesses: Vec<BusinessRecord> = decode_all(&snapshot)?;

        tracing::debug!(count = businesses.len(), "fetched businesses");
        self.state.commit(|s| s.businesses = businesses);
        Ok(())
    }

    /// Subscribes to the latest messages. Loading ends with each snapshot.
    pub async fn get_messages(&self) -> Result<(), StoreError> {
        let loading = self.loading.scope();
        let subscription = self.documents.subscribe(&feed_query(MESSAGES)).await?;
        loading.keep();

        self.listen(MESSAGES, subscription, |state, snapshot| {
            let mut messages: Vec<Message> = decode_all(snapshot)?;
            messages.reverse();
            state.messages = messages;
            Ok(())
        });
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<(), StoreError> {
        let user = self.current_user()?;
        let _loading = self.loading.scope();

        let message = Message::authored_by(&user, text);
        let data = WriteData::from_serializable(&message)?.server_timestamp(CREATED_AT);
        let key = self.documents.add_document(MESSAGES, &data).await?;

        tracing::debug!(key = %key, "message sent");
        Ok(())
    }

    /// Subscribes to the latest ideas. Loading ends with each snapshot.
    pub async fn get_ideas(&self) -> Result<(), StoreError> {
        let loading = self.loading.scope();
        let subscription = self.documents.subscribe(&feed_query(IDEAS)).await?;
        loading.keep();

        self.listen(IDEAS, subscription, |state, snapshot| {
            let ideas: Vec<Idea> = decode_all(snapshot)?;
            state.ideas = ideas.into_iter().map(IdeaEntry::from).collect();
            Ok(())
        });
        Ok(())
    }

    pub async fn send_idea(&self, text: &str) -> Result<(), StoreError> {
        let user = self.current_user()?;
        let _loading = self.loading.scope();

        let idea = Idea::authored_by(&user, text);
        let data = WriteData::from_serializable(&idea)?.server_timestamp(CREATED_AT);
        let key = self.documents.add_document(IDEAS, &data).await?;

        tracing::debug!(key = %key, "idea sent");
        Ok(())
    }

    /// Counts registered members.
    pub async fn get_count(&self) -> Result<(), StoreError> {
        let count = self.documents.count(&Query::new(USERS)).await?;
        tracing::debug!(count, "member count");
        self.state.commit(|s| s.member_count = Some(count));
        Ok(())
    }

    fn listen<F>(&self, feed: &'static str, mut subscription: Subscription, apply: F)
    where
        F: Fn(&mut FireState, &QuerySnapshot) -> Result<(), DocumentError> + Send + 'static,
    {
        let state = self.state.clone();
        let loading = self.loading.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    Ok(snapshot) => {
                        tracing::debug!(feed, size = snapshot.size(), "snapshot received");
                        let mut result = Ok(());
                        state.commit(|s| result = apply(s, &snapshot));
                        if let Err(e) = result {
                            tracing::warn!(feed, error = %e, "snapshot could not be decoded");
                        }
                    }
                    // Keeps the cached sequence.
                    Err(e) => tracing::warn!(feed, error = %e, "feed error"),
                }
                loading.end();
            }
            tracing::debug!(feed, "feed listener stopped");
            loading.end();
        });

        let mut listeners = self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = listeners.insert(feed, task) {
            previous.abort();
        }
    }
}

impl Drop for FireStore {
    fn drop(&mut self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, task) in listeners.drain() {
            task.abort();
        }
    }
}

enum WriteMode {
    Set,
    Update,
}

fn feed_query(collection: &str) -> Query {
    Query::new(collection)
        .order_by(CREATED_AT, Direction::Descending)
        .limit(FEED_LIMIT)
}

/// Writes `record` with `createdAt` assigned by the server.
async fn write_stamped<T: Serialize>(
    documents: &dyn DocumentStore,
    collection: &str,
    key: &str,
    record: &T,
    mode: WriteMode,
) -> Result<(), DocumentError> {
    let data = WriteData::from_serializable(record)?.server_timestamp(CREATED_AT);
    match mode {
        WriteMode::Set => documents.set_document(collection, key, &data).await,
        WriteMode::Update => documents.update_document(collection, key, &data).await,
    }
}

async fn fetch_or_create<T>(documents: &dyn DocumentStore, collection: &str, key: &str) -> Result<T, DocumentError>
where
    T: Serialize + DeserializeOwned + Default + Stamped,
{
    if let Some(snapshot) = documents.get_document(collection, key).await? {
        return snapshot.data();
    }

    tracing::info!(collection, key, "creating default record");
    let record = T::default();
    write_stamped(documents, collection, key, &record, WriteMode::Set).await?;
    Ok(stamped_now(record))
}

fn decode_all<T: DeserializeOwned>(snapshot: &QuerySnapshot) -> Result<Vec<T>, DocumentError> {
    snapshot.iter().map(|doc| doc.data()).collect()
}

/// Records whose creation time the server assigns.
trait Stamped {
    fn set_created_at(&mut self, at: chrono::DateTime<Utc>);
}

impl Stamped for ProfileRecord {
    fn set_created_at(&mut self, at: chrono::DateTime<Utc>) {
        self.created_at = Some(at);
    }
}

impl Stamped for BusinessRecord {
    fn set_created_at(&mut self, at: chrono::DateTime<Utc>) {
        self.created_at = Some(at);
    }
}

/// The cached copy of a freshly written record; the server's timestamp is
/// only known on the next read.
fn stamped_now<T: Stamped>(mut record: T) -> T {
    record.set_created_at(Utc::now());
    record
}
