//! In-memory fakes of the service ports.

use crate::auth::models::Identity;
use crate::auth::{AuthError, IdentityProvider};
use crate::enrichment::{EnrichmentError, EnrichmentService, LinkedinProfile};
use crate::firestore::models::Direction;
use crate::firestore::{DocumentError, DocumentSnapshot, DocumentStore, Query, QuerySnapshot, Subscription, WriteData};
use crate::guard::Navigator;
use crate::store::Alert;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::map::Map;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn identity(uid: &str, display_name: &str, email: &str) -> Identity {
    Identity {
        uid: uid.to_string(),
        display_name: Some(display_name.to_string()),
        email: Some(email.to_string()),
        photo_url: None,
    }
}

struct Account {
    password: String,
    identity: Identity,
}

/// Identity provider backed by a map of accounts. Uids are `u1`, `u2`, ...
pub struct FakeIdentityProvider {
    accounts: Mutex<HashMap<String, Account>>,
    current: watch::Sender<Option<Identity>>,
    popup: Mutex<Option<Identity>>,
}

impl Default for FakeIdentityProvider {
    fn default() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(HashMap::new()),
            current,
            popup: Mutex::new(None),
        }
    }
}

impl FakeIdentityProvider {
    /// The identity the next popup sign-in returns; without one the popup is closed.
    pub fn set_popup_identity(&self, identity: Identity) {
        *lock(&self.popup) = Some(identity);
    }

    /// Pushes an identity change as if it came from the provider.
    pub fn emit(&self, identity: Option<Identity>) {
        self.current.send_replace(identity);
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn sign_in_with_popup(&self, _provider_id: &str) -> Result<Identity, AuthError> {
        let identity = lock(&self.popup).clone().ok_or(AuthError::PopupClosed)?;
        self.emit(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let identity = {
            let accounts = lock(&self.accounts);
            match accounts.get(email) {
                Some(account) if account.password == password => account.identity.clone(),
                _ => return Err(AuthError::InvalidCredential("INVALID_LOGIN_CREDENTIALS".into())),
            }
        };
        self.emit(Some(identity.clone()));
        Ok(identity)
    }

    async fn register(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        if password.len() < 6 {
            return Err(AuthError::WeakPassword(
                "WEAK_PASSWORD : Password should be at least 6 characters".into(),
            ));
        }

        let identity = {
            let mut accounts = lock(&self.accounts);
            if accounts.contains_key(email) {
                return Err(AuthError::EmailAlreadyInUse);
            }
            let identity = Identity {
                uid: format!("u{}", accounts.len() + 1),
                display_name: None,
                email: Some(email.to_string()),
                photo_url: None,
            };
            accounts.insert(
                email.to_string(),
                Account {
                    password: password.to_string(),
                    identity: identity.clone(),
                },
            );
            identity
        };
        self.emit(Some(identity.clone()));
        Ok(identity)
    }

    async fn update_profile(&self, identity: &Identity, display_name: &str) -> Result<Identity, AuthError> {
        let updated = Identity {
            display_name: Some(display_name.to_string()),
            ..identity.clone()
        };

        {
            let mut accounts = lock(&self.accounts);
            let account = accounts
                .values_mut()
                .find(|account| account.identity.uid == identity.uid)
                .ok_or(AuthError::UserNotFound)?;
            account.identity = updated.clone();
        }
        self.emit(Some(updated.clone()));
        Ok(updated)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.emit(None);
        Ok(())
    }

    fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

struct Feed {
    query: Query,
    sender: mpsc::Sender<Result<QuerySnapshot, DocumentError>>,
}

/// Document store kept in memory.
///
/// Server timestamps come from a fake clock that advances one second per
/// write, so ordering by `createdAt` follows write order. Subscribers get
/// the full result set right away and again after every write to their
/// collection.
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<(String, Map<String, Value>)>>>,
    feeds: Mutex<Vec<Feed>>,
    denied: Mutex<HashSet<String>>,
    held: Mutex<bool>,
    ticks: Mutex<i64>,
    epoch: DateTime<Utc>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
            denied: Mutex::new(HashSet::new()),
            held: Mutex::new(false),
            ticks: Mutex::new(0),
            epoch: Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
        }
    }
}

impl MemoryDocumentStore {
    /// Every later operation on `collection` fails with `PermissionDenied`.
    pub fn deny(&self, collection: &str) {
        lock(&self.denied).insert(collection.to_string());
    }

    /// Documents in `collection`, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<(String, Map<String, Value>)> {
        lock(&self.collections).get(collection).cloned().unwrap_or_default()
    }

    /// Stores `fields` as-is, bypassing timestamps and subscribers.
    pub fn seed(&self, collection: &str, key: &str, fields: Value) {
        let Value::Object(fields) = fields else {
            panic!("seeded documents must be objects");
        };
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .push((key.to_string(), fields));
    }

    /// New subscriptions get no initial snapshot until [`MemoryDocumentStore::publish`].
    pub fn hold_initial_snapshots(&self) {
        *lock(&self.held) = true;
    }

    /// Pushes the current result set to every subscriber of `collection`.
    pub fn publish(&self, collection: &str) {
        self.notify(collection);
    }

    /// Pushes an error event to every subscriber of `collection`.
    pub fn fail_feeds(&self, collection: &str, message: &str) {
        let feeds = lock(&self.feeds);
        for feed in feeds.iter().filter(|feed| feed.query.collection_id() == collection) {
            let _ = feed.sender.try_send(Err(DocumentError::ApiError(message.to_string())));
        }
    }

    fn check(&self, collection: &str) -> Result<(), DocumentError> {
        if lock(&self.denied).contains(collection) {
            return Err(DocumentError::PermissionDenied(format!(
                "Missing or insufficient permissions for {}",
                collection
            )));
        }
        Ok(())
    }

    fn resolve(&self, data: &WriteData) -> Map<String, Value> {
        let mut fields = data.fields().clone();
        for field in data.server_timestamps() {
            let mut ticks = lock(&self.ticks);
            *ticks += 1;
            let at = self.epoch + Duration::seconds(*ticks);
            fields.insert(field.clone(), Value::String(at.to_rfc3339()));
        }
        fields
    }

    fn evaluate(&self, query: &Query) -> QuerySnapshot {
        let mut docs = self.documents(query.collection_id());

        for order in query.orders().iter().rev() {
            docs.sort_by(|(_, a), (_, b)| {
                let ordering = compare(a.get(&order.field.field_path), b.get(&order.field.field_path));
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = query.max_results() {
            docs.truncate(limit);
        }

        QuerySnapshot::new(
            docs.into_iter()
                .map(|(key, fields)| DocumentSnapshot::new(key, fields))
                .collect(),
        )
    }

    fn notify(&self, collection: &str) {
        let mut feeds = lock(&self.feeds);
        feeds.retain(|feed| !feed.sender.is_closed());
        for feed in feeds.iter().filter(|feed| feed.query.collection_id() == collection) {
            let _ = feed.sender.try_send(Ok(self.evaluate(&feed.query)));
        }
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<DocumentSnapshot>, DocumentError> {
        self.check(collection)?;
        Ok(self
            .documents(collection)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(key, fields)| DocumentSnapshot::new(key, fields)))
    }

    async fn set_document(&self, collection: &str, key: &str, data: &WriteData) -> Result<(), DocumentError> {
        self.check(collection)?;
        let fields = self.resolve(data);
        {
            let mut collections = lock(&self.collections);
            let docs = collections.entry(collection.to_string()).or_default();
            match docs.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = fields,
                None => docs.push((key.to_string(), fields)),
            }
        }
        self.notify(collection);
        Ok(())
    }

    async fn update_document(&self, collection: &str, key: &str, data: &WriteData) -> Result<(), DocumentError> {
        self.check(collection)?;
        let fields = self.resolve(data);
        {
            let mut collections = lock(&self.collections);
            let existing = collections
                .get_mut(collection)
                .and_then(|docs| docs.iter_mut().find(|(k, _)| k == key))
                .map(|(_, existing)| existing)
                .ok_or_else(|| DocumentError::NotFound(format!("No document to update: {}/{}", collection, key)))?;
            existing.extend(fields);
        }
        self.notify(collection);
        Ok(())
    }

    async fn add_document(&self, collection: &str, data: &WriteData) -> Result<String, DocumentError> {
        self.check(collection)?;
        let fields = self.resolve(data);
        let key = {
            let mut collections = lock(&self.collections);
            let docs = collections.entry(collection.to_string()).or_default();
            let key = format!("{}-{}", collection, docs.len() + 1);
            docs.push((key.clone(), fields));
            key
        };
        self.notify(collection);
        Ok(key)
    }

    async fn run_query(&self, query: &Query) -> Result<QuerySnapshot, DocumentError> {
        self.check(query.collection_id())?;
        Ok(self.evaluate(query))
    }

    async fn count(&self, query: &Query) -> Result<u64, DocumentError> {
        self.check(query.collection_id())?;
        Ok(self.documents(query.collection_id()).len() as u64)
    }

    async fn subscribe(&self, query: &Query) -> Result<Subscription, DocumentError> {
        self.check(query.collection_id())?;
        let (sender, receiver) = mpsc::channel(16);
        if !*lock(&self.held) {
            let _ = sender.try_send(Ok(self.evaluate(query)));
        }
        lock(&self.feeds).push(Feed {
            query: query.clone(),
            sender,
        });
        Ok(Subscription::from_receiver(receiver))
    }
}

/// Returns a fixed profile; the code `"expired"` is rejected.
pub struct FakeEnrichment {
    pub profile: LinkedinProfile,
}

impl Default for FakeEnrichment {
    fn default() -> Self {
        Self {
            profile: LinkedinProfile {
                name: "Ana Silva".into(),
                email: "ana@example.com".into(),
                profile_pic: "https://media.example.com/ana.jpg".into(),
            },
        }
    }
}

#[async_trait]
impl EnrichmentService for FakeEnrichment {
    async fn exchange_authorization_code(&self, code: &str) -> Result<LinkedinProfile, EnrichmentError> {
        if code == "expired" {
            return Err(EnrichmentError::ApiError("invalid_grant (code: 400)".into()));
        }
        Ok(self.profile.clone())
    }
}

#[derive(Default)]
pub struct RecordingAlert {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlert {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl Alert for RecordingAlert {
    fn alert(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<String> {
        lock(&self.routes).clone()
    }
}

impl Navigator for RecordingNavigator {
    fn push(&self, route: &str) {
        lock(&self.routes).push(route.to_string());
    }
}
