use crate::auth::AuthError;
use crate::enrichment::EnrichmentError;
use crate::firestore::DocumentError;
use crate::persist::PersistError;
use thiserror::Error;

/// Errors returned by store actions.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// A record-scoped action ran while no identity was set.
    #[error("No user is signed in")]
    NotSignedIn,
}
