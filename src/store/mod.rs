//! Application state: the auth store and the data store.
//!
//! Both stores own their state as a persisted, observable snapshot and
//! talk to the backend only through the service ports, so they run the
//! same against the REST clients and against in-memory fakes.

pub mod auth;
pub mod fire;
pub mod records;


pub use self::auth::{Alert, AuthState, AuthStore};
pub use self::fire::{FireState, FireStore};
pub use self::records::{BusinessRecord, Idea, IdeaEntry, Message, ProfileRecord};
