//! Typed views over the documents the data store reads and writes.
//!
//! Field names match the documents' camelCase keys. Every field has a
//! default so documents written by older clients still deserialize.

use crate::auth::models::Identity;
use crate::enrichment::LinkedinProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const USERS: &str = "users";
pub const BUSINESSES: &str = "businesses";
pub const MESSAGES: &str = "messages";
pub const IDEAS: &str = "ideas";

pub const CREATED_AT: &str = "createdAt";
pub const DISPLAY_NAME: &str = "displayName";

/// Feeds keep only the most recent entries.
pub const FEED_LIMIT: i32 = 100;

const IDEA_DATE_FORMAT: &str = "%a %b %d %Y";

/// A member profile, stored at `users/<uid>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileRecord {
    pub display_name: String,
    pub email: String,
    pub job_title: String,
    pub industry: String,
    pub who_can_contact: String,
    pub bio: String,
    pub profile_pic: String,
    pub linkedin: String,
    pub facebook: String,
    pub twitter: String,
    pub instagram: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl ProfileRecord {
    /// Initial profile for a freshly registered identity.
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            display_name: identity.display_name.clone().unwrap_or_default(),
            email: identity.email.clone().unwrap_or_default(),
            profile_pic: identity.photo_url.clone().unwrap_or_default(),
            ..Self::default()
        }
    }
}

impl From<LinkedinProfile> for ProfileRecord {
    fn from(profile: LinkedinProfile) -> Self {
        Self {
            display_name: profile.name,
            email: profile.email,
            profile_pic: profile.profile_pic,
            ..Self::default()
        }
    }
}

/// An organisation profile, stored at `businesses/<uid>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessRecord {
    pub display_name: String,
    pub email: String,
    pub website: String,
    pub industry: String,
    pub location: String,
    pub description: String,
    pub linkedin: String,
    pub facebook: String,
    pub instagram: String,
    pub twitter: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub user_name: Option<String>,
    pub user_id: String,
    #[serde(rename = "userPhotoURL")]
    pub user_photo_url: Option<String>,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    /// A message authored by `identity`; the timestamp is assigned by the server.
    pub fn authored_by(identity: &Identity, text: impl Into<String>) -> Self {
        Self {
            user_name: identity.display_name.clone(),
            user_id: identity.uid.clone(),
            user_photo_url: identity.photo_url.clone(),
            text: text.into(),
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Idea {
    pub email: Option<String>,
    pub user_name: Option<String>,
    pub user_id: String,
    #[serde(rename = "userPhotoURL")]
    pub user_photo_url: Option<String>,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Idea {
    pub fn authored_by(identity: &Identity, text: impl Into<String>) -> Self {
        Self {
            email: identity.email.clone(),
            user_name: identity.display_name.clone(),
            user_id: identity.uid.clone(),
            user_photo_url: identity.photo_url.clone(),
            text: text.into(),
            created_at: None,
        }
    }
}

/// An idea as listed in the feed, with its creation day spelled out
/// (`Tue Mar 05 2024`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdeaEntry {
    #[serde(flatten)]
    pub idea: Idea,
    pub date: String,
}

impl From<Idea> for IdeaEntry {
    fn from(idea: Idea) -> Self {
        let date = idea
            .created_at
            .map(|at| at.format(IDEA_DATE_FORMAT).to_string())
            .unwrap_or_default();
        Self { idea, date }
    }
}
