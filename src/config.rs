//! Client configuration.
//!
//! Values come from an optional TOML file, overridden by environment
//! variables prefixed with `FIRE_STATE_` (e.g. `FIRE_STATE_API_KEY`).
//! Endpoint URLs default to the production Google endpoints; point them at
//! the emulator suite or a mock server for local work.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "FIRE_STATE";

const IDENTITY_TOOLKIT_V1_API: &str = "https://identitytoolkit.googleapis.com/v1";
const SECURE_TOKEN_V1_API: &str = "https://securetoken.googleapis.com/v1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FireConfig {
    /// Web API key of the Firebase project.
    pub api_key: String,
    pub project_id: String,
    #[serde(default = "default_identity_toolkit_url")]
    pub identity_toolkit_url: String,
    #[serde(default = "default_secure_token_url")]
    pub secure_token_url: String,
    /// Full `.../documents` URL; derived from `project_id` when unset.
    #[serde(default)]
    pub firestore_url: Option<String>,
    /// Endpoint exchanging LinkedIn authorization codes for profile fields.
    pub enrichment_url: String,
    /// Directory for persisted store snapshots; state is kept in memory when unset.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

fn default_identity_toolkit_url() -> String {
    IDENTITY_TOOLKIT_V1_API.to_string()
}

fn default_secure_token_url() -> String {
    SECURE_TOKEN_V1_API.to_string()
}

impl FireConfig {
    pub fn new(
        api_key: impl Into<String>,
        project_id: impl Into<String>,
        enrichment_url: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            identity_toolkit_url: default_identity_toolkit_url(),
            secure_token_url: default_secure_token_url(),
            firestore_url: None,
            enrichment_url: enrichment_url.into(),
            persist_dir: None,
        }
    }

    /// Loads the configuration from `path` (if given and present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let loaded: FireConfig = settings.try_deserialize()?;
        tracing::debug!(project_id = %loaded.project_id, "configuration loaded");
        Ok(loaded)
    }
}
