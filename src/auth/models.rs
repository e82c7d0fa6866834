use serde::{Deserialize, Serialize};

/// An authenticated principal as seen by the stores.
///
/// The identity provider owns the account; the stores only hold this copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

/// Credential returned by a provider popup, exchanged through `accounts:signInWithIdp`.
#[derive(Debug, Clone, Default)]
pub struct IdpCredential {
    /// Provider id such as `google.com`.
    pub provider_id: String,
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    /// The URI the popup was opened from; Identity Toolkit requires one.
    pub request_uri: String,
}

impl IdpCredential {
    pub(crate) fn post_body(&self) -> String {
        let mut body = url::form_urlencoded::Serializer::new(String::new());
        if let Some(token) = &self.id_token {
            body.append_pair("id_token", token);
        }
        if let Some(token) = &self.access_token {
            body.append_pair("access_token", token);
        }
        body.append_pair("providerId", &self.provider_id);
        body.finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub return_secure_token: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInWithIdpRequest {
    pub post_body: String,
    pub request_uri: String,
    pub return_secure_token: bool,
    pub return_idp_credential: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest<'a> {
    pub id_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<&'a str>,
    pub return_secure_token: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupRequest<'a> {
    pub id_token: &'a str,
}

/// Response shared by `accounts:signUp`, `accounts:signInWithPassword` and
/// `accounts:signInWithIdp`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub local_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_in: String,
}

impl TokenResponse {
    pub fn identity(&self) -> Identity {
        Identity {
            uid: self.local_id.clone(),
            display_name: self.display_name.clone().filter(|name| !name.is_empty()),
            email: self.email.clone(),
            photo_url: self.photo_url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountResponse {
    pub local_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub local_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl From<AccountInfo> for Identity {
    fn from(info: AccountInfo) -> Self {
        Identity {
            uid: info.local_id,
            display_name: info.display_name,
            email: info.email,
            photo_url: info.photo_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LookupResponse {
    pub users: Option<Vec<AccountInfo>>,
}

/// Secure Token API response; unlike Identity Toolkit it uses snake_case.
#[derive(Debug, Deserialize)]
pub struct RefreshTokenResponse {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_in: String,
    pub user_id: Option<String>,
}
