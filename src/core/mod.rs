pub mod middleware;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct GoogleErrorResponse {
    pub error: GoogleErrorDetails,
}

#[derive(Debug, Deserialize)]
pub struct GoogleErrorDetails {
    pub code: u16,
    pub message: String,
    pub status: Option<String>,
    pub errors: Option<Vec<GoogleSubError>>,
}

#[derive(Debug, Deserialize)]
pub struct GoogleSubError {
    pub message: String,
    pub domain: Option<String>,
    pub reason: Option<String>,
}

/// A non-success response from a Google REST endpoint, reduced to the parts
/// the service modules map onto their own error variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub http_status: u16,
    /// Canonical status such as `PERMISSION_DENIED`, when the body carried one.
    pub status: Option<String>,
    /// Identity Toolkit puts its error code (`EMAIL_NOT_FOUND`, ...) here.
    pub message: String,
}

impl ApiFailure {
    pub fn display_message(&self) -> String {
        match &self.status {
            Some(status) => format!("{} (code: {}, status: {})", self.message, self.http_status, status),
            None => format!("{} (code: {})", self.message, self.http_status),
        }
    }

    /// Whether the canonical status or the HTTP status matches.
    pub fn is(&self, status: &str, http_status: u16) -> bool {
        self.status.as_deref() == Some(status) || self.http_status == http_status
    }
}

fn parse_error_body(text: &str) -> Option<GoogleErrorResponse> {
    if let Ok(resp) = serde_json::from_str::<GoogleErrorResponse>(text) {
        return Some(resp);
    }
    // Streaming endpoints wrap the envelope in an array.
    serde_json::from_str::<Vec<GoogleErrorResponse>>(text)
        .ok()
        .and_then(|mut all| all.pop())
}

pub async fn parse_error_response(response: reqwest::Response, default_msg: &str) -> ApiFailure {
    let http_status = response.status();
    let text = response.text().await.unwrap_or_default();
    match parse_error_body(&text) {
        Some(resp) => ApiFailure {
            http_status: http_status.as_u16(),
            status: resp.error.status,
            message: resp.error.message,
        },
        None => ApiFailure {
            http_status: http_status.as_u16(),
            status: None,
            message: format!("{}: {} {}", default_msg, http_status, text),
        },
    }
}
