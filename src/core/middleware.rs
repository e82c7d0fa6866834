use crate::auth::session::SharedSession;
use http::Extensions;
use reqwest::{header, Request, Response};
use reqwest_middleware::{Middleware, Next};

/// Attaches the signed-in user's ID token to outgoing requests.
///
/// Requests made while nobody is signed in go out without an `Authorization`
/// header, which Firestore evaluates against its security rules as an
/// unauthenticated caller.
#[derive(Clone)]
pub struct SessionMiddleware {
    session: SharedSession,
}

impl SessionMiddleware {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    async fn get_token(&self) -> Result<Option<String>, anyhow::Error> {
        Ok(self.session.id_token().await?)
    }
}

#[async_trait::async_trait]
impl Middleware for SessionMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self.get_token().await.map_err(|e| {
            reqwest_middleware::Error::Middleware(anyhow::anyhow!("Failed to get ID token: {}", e))
        })?;

        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| reqwest_middleware::Error::Middleware(e.into()))?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }

        next.run(req, extensions).await
    }
}
