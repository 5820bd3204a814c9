use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The verified identity attached to every authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
}

/// Token verification is an external collaborator; the core only consumes
/// the resulting principal.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, anyhow::Error>;
}

/// Verifies bearer tokens against the identity service.
#[derive(Clone)]
pub struct HttpTokenVerifier {
    http: reqwest::Client,
    verify_url: String,
}

impl HttpTokenVerifier {
    pub fn new(verify_url: impl Into<String>) -> Self {
        HttpTokenVerifier {
            http: reqwest::Client::new(),
            verify_url: verify_url.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, anyhow::Error> {
        let response = self
            .http
            .post(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("token verification failed with {}", response.status());
        }
        Ok(response.json::<Principal>().await?)
    }
}

/// Accepts `token-for:<id>:<email>` tokens. Test/offline collaborator stand-in.
pub struct StaticTokenVerifier;

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, anyhow::Error> {
        let mut parts = token.strip_prefix("token-for:").unwrap_or("").splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(id), Some(email)) if !id.is_empty() && !email.is_empty() => Ok(Principal {
                id: id.to_string(),
                email: email.to_string(),
            }),
            _ => anyhow::bail!("unknown token"),
        }
    }
}

/// Extracts and verifies the bearer token, producing the request principal.
/// A missing token is a 401, a failed verification a 403, with the exact
/// bodies clients rely on.
pub async fn authenticate(
    verifier: &dyn TokenVerifier,
    headers: &HeaderMap,
) -> Result<Principal, AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AppError(
                StatusCode::UNAUTHORIZED,
                anyhow::anyhow!("Authentication token is required."),
            )
        })?;

    verifier.verify(token).await.map_err(|_| {
        AppError(
            StatusCode::FORBIDDEN,
            anyhow::anyhow!("Invalid or expired token"),
        )
    })
}
